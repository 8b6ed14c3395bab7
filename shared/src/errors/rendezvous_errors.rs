use thiserror::Error;

use crate::errors::RingError;

/// Failures of the one-shot descriptor handshake with the feeder.
///
/// All of these are operational-transient on the consumer side: the caller
/// drops the attempt and the next capture retries from scratch.
#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("no rendezvous endpoint reachable: {0}")]
    Connect(std::io::Error),

    #[error("receive on rendezvous socket failed: {0}")]
    Recv(std::io::Error),

    #[error("rendezvous reply carried no descriptor")]
    NoDescriptor,

    #[error("unexpected rendezvous payload of {0} bytes")]
    BadPayload(usize),

    #[error("mapping the ring descriptor failed: {0}")]
    Map(std::io::Error),

    #[error(transparent)]
    Ring(#[from] RingError),
}
