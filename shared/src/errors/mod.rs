mod config_errors;
mod rendezvous_errors;
mod ring_errors;

pub use config_errors::ConfigError;
pub use rendezvous_errors::RendezvousError;
pub use ring_errors::RingError;
