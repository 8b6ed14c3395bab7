use thiserror::Error;

/// Failures of the shared-memory frame ring.
#[derive(Debug, Error)]
pub enum RingError {
    /// The mapping handed to the writer or reader is shorter than the
    /// header page plus the slot array it claims to hold.
    #[error("ring mapping of {got} bytes is smaller than the required {needed}")]
    MappingTooSmall { needed: usize, got: usize },

    /// Header fields do not describe a valid NV21 ring.
    #[error("corrupt ring header: {reason}")]
    BadHeader { reason: String },
}
