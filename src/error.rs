use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConvError {
    /// A resident (static lifetime) buffer could not be acquired while building.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// A scratch (dynamic lifetime) buffer could not be acquired during resize.
    #[error("out of memory acquiring {0}")]
    OutOfMemory(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("invalid quantization table: {0}")]
    InvalidQuantTable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("execute called before resize")]
    NotResized,

    #[error("executor is not valid")]
    Invalid,
}
