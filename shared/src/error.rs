use thiserror::Error;

/// Failures while packing or unpacking a message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("header must be {expected} bytes, got {actual}")]
    HeaderSize { expected: usize, actual: usize },

    #[error("{field} '{value}' exceeds {max} bytes")]
    NameTooLong {
        field: &'static str,
        value: String,
        max: usize,
    },

    #[error("body is {actual} bytes but header declares {declared}")]
    BodySize { declared: u64, actual: usize },

    #[error("body CRC mismatch: header {expected:#018x}, computed {actual:#018x}")]
    CrcMismatch { expected: u64, actual: u64 },

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid transform name '{0}'")]
    InvalidTransformName(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}
