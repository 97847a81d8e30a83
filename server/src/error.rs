use shared::CodecError;
use thiserror::Error;

/// Errors surfaced to callers of [`crate::server::Server`].
///
/// Everything else (bad messages, failed sends, failing commands) is handled
/// inside the loop where it happens and only logged.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no connected client with id {0}")]
    UnknownClient(u32),

    #[error("failed to pack message: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
