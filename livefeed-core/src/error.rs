use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Media graph error: {0}")]
    Graph(String),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Session description error: {0}")]
    Sdp(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unrecoverable failure on the shared (non-ingest) path
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
