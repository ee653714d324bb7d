use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Index file not found at {path}")]
    IndexNotFound { path: String },

    #[error("Index file {path} is unreadable: {reason}")]
    IndexCorrupt { path: String, reason: String },

    #[error("Crypto error: {0}")]
    CryptoFailure(String),

    #[error("Malformed key data: {0}")]
    MalformedKeyData(String),

    #[error("No secure random source available: {0}")]
    CryptoUnavailable(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    /// True for errors caused by operator input rather than by a run in progress.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigInvalid(_) | Self::MalformedKeyData(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
