use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Request error: {0}")]
    Gateway(#[from] crate::gateway::Error),

    #[error("Send error: {0}")]
    Send(#[from] crate::conversation::SendError),

    #[error("Authorization error: {0}")]
    Authorization(#[from] crate::authorization::SequencerError),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::workflow::CacheError),

    #[error("Session storage error: {0}")]
    Storage(#[from] crate::auth::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
