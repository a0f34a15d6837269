use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("chunk index {index} out of range ({count} chunks)")]
    InvalidChunkIndex { index: usize, count: usize },

    #[error("position {position} beyond readable range")]
    InvalidPosition { position: u64 },

    #[error("chunk {0} not found in store")]
    MissingChunk(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("failed to store chunk {0}")]
    StorePut(String),

    #[error("failed to delete chunk {0}")]
    StoreDelete(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("data map error: {0}")]
    DataMap(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
