use thiserror::Error;

#[derive(Error, Debug)]
pub enum SetError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Verification { expected: i64, actual: i64 },

    #[error("Worker thread failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SetError>;
