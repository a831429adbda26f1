use thiserror::Error;

#[derive(Error, Debug)]
pub enum RawError {
    #[error("malformed container structure: {0}")]
    Structural(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dimension mismatch: expected {expected} channels, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("unsupported encoding: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, RawError>;
