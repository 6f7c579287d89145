//! Error types for the signal relay

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid signal type: {0}")]
    InvalidSignalType(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
