//! Error types for registrar-core

use thiserror::Error;

/// Result type alias for registrar operations
pub type Result<T> = std::result::Result<T, RegistrarError>;

/// Main error type for registrar operations
#[derive(Error, Debug)]
pub enum RegistrarError {
    /// Request is missing a header the pipeline needs
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Directory error
    #[error("directory error: {0}")]
    Directory(#[from] signalrtc_users_core::Error),
}
