//! Error types for the directory crate

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No domains were found at startup; the service cannot run without one.
    #[error("domain table is empty")]
    NoDomains,

    #[error("domain not found: {0}")]
    DomainNotFound(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {username}@{domain_id}")]
    AccountExists { username: String, domain_id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
