//! Error types for the B2BUA core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, B2buaError>;

#[derive(Error, Debug)]
pub enum B2buaError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("dialplan error: {0}")]
    Dialplan(String),

    #[error("destination unresolvable: {0}")]
    Unresolvable(String),

    #[error("dialog not found")]
    DialogNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("directory error: {0}")]
    Directory(#[from] signalrtc_users_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] signalrtc_sip_transport::Error),
}
