//! Directory record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An owned SIP domain. Loaded once at startup and immutable during a run;
/// edits require a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,

    /// Canonical name. Unique across the table.
    pub name: String,

    /// Alternate hosts resolving to this domain. An alias claimed by two
    /// domains is honored by the first and dropped with a warning.
    pub aliases: Vec<String>,
}

/// A SIP account under one domain.
///
/// `ha1_digest` is `MD5(username ":" realm ":" password)` with the domain
/// name as realm. The plaintext password exists only transiently during
/// create/update and is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub domain_id: String,
    pub username: String,
    pub ha1_digest: String,
    pub disabled: bool,
    pub inserted: DateTime<Utc>,
}

impl Account {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Parameters for creating an account. The password is hashed into HA1
/// before anything reaches the store.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccountRequest {
    pub username: String,
    pub domain_id: String,
    pub password: String,
}
