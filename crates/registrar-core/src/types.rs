//! Core types for registration handling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted mapping from an account to a reachable contact URI.
///
/// Invariant: `expiry_time = last_update + expiry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: String,
    pub account_id: String,

    /// The contact URI the UA asked to be reached at.
    pub contact_uri: String,

    /// Client software identification, empty when the UA sent none.
    pub user_agent: String,

    /// Honored expiry in seconds after clamping.
    pub expiry: u32,
    pub expiry_time: DateTime<Utc>,

    /// Socket the REGISTER arrived from.
    pub remote_socket: String,
    /// Proxy socket when the request was relayed, else the remote socket.
    pub proxy_socket: String,
    /// Local socket the registrar answered on.
    pub registrar_socket: String,

    pub last_update: DateTime<Utc>,
}

impl Binding {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Seconds until this binding lapses, zero when already lapsed.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> u32 {
        (self.expiry_time - now).num_seconds().max(0) as u32
    }
}

/// Configuration for the registrar service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    /// Expiry applied when a REGISTER carries none.
    pub default_expiry: u32,
    /// Floor below which REGISTERs are rejected with 423.
    pub min_expiry: u32,
    /// Ceiling the honored expiry is clamped to.
    pub max_expiry: u32,
    /// Bindings kept per account; the oldest is expelled on overflow.
    pub max_bindings_per_account: usize,
    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// REGISTER queue capacity.
    pub max_register_queue: usize,
    /// SUBSCRIBE queue capacity.
    pub max_subscribe_queue: usize,
    /// Worker tasks per core.
    pub worker_count: usize,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            default_expiry: 3600,
            min_expiry: 60,
            max_expiry: 7200,
            max_bindings_per_account: 10,
            sweep_interval_secs: 5,
            max_register_queue: 1000,
            max_subscribe_queue: 100,
            worker_count: 4,
        }
    }
}
