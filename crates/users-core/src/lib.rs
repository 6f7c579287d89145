//! Domain and account directory for signalrtc.
//!
//! Holds the two startup-loaded identity tables: owned SIP domains (with
//! their aliases) and the accounts that live under them. Accounts carry an
//! HA1 digest, never a plaintext password.

pub mod domains;
pub mod error;
pub mod store;
pub mod types;

pub use domains::DomainRegistry;
pub use error::{Error, Result};
pub use store::{DirectoryStore, SqliteDirectoryStore};
pub use types::{Account, CreateAccountRequest, Domain};

/// Compute the digest-auth HA1 for an account: `MD5(user ":" realm ":" password)`.
///
/// The realm is always the canonical domain name of the account.
pub fn ha1_digest(username: &str, realm: &str, password: &str) -> String {
    md5_hex(format!("{}:{}:{}", username, realm, password).as_bytes())
}

pub(crate) fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ha1_matches_known_vector() {
        // user:192.168.0.50:password
        assert_eq!(
            ha1_digest("user", "192.168.0.50", "password"),
            "bba0da00f6b94f726912a3ab6342da6e"
        );
    }
}
