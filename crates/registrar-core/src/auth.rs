//! Digest authentication against stored HA1 digests.
//!
//! Challenges carry a server-issued nonce with a bounded lifetime. The
//! expected response is computed from the account's HA1, so plaintext
//! passwords never participate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rsip::headers::auth::{self, AuthQop, Qop};
use rsip::headers::ToTypedHeader;
use rsip::{typed, Request};
use tracing::{debug, warn};

const NONCE_TTL: Duration = Duration::from_secs(300);

/// Outcome of one authentication attempt.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Credentials verified against the account HA1.
    Authenticated,
    /// No or unusable credentials: answer 401 with this challenge.
    Challenge(typed::WwwAuthenticate),
    /// The supplied username does not belong to the account: terminal 403.
    Forbidden,
}

/// Issues nonces and verifies digest responses.
pub struct DigestAuthenticator {
    counter: AtomicU64,
    nonces: Mutex<HashMap<String, Instant>>,
}

impl Default for DigestAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl DigestAuthenticator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a nonce and remember it for verification.
    fn issue_nonce(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        let entropy: u64 = rand::random();
        let raw = format!("{}:{}:{}:{}", seq, now.as_nanos(), entropy, std::process::id());
        let nonce = md5_hex(raw.as_bytes());

        let mut guard = self.nonces.lock().expect("nonce table poisoned");
        guard.retain(|_, issued| issued.elapsed() < NONCE_TTL);
        guard.insert(nonce.clone(), Instant::now());
        nonce
    }

    fn nonce_is_valid(&self, nonce: &str) -> bool {
        let mut guard = self.nonces.lock().expect("nonce table poisoned");
        guard.retain(|_, issued| issued.elapsed() < NONCE_TTL);
        guard.contains_key(nonce)
    }

    fn invalidate(&self, nonce: &str) {
        let mut guard = self.nonces.lock().expect("nonce table poisoned");
        guard.remove(nonce);
    }

    /// Build a 401 challenge for the realm. Every call carries a fresh
    /// nonce.
    pub fn challenge(&self, realm: &str, stale: bool) -> typed::WwwAuthenticate {
        typed::WwwAuthenticate {
            scheme: auth::Scheme::Digest,
            realm: realm.to_string(),
            domain: None,
            nonce: self.issue_nonce(),
            opaque: None,
            stale: stale.then(|| "true".into()),
            algorithm: Some(auth::Algorithm::Md5),
            qop: Some(Qop::Auth),
            charset: None,
        }
    }

    /// Verify the request's Authorization header against the account.
    ///
    /// `expected_username` is the account's username; a credential naming a
    /// different user is a terminal 403 rather than another challenge.
    pub fn authenticate(
        &self,
        request: &Request,
        realm: &str,
        expected_username: &str,
        ha1_digest: &str,
    ) -> AuthOutcome {
        let Some(header) = request.headers.iter().find_map(|header| match header {
            rsip::Header::Authorization(value) => Some(value.clone()),
            _ => None,
        }) else {
            return AuthOutcome::Challenge(self.challenge(realm, false));
        };

        let authorization = match header.typed() {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "malformed Authorization header");
                return AuthOutcome::Challenge(self.challenge(realm, false));
            }
        };

        if authorization.scheme != auth::Scheme::Digest {
            return AuthOutcome::Challenge(self.challenge(realm, false));
        }
        if !authorization.realm.eq_ignore_ascii_case(realm) {
            return AuthOutcome::Challenge(self.challenge(realm, false));
        }
        if !authorization
            .username
            .eq_ignore_ascii_case(expected_username)
        {
            warn!(expected = %expected_username, received = %authorization.username,
                "digest username mismatch");
            return AuthOutcome::Forbidden;
        }
        if let Some(algorithm) = authorization.algorithm {
            if algorithm != auth::Algorithm::Md5 {
                return AuthOutcome::Challenge(self.challenge(realm, false));
            }
        }
        if !self.nonce_is_valid(&authorization.nonce) {
            return AuthOutcome::Challenge(self.challenge(realm, true));
        }

        let expected = match compute_digest_response(&authorization, request, ha1_digest) {
            Ok(value) => value,
            Err(reason) => {
                debug!(reason, "unsupported digest parameters");
                self.invalidate(&authorization.nonce);
                return AuthOutcome::Challenge(self.challenge(realm, false));
            }
        };

        let provided = authorization.response.to_ascii_lowercase();
        if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            self.invalidate(&authorization.nonce);
            AuthOutcome::Authenticated
        } else {
            debug!(user = %expected_username, "digest response mismatch");
            AuthOutcome::Challenge(self.challenge(realm, false))
        }
    }
}

/// Compute the expected digest response from a stored HA1.
fn compute_digest_response(
    authorization: &typed::Authorization,
    request: &Request,
    ha1: &str,
) -> Result<String, &'static str> {
    let method = request.method.to_string();
    let uri = authorization.uri.to_string();
    let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());

    match &authorization.qop {
        Some(AuthQop::Auth { cnonce, nc }) => {
            let nc_str = format!("{:08x}", nc);
            Ok(md5_hex(
                format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1, authorization.nonce, nc_str, cnonce, "auth", ha2
                )
                .as_bytes(),
            ))
        }
        Some(AuthQop::AuthInt { .. }) => Err("qop auth-int not supported"),
        None => Ok(md5_hex(
            format!("{}:{}:{}", ha1, authorization.nonce, ha2).as_bytes(),
        )),
    }
}

fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    const REALM: &str = "192.168.0.50";
    const USERNAME: &str = "user";
    // MD5("user:192.168.0.50:password")
    const HA1: &str = "bba0da00f6b94f726912a3ab6342da6e";

    fn register(authorization: Option<String>) -> Request {
        let auth_line = authorization
            .map(|value| format!("Authorization: {}\r\n", value))
            .unwrap_or_default();
        let raw = format!(
            "REGISTER sip:192.168.0.50 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKnashds7\r\n\
             From: <sip:user@192.168.0.50>;tag=a73kszlfl\r\n\
             To: <sip:user@192.168.0.50>\r\n\
             Call-ID: 1j9FpLxk3uxtm8tn@1.2.3.4\r\n\
             CSeq: 1 REGISTER\r\n\
             {}Contact: <sip:user@1.2.3.4:5060>\r\n\
             Expires: 3600\r\n\
             Content-Length: 0\r\n\r\n",
            auth_line
        );
        match rsip::SipMessage::try_from(raw.as_str()).unwrap() {
            rsip::SipMessage::Request(request) => request,
            _ => unreachable!(),
        }
    }

    fn digest_for(nonce: &str, username: &str) -> String {
        let uri = "sip:192.168.0.50";
        let ha1 = md5_hex(format!("{}:{}:{}", USERNAME, REALM, "password").as_bytes());
        let ha2 = md5_hex(format!("REGISTER:{}", uri).as_bytes());
        let response = md5_hex(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes());
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, REALM, nonce, uri, response
        )
    }

    #[test]
    fn missing_credentials_get_fresh_challenges() {
        let authenticator = DigestAuthenticator::new();
        let request = register(None);

        let first = match authenticator.authenticate(&request, REALM, USERNAME, HA1) {
            AuthOutcome::Challenge(challenge) => challenge,
            other => panic!("expected challenge, got {:?}", other),
        };
        let second = match authenticator.authenticate(&request, REALM, USERNAME, HA1) {
            AuthOutcome::Challenge(challenge) => challenge,
            other => panic!("expected challenge, got {:?}", other),
        };

        assert_eq!(first.realm, REALM);
        // Back-to-back challenges must never reuse a nonce.
        assert_ne!(first.nonce, second.nonce);
    }

    #[test]
    fn valid_digest_authenticates() {
        let authenticator = DigestAuthenticator::new();
        let nonce = authenticator.issue_nonce();
        let request = register(Some(digest_for(&nonce, USERNAME)));

        assert!(matches!(
            authenticator.authenticate(&request, REALM, USERNAME, HA1),
            AuthOutcome::Authenticated
        ));
    }

    #[test]
    fn nonce_is_single_use() {
        let authenticator = DigestAuthenticator::new();
        let nonce = authenticator.issue_nonce();
        let request = register(Some(digest_for(&nonce, USERNAME)));

        assert!(matches!(
            authenticator.authenticate(&request, REALM, USERNAME, HA1),
            AuthOutcome::Authenticated
        ));
        // Replay of the same credentials is challenged as stale.
        match authenticator.authenticate(&request, REALM, USERNAME, HA1) {
            AuthOutcome::Challenge(challenge) => assert!(challenge.stale.is_some()),
            other => panic!("expected stale challenge, got {:?}", other),
        }
    }

    #[test]
    fn wrong_password_is_rechallenged() {
        let authenticator = DigestAuthenticator::new();
        let nonce = authenticator.issue_nonce();
        let request = register(Some(digest_for(&nonce, USERNAME)));
        let wrong_ha1 = md5_hex(b"user:192.168.0.50:hunter2");

        assert!(matches!(
            authenticator.authenticate(&request, REALM, USERNAME, &wrong_ha1),
            AuthOutcome::Challenge(_)
        ));
    }

    #[test]
    fn foreign_username_is_forbidden() {
        let authenticator = DigestAuthenticator::new();
        let nonce = authenticator.issue_nonce();
        let request = register(Some(digest_for(&nonce, "mallory")));

        assert!(matches!(
            authenticator.authenticate(&request, REALM, USERNAME, HA1),
            AuthOutcome::Forbidden
        ));
    }

    #[test]
    fn unknown_nonce_marked_stale() {
        let authenticator = DigestAuthenticator::new();
        let request = register(Some(digest_for("deadbeef", USERNAME)));

        match authenticator.authenticate(&request, REALM, USERNAME, HA1) {
            AuthOutcome::Challenge(challenge) => assert!(challenge.stale.is_some()),
            other => panic!("expected stale challenge, got {:?}", other),
        }
    }
}
