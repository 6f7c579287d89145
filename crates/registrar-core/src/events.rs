//! Failure events the abuse filter subscribes to.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Why a REGISTER did not produce an authenticated binding update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegisterFailureReason {
    /// The To host resolved to no owned domain.
    DomainNotServiced,
    /// The domain is ours but the account does not exist or is disabled.
    Forbidden,
    /// Credentials were missing or wrong; the UA was challenged.
    Unauthenticated,
}

/// Fired once per non-authenticated REGISTER outcome.
#[derive(Debug, Clone)]
pub struct RegisterFailure {
    pub remote: SocketAddr,
    pub reason: RegisterFailureReason,
    /// True when the request-URI host was a bare IP literal.
    pub uri_host_is_ip: bool,
}

pub type RegisterFailureHook = Arc<dyn Fn(&RegisterFailure) + Send + Sync>;

/// Inline, non-blocking callback list. Subscribers must not block: hooks
/// run on the worker that produced the failure.
#[derive(Clone, Default)]
pub struct RegisterFailureHooks {
    hooks: Arc<Mutex<Vec<RegisterFailureHook>>>,
}

impl RegisterFailureHooks {
    pub fn subscribe(&self, hook: RegisterFailureHook) {
        self.hooks.lock().expect("hook list poisoned").push(hook);
    }

    pub fn fire(&self, failure: &RegisterFailure) {
        let hooks = self.hooks.lock().expect("hook list poisoned");
        for hook in hooks.iter() {
            hook(failure);
        }
    }
}
