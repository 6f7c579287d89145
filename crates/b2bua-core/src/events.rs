//! Call-accept failure events the abuse filter subscribes to.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Why an INVITE never became a bridged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcceptCallFailureReason {
    /// The caller's host is ours but no account matches.
    NoSipAccount,
    /// The dialplan returned no destination.
    NotFound,
}

/// Fired once per rejected INVITE.
#[derive(Debug, Clone)]
pub struct AcceptCallFailure {
    pub remote: SocketAddr,
    pub reason: AcceptCallFailureReason,
    /// True when the request-URI host was a bare IP literal.
    pub uri_host_is_ip: bool,
}

pub type AcceptCallFailureHook = Arc<dyn Fn(&AcceptCallFailure) + Send + Sync>;

/// Inline, non-blocking callback list.
#[derive(Clone, Default)]
pub struct AcceptCallFailureHooks {
    hooks: Arc<Mutex<Vec<AcceptCallFailureHook>>>,
}

impl AcceptCallFailureHooks {
    pub fn subscribe(&self, hook: AcceptCallFailureHook) {
        self.hooks.lock().expect("hook list poisoned").push(hook);
    }

    pub fn fire(&self, failure: &AcceptCallFailure) {
        let hooks = self.hooks.lock().expect("hook list poisoned");
        for hook in hooks.iter() {
            hook(failure);
        }
    }
}
