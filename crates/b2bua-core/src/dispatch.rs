//! Request classification.
//!
//! Every parsed request lands here once the abuse filter has let it
//! through; the outcome decides which core (or immediate reply) gets it.

use rsip::message::headers_ext::HeadersExt;
use rsip::{Method, Request};

/// Where an incoming request belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Carries a To tag (or is an ACK): belongs to the call manager.
    InDialog,
    Invite,
    Register,
    Subscribe,
    Cancel,
    /// OPTIONS keepalive, answered inline with 200.
    Options,
    /// Everything else: answered 405.
    NotAllowed,
}

pub fn classify(request: &Request) -> Dispatch {
    let has_to_tag = request
        .to_header()
        .ok()
        .and_then(|header| header.tag().ok().flatten())
        .is_some();

    if has_to_tag || request.method == Method::Ack {
        return Dispatch::InDialog;
    }

    match request.method {
        Method::Invite => Dispatch::Invite,
        Method::Register => Dispatch::Register,
        Method::Subscribe => Dispatch::Subscribe,
        Method::Cancel => Dispatch::Cancel,
        Method::Options => Dispatch::Options,
        _ => Dispatch::NotAllowed,
    }
}
