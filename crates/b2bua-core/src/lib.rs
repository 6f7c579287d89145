//! Back-to-back user agent for signalrtc.
//!
//! Terminates incoming call legs, resolves the caller against the
//! directory, consults the scripted dialplan for a destination, originates
//! the outgoing leg and keeps the pair bridged until either side hangs up.

pub mod call;
pub mod call_manager;
pub mod cdr;
pub mod core;
pub mod dialplan;
pub mod dispatch;
pub mod error;
pub mod events;

pub use call::{DialogLeg, LegKey, SipCallStore};
pub use call_manager::{dialog_key_of, CallManager};
pub use cdr::{CallDirection, Cdr, CdrStore};
pub use core::{B2buaConfig, B2buaCore, InviteJob};
pub use dialplan::{
    CallDescriptor, DialplanEvaluator, DialplanRecord, DialplanStore, DEFAULT_DIALPLAN,
    SEED_SCRIPT,
};
pub use dispatch::{classify, Dispatch};
pub use error::{B2buaError, Result};
pub use events::{AcceptCallFailure, AcceptCallFailureHooks, AcceptCallFailureReason};
