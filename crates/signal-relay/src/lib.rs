//! WebRTC signalling relay for signalrtc.
//!
//! Browser peers exchange session descriptions and ICE candidates through
//! a durable mailbox, long-polling for the other side's messages. The same
//! HTTP surface carries the small admin API for accounts and the dialplan.

pub mod api;
pub mod error;
pub mod store;

pub use api::{router, serve, ApiState};
pub use error::{RelayError, Result};
pub use store::{SignalStore, SignalType, WebRtcSignal};
