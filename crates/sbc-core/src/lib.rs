//! Abuse detection for signalrtc.
//!
//! Watches transport traffic and registrar/B2BUA failure events, keeps a
//! per-source ledger and bans sources that cross the configured thresholds.
//! Banned traffic is dropped silently before dispatch.

pub mod ban;

pub use ban::{
    AbuseFilter, BanEntry, BanReason, SubnetExemption, ACCEPT_FAILURE_THRESHOLD,
    BAN_BASE_DURATION_MINUTES, BAN_RESET_WINDOW_MINUTES, REGISTER_FAILURE_THRESHOLD,
    RETRANSMIT_THRESHOLD, RULE_VIOLATION_COUNT_FOR_IPADDRESS,
};
