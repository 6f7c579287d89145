//! Per-source abuse counters and the ban ledger.
//!
//! Every remote IP gets a [`BanEntry`] tracking failed registrations,
//! failed call accepts and retransmit storms. Crossing any threshold bans
//! the source; repeat offenders are banned for doubling durations.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

/// Failed REGISTERs (unknown domain/account) allowed before a ban.
pub const REGISTER_FAILURE_THRESHOLD: u32 = 5;
/// Failed call accepts allowed before a ban.
pub const ACCEPT_FAILURE_THRESHOLD: u32 = 5;
/// Request/response retransmits allowed before a ban.
pub const RETRANSMIT_THRESHOLD: u32 = 20;
/// A violation whose request-URI host is a bare IP literal counts this many
/// times. Scanners dial IP literals; real UAs dial hostnames.
pub const RULE_VIOLATION_COUNT_FOR_IPADDRESS: u32 = 3;
/// Idle window after which a signal's counter resets.
pub const BAN_RESET_WINDOW_MINUTES: i64 = 10;
/// First ban duration; doubles on each re-offense.
pub const BAN_BASE_DURATION_MINUTES: i64 = 5;
// Transaction keys remembered per source for retransmit detection.
const RECENT_KEY_WINDOW: usize = 16;

/// Why a source is banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BanReason {
    ExcessiveRegistrationFailures,
    ExcessiveAcceptFailures,
    ExcessiveRetransmits,
}

impl std::fmt::Display for BanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanReason::ExcessiveRegistrationFailures => write!(f, "excessive registration failures"),
            BanReason::ExcessiveAcceptFailures => write!(f, "excessive call accept failures"),
            BanReason::ExcessiveRetransmits => write!(f, "excessive retransmits"),
        }
    }
}

/// Process-local abuse record for one source IP.
#[derive(Debug, Default)]
pub struct BanEntry {
    pub request_count: u64,
    pub response_count: u64,

    pub last_retransmit_at: Option<DateTime<Utc>>,
    pub retransmit_count: u32,

    pub last_reg_failure_at: Option<DateTime<Utc>>,
    pub reg_failure_count: u32,

    pub last_accept_failure_at: Option<DateTime<Utc>>,
    pub accept_failure_count: u32,

    pub banned_at: Option<DateTime<Utc>>,
    pub ban_duration_minutes: i64,
    pub ban_reason: Option<BanReason>,
    /// Lifetime ban count for this source; drives the doubling duration.
    pub ban_counts: u32,

    recent_keys: VecDeque<String>,
}

impl BanEntry {
    fn ban(&mut self, reason: BanReason, now: DateTime<Utc>) {
        self.ban_counts += 1;
        self.banned_at = Some(now);
        self.ban_duration_minutes =
            BAN_BASE_DURATION_MINUTES * 2_i64.pow(self.ban_counts.saturating_sub(1));
        self.ban_reason = Some(reason);
    }

    fn clear_counters(&mut self) {
        self.retransmit_count = 0;
        self.last_retransmit_at = None;
        self.reg_failure_count = 0;
        self.last_reg_failure_at = None;
        self.accept_failure_count = 0;
        self.last_accept_failure_at = None;
        self.banned_at = None;
        self.ban_reason = None;
        self.ban_duration_minutes = 0;
    }

    fn ban_expired(&self, now: DateTime<Utc>) -> bool {
        match self.banned_at {
            Some(at) => now - at > Duration::minutes(self.ban_duration_minutes),
            None => true,
        }
    }
}

/// Optional predicate exempting operator-trusted sources from all counting.
pub type SubnetExemption = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

/// Abuse filter over all remote sources.
#[derive(Clone, Default)]
pub struct AbuseFilter {
    entries: Arc<DashMap<IpAddr, BanEntry>>,
    exemption: Option<SubnetExemption>,
}

impl AbuseFilter {
    pub fn new(exemption: Option<SubnetExemption>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            exemption,
        }
    }

    fn exempt(&self, source: IpAddr) -> bool {
        self.exemption.as_ref().map_or(false, |check| check(source))
    }

    /// Account one received message. `tx_key` identifies the transaction
    /// (`Call-ID|CSeq|branch`); a repeat of a recent key from the same
    /// source is a retransmit.
    pub fn observe_message(&self, source: IpAddr, tx_key: &str, is_request: bool) {
        self.observe_message_at(source, tx_key, is_request, Utc::now())
    }

    fn observe_message_at(
        &self,
        source: IpAddr,
        tx_key: &str,
        is_request: bool,
        now: DateTime<Utc>,
    ) {
        if self.exempt(source) {
            return;
        }
        let mut entry = self.entries.entry(source).or_default();
        release_lapsed_ban(&mut entry, now);
        if is_request {
            entry.request_count += 1;
        } else {
            entry.response_count += 1;
        }

        let seen = entry.recent_keys.iter().any(|key| key == tx_key);
        if seen {
            if let Some(last) = entry.last_retransmit_at {
                if now - last > Duration::minutes(BAN_RESET_WINDOW_MINUTES) {
                    entry.retransmit_count = 0;
                }
            }
            entry.retransmit_count += 1;
            entry.last_retransmit_at = Some(now);
            if entry.retransmit_count >= RETRANSMIT_THRESHOLD && entry.banned_at.is_none() {
                warn!(%source, "source banned: retransmit flood");
                entry.ban(BanReason::ExcessiveRetransmits, now);
            }
        } else {
            entry.recent_keys.push_back(tx_key.to_string());
            if entry.recent_keys.len() > RECENT_KEY_WINDOW {
                entry.recent_keys.pop_front();
            }
        }
    }

    /// Account a failed REGISTER (unknown domain or account).
    pub fn record_register_failure(&self, source: IpAddr, ip_literal_host: bool) {
        self.record_register_failure_at(source, ip_literal_host, Utc::now())
    }

    fn record_register_failure_at(
        &self,
        source: IpAddr,
        ip_literal_host: bool,
        now: DateTime<Utc>,
    ) {
        if self.exempt(source) {
            return;
        }
        let weight = violation_weight(ip_literal_host);
        let mut entry = self.entries.entry(source).or_default();
        release_lapsed_ban(&mut entry, now);
        if let Some(last) = entry.last_reg_failure_at {
            if now - last > Duration::minutes(BAN_RESET_WINDOW_MINUTES) {
                entry.reg_failure_count = 0;
            }
        }
        entry.reg_failure_count += weight;
        entry.last_reg_failure_at = Some(now);
        if entry.reg_failure_count >= REGISTER_FAILURE_THRESHOLD && entry.banned_at.is_none() {
            warn!(%source, count = entry.reg_failure_count, "source banned: registration failures");
            entry.ban(BanReason::ExcessiveRegistrationFailures, now);
        }
    }

    /// Account a failed call accept (no account, dialplan miss).
    pub fn record_accept_failure(&self, source: IpAddr, ip_literal_host: bool) {
        self.record_accept_failure_at(source, ip_literal_host, Utc::now())
    }

    fn record_accept_failure_at(&self, source: IpAddr, ip_literal_host: bool, now: DateTime<Utc>) {
        if self.exempt(source) {
            return;
        }
        let weight = violation_weight(ip_literal_host);
        let mut entry = self.entries.entry(source).or_default();
        release_lapsed_ban(&mut entry, now);
        if let Some(last) = entry.last_accept_failure_at {
            if now - last > Duration::minutes(BAN_RESET_WINDOW_MINUTES) {
                entry.accept_failure_count = 0;
            }
        }
        entry.accept_failure_count += weight;
        entry.last_accept_failure_at = Some(now);
        if entry.accept_failure_count >= ACCEPT_FAILURE_THRESHOLD && entry.banned_at.is_none() {
            warn!(%source, count = entry.accept_failure_count, "source banned: call accept failures");
            entry.ban(BanReason::ExcessiveAcceptFailures, now);
        }
    }

    /// Whether the source is currently banned. An expired ban clears the
    /// counters so the next offense starts from zero; the lifetime ban
    /// count is kept to double the next duration.
    pub fn is_banned(&self, source: IpAddr) -> Option<BanReason> {
        self.is_banned_at(source, Utc::now())
    }

    fn is_banned_at(&self, source: IpAddr, now: DateTime<Utc>) -> Option<BanReason> {
        let mut entry = self.entries.get_mut(&source)?;
        let reason = entry.ban_reason?;
        if entry.ban_expired(now) {
            info!(%source, "ban expired, source re-admitted");
            entry.clear_counters();
            return None;
        }
        Some(reason)
    }

    /// Snapshot for diagnostics.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

fn release_lapsed_ban(entry: &mut BanEntry, now: DateTime<Utc>) {
    if entry.banned_at.is_some() && entry.ban_expired(now) {
        entry.clear_counters();
    }
}

fn violation_weight(ip_literal_host: bool) -> u32 {
    if ip_literal_host {
        RULE_VIOLATION_COUNT_FOR_IPADDRESS
    } else {
        1
    }
}
