//! Store-and-forward mailbox for browser-peer signalling.
//!
//! Messages are queued per `(from, to)` pair. A new SDP offer restarts the
//! exchange: every queued message for either direction of the pair is
//! purged first. Delivery stamps `delivered_at`, so each message is
//! handed out exactly once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// What a queued message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalType {
    Sdp,
    Ice,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Sdp => "sdp",
            SignalType::Ice => "ice",
        }
    }

    pub fn parse(text: &str) -> Result<Option<Self>> {
        match text.to_ascii_lowercase().as_str() {
            "sdp" => Ok(Some(SignalType::Sdp)),
            "ice" => Ok(Some(SignalType::Ice)),
            "any" => Ok(None),
            other => Err(RelayError::InvalidSignalType(other.to_string())),
        }
    }
}

/// A queued signalling message.
#[derive(Debug, Clone, Serialize)]
pub struct WebRtcSignal {
    pub id: String,
    pub from: String,
    pub to: String,
    pub signal_type: String,
    pub body: String,
    pub inserted: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SignalStore {
    pool: SqlitePool,
}

impl SignalStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS webrtc_signals (
                id           TEXT PRIMARY KEY,
                from_id      TEXT NOT NULL,
                to_id        TEXT NOT NULL,
                signal_type  TEXT NOT NULL,
                body         TEXT NOT NULL,
                inserted     TIMESTAMP NOT NULL,
                delivered_at TIMESTAMP
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Queue an SDP message. An offer purges both directions of the pair
    /// first, so stale answers and candidates never reach either peer.
    pub async fn put_sdp(&self, from: &str, to: &str, body: &str) -> Result<()> {
        if is_sdp_offer(body) {
            let purged = sqlx::query(
                "DELETE FROM webrtc_signals
                 WHERE (from_id = ? AND to_id = ?) OR (from_id = ? AND to_id = ?)",
            )
            .bind(from)
            .bind(to)
            .bind(to)
            .bind(from)
            .execute(&self.pool)
            .await?;
            debug!(from, to, purged = purged.rows_affected(), "offer purged prior signals");
        }
        self.insert(from, to, SignalType::Sdp, body).await
    }

    /// Queue an ICE candidate.
    pub async fn put_ice(&self, from: &str, to: &str, body: &str) -> Result<()> {
        self.insert(from, to, SignalType::Ice, body).await
    }

    async fn insert(&self, from: &str, to: &str, signal_type: SignalType, body: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO webrtc_signals (id, from_id, to_id, signal_type, body, inserted)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(from)
        .bind(to)
        .bind(signal_type.as_str())
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The oldest undelivered message from `from` to `to`, optionally
    /// filtered by type. Stamps `delivered_at`: a second call returns
    /// nothing until a new message arrives.
    pub async fn get_next(
        &self,
        to: &str,
        from: &str,
        signal_type: Option<SignalType>,
    ) -> Result<Option<String>> {
        loop {
            let row = match signal_type {
                Some(kind) => {
                    sqlx::query(
                        "SELECT id, body FROM webrtc_signals
                         WHERE to_id = ? AND from_id = ? AND signal_type = ?
                           AND delivered_at IS NULL
                         ORDER BY inserted LIMIT 1",
                    )
                    .bind(to)
                    .bind(from)
                    .bind(kind.as_str())
                    .fetch_optional(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query(
                        "SELECT id, body FROM webrtc_signals
                         WHERE to_id = ? AND from_id = ? AND delivered_at IS NULL
                         ORDER BY inserted LIMIT 1",
                    )
                    .bind(to)
                    .bind(from)
                    .fetch_optional(&self.pool)
                    .await?
                }
            };

            let Some(row) = row else {
                return Ok(None);
            };
            let id: String = row.get("id");
            let body: String = row.get("body");

            // The delivered_at guard makes delivery exactly-once even when
            // two pollers race for the same message.
            let claimed = sqlx::query(
                "UPDATE webrtc_signals SET delivered_at = ?
                 WHERE id = ? AND delivered_at IS NULL",
            )
            .bind(Utc::now())
            .bind(&id)
            .execute(&self.pool)
            .await?;
            if claimed.rows_affected() == 1 {
                return Ok(Some(body));
            }
            // Lost the race; try the next message.
        }
    }

    /// Every queued row for a pair, for diagnostics and tests.
    pub async fn pending_for_pair(&self, a: &str, b: &str) -> Result<Vec<WebRtcSignal>> {
        let rows = sqlx::query(
            "SELECT id, from_id, to_id, signal_type, body, inserted, delivered_at
             FROM webrtc_signals
             WHERE (from_id = ? AND to_id = ?) OR (from_id = ? AND to_id = ?)
             ORDER BY inserted",
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WebRtcSignal {
                id: row.get("id"),
                from: row.get("from_id"),
                to: row.get("to_id"),
                signal_type: row.get("signal_type"),
                body: row.get("body"),
                inserted: row.get("inserted"),
                delivered_at: row.get("delivered_at"),
            })
            .collect())
    }
}

/// True when the body is a JSON session description of type `offer`.
fn is_sdp_offer(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("type")
                .and_then(|kind| kind.as_str())
                .map(|kind| kind.eq_ignore_ascii_case("offer"))
        })
        .unwrap_or(false)
}
