//! Call detail records: created when a leg's transaction begins, mutated on
//! progress/answer/hangup, never deleted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;

/// Which side of the B2BUA a leg sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallDirection {
    /// We answered the transaction (caller side).
    Uas,
    /// We originated the transaction (destination side).
    Uac,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Uas => "uas",
            CallDirection::Uac => "uac",
        }
    }

    pub fn from_str(text: &str) -> Self {
        match text {
            "uac" => CallDirection::Uac,
            _ => CallDirection::Uas,
        }
    }
}

/// One call leg's accounting record.
#[derive(Debug, Clone, Serialize)]
pub struct Cdr {
    pub id: String,
    pub direction: CallDirection,
    pub created: DateTime<Utc>,
    pub destination_uri: String,
    pub from_header: String,
    pub call_id: String,
    pub local_socket: String,
    pub remote_socket: String,
    pub bridge_id: Option<String>,

    pub progress_at: Option<DateTime<Utc>>,
    pub progress_status: Option<u16>,
    pub progress_reason: Option<String>,
    pub ring_duration_secs: Option<i64>,

    pub answered_at: Option<DateTime<Utc>>,
    pub answered_status: Option<u16>,
    pub answered_reason: Option<String>,
    pub duration_secs: Option<i64>,

    pub hungup_at: Option<DateTime<Utc>>,
    pub hungup_reason: Option<String>,
}

/// Write-through CDR persistence.
#[derive(Clone)]
pub struct CdrStore {
    pool: SqlitePool,
}

impl CdrStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cdrs (
                id               TEXT PRIMARY KEY,
                direction        TEXT NOT NULL,
                created          TIMESTAMP NOT NULL,
                destination_uri  TEXT NOT NULL,
                from_header      TEXT NOT NULL,
                call_id          TEXT NOT NULL,
                local_socket     TEXT NOT NULL,
                remote_socket    TEXT NOT NULL,
                bridge_id        TEXT,
                progress_at      TIMESTAMP,
                progress_status  INTEGER,
                progress_reason  TEXT,
                ring_duration    INTEGER,
                answered_at      TIMESTAMP,
                answered_status  INTEGER,
                answered_reason  TEXT,
                duration         INTEGER,
                hungup_at        TIMESTAMP,
                hungup_reason    TEXT
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Open a CDR at transaction start.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        direction: CallDirection,
        destination_uri: &str,
        from_header: &str,
        call_id: &str,
        local_socket: &str,
        remote_socket: &str,
        bridge_id: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO cdrs
             (id, direction, created, destination_uri, from_header, call_id,
              local_socket, remote_socket, bridge_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(direction.as_str())
        .bind(Utc::now())
        .bind(destination_uri)
        .bind(from_header)
        .bind(call_id)
        .bind(local_socket)
        .bind(remote_socket)
        .bind(bridge_id)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn set_bridge(&self, cdr_id: &str, bridge_id: &str) -> Result<()> {
        sqlx::query("UPDATE cdrs SET bridge_id = ? WHERE id = ?")
            .bind(bridge_id)
            .bind(cdr_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// A provisional (1xx) response moved the call forward.
    pub async fn progress(&self, cdr_id: &str, status: u16, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE cdrs SET progress_at = ?, progress_status = ?, progress_reason = ?
             WHERE id = ? AND progress_at IS NULL",
        )
        .bind(Utc::now())
        .bind(status as i64)
        .bind(reason)
        .bind(cdr_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The leg answered. Ring duration counts from creation (or progress).
    pub async fn answered(&self, cdr_id: &str, status: u16, reason: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE cdrs SET answered_at = ?, answered_status = ?, answered_reason = ?,
                 ring_duration = CAST(strftime('%s', ?) AS INTEGER)
                                 - CAST(strftime('%s', COALESCE(progress_at, created)) AS INTEGER)
             WHERE id = ?",
        )
        .bind(now)
        .bind(status as i64)
        .bind(reason)
        .bind(now)
        .bind(cdr_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The leg ended. Duration counts from answer when there was one.
    pub async fn hungup(&self, cdr_id: &str, reason: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE cdrs SET hungup_at = ?, hungup_reason = ?,
                 duration = CASE WHEN answered_at IS NULL THEN NULL
                     ELSE CAST(strftime('%s', ?) AS INTEGER)
                          - CAST(strftime('%s', answered_at) AS INTEGER) END
             WHERE id = ?",
        )
        .bind(now)
        .bind(reason)
        .bind(now)
        .bind(cdr_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, cdr_id: &str) -> Result<Option<Cdr>> {
        let row = sqlx::query("SELECT * FROM cdrs WHERE id = ?")
            .bind(cdr_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_cdr))
    }

    pub async fn for_bridge(&self, bridge_id: &str) -> Result<Vec<Cdr>> {
        let rows = sqlx::query("SELECT * FROM cdrs WHERE bridge_id = ? ORDER BY created")
            .bind(bridge_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_cdr).collect())
    }
}

fn row_to_cdr(row: sqlx::sqlite::SqliteRow) -> Cdr {
    Cdr {
        id: row.get("id"),
        direction: CallDirection::from_str(&row.get::<String, _>("direction")),
        created: row.get("created"),
        destination_uri: row.get("destination_uri"),
        from_header: row.get("from_header"),
        call_id: row.get("call_id"),
        local_socket: row.get("local_socket"),
        remote_socket: row.get("remote_socket"),
        bridge_id: row.get("bridge_id"),
        progress_at: row.get("progress_at"),
        progress_status: row.get::<Option<i64>, _>("progress_status").map(|v| v as u16),
        progress_reason: row.get("progress_reason"),
        ring_duration_secs: row.get("ring_duration"),
        answered_at: row.get("answered_at"),
        answered_status: row.get::<Option<i64>, _>("answered_status").map(|v| v as u16),
        answered_reason: row.get("answered_reason"),
        duration_secs: row.get("duration"),
        hungup_at: row.get("hungup_at"),
        hungup_reason: row.get("hungup_reason"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single connection: pooled sqlite::memory: connections do not share
    // a database.
    async fn store() -> CdrStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        CdrStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn lifecycle_is_recorded() {
        let store = store().await;
        let id = store
            .create(
                CallDirection::Uas,
                "sip:100@192.168.0.48",
                "<sip:caller@1.2.3.4>",
                "call-1",
                "192.168.0.50:5060",
                "1.2.3.4:5060",
                None,
            )
            .await
            .unwrap();

        store.progress(&id, 180, "Ringing").await.unwrap();
        store.answered(&id, 200, "OK").await.unwrap();
        store.hungup(&id, "BYE").await.unwrap();

        let cdr = store.get(&id).await.unwrap().unwrap();
        assert_eq!(cdr.progress_status, Some(180));
        assert_eq!(cdr.answered_status, Some(200));
        assert_eq!(cdr.hungup_reason.as_deref(), Some("BYE"));
        assert!(cdr.duration_secs.is_some());
    }

    #[tokio::test]
    async fn bridge_links_two_legs() {
        let store = store().await;
        let a = store
            .create(CallDirection::Uas, "sip:100@x", "<sip:a@y>", "ca", "l", "r", Some("bridge-1"))
            .await
            .unwrap();
        let b = store
            .create(CallDirection::Uac, "sip:100@x", "<sip:a@y>", "cb", "l", "r", Some("bridge-1"))
            .await
            .unwrap();

        let legs = store.for_bridge("bridge-1").await.unwrap();
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().any(|cdr| cdr.id == a));
        assert!(legs.iter().any(|cdr| cdr.id == b));
    }

    #[tokio::test]
    async fn unanswered_call_has_no_duration() {
        let store = store().await;
        let id = store
            .create(CallDirection::Uac, "sip:x@y", "<sip:a@b>", "cc", "l", "r", None)
            .await
            .unwrap();
        store.hungup(&id, "486 Busy Here").await.unwrap();

        let cdr = store.get(&id).await.unwrap().unwrap();
        assert!(cdr.answered_at.is_none());
        assert!(cdr.duration_secs.is_none());
        assert!(cdr.hungup_at.is_some());
    }
}
