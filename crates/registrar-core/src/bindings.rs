//! Durable store of contact bindings and the expiry sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{Binding, RegistrarConfig};

/// One contact from a REGISTER, with its per-contact expires parameter.
#[derive(Debug, Clone)]
pub struct ContactRegistration {
    pub uri: String,
    pub expires_param: Option<u32>,
}

/// Everything the store needs to arbitrate one REGISTER.
#[derive(Debug, Clone)]
pub struct BindingUpdate {
    pub account_id: String,
    pub contacts: Vec<ContactRegistration>,
    /// Request-level Expires header, used when a contact has no parameter.
    pub header_expires: Option<u32>,
    pub user_agent: String,
    pub remote_socket: String,
    pub proxy_socket: String,
    pub registrar_socket: String,
}

/// SQLite-backed binding manager.
#[derive(Clone)]
pub struct BindingStore {
    pool: SqlitePool,
    config: RegistrarConfig,
}

impl BindingStore {
    pub async fn new(pool: SqlitePool, config: RegistrarConfig) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS bindings (
                id               TEXT PRIMARY KEY,
                account_id       TEXT NOT NULL,
                contact_uri      TEXT NOT NULL,
                user_agent       TEXT NOT NULL DEFAULT '',
                expiry           INTEGER NOT NULL,
                expiry_time      TIMESTAMP NOT NULL,
                remote_socket    TEXT NOT NULL,
                proxy_socket     TEXT NOT NULL,
                registrar_socket TEXT NOT NULL,
                last_update      TIMESTAMP NOT NULL,
                UNIQUE (account_id, contact_uri)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, config })
    }

    /// The expiry the registrar will honor for one contact: the contact
    /// parameter wins over the request header; the result is clamped to the
    /// configured ceiling. Zero means removal and passes through.
    pub fn honored_expiry(&self, contact: &ContactRegistration, header: Option<u32>) -> u32 {
        let requested = contact
            .expires_param
            .or(header)
            .unwrap_or(self.config.default_expiry);
        if requested == 0 {
            return 0;
        }
        requested.clamp(self.config.min_expiry, self.config.max_expiry)
    }

    /// Apply one REGISTER's contacts: refresh matches, insert new bindings,
    /// remove zero-expiry contacts, and expel the oldest binding above the
    /// per-account cap. Returns the account's bindings after the update.
    pub async fn update(&self, update: BindingUpdate) -> Result<Vec<Binding>> {
        let now = Utc::now();

        for contact in &update.contacts {
            let expiry = self.honored_expiry(contact, update.header_expires);

            if expiry == 0 {
                let removed = sqlx::query(
                    "DELETE FROM bindings WHERE account_id = ? AND contact_uri = ?",
                )
                .bind(&update.account_id)
                .bind(&contact.uri)
                .execute(&self.pool)
                .await?;
                debug!(
                    account = %update.account_id,
                    contact = %contact.uri,
                    removed = removed.rows_affected(),
                    "binding removed on zero expiry"
                );
                continue;
            }

            let expiry_time = now + Duration::seconds(expiry as i64);
            let refreshed = sqlx::query(
                "UPDATE bindings
                 SET expiry = ?, expiry_time = ?, user_agent = ?, remote_socket = ?,
                     proxy_socket = ?, registrar_socket = ?, last_update = ?
                 WHERE account_id = ? AND contact_uri = ?",
            )
            .bind(expiry as i64)
            .bind(expiry_time)
            .bind(&update.user_agent)
            .bind(&update.remote_socket)
            .bind(&update.proxy_socket)
            .bind(&update.registrar_socket)
            .bind(now)
            .bind(&update.account_id)
            .bind(&contact.uri)
            .execute(&self.pool)
            .await?;

            if refreshed.rows_affected() == 0 {
                sqlx::query(
                    "INSERT INTO bindings
                     (id, account_id, contact_uri, user_agent, expiry, expiry_time,
                      remote_socket, proxy_socket, registrar_socket, last_update)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(Binding::new_id())
                .bind(&update.account_id)
                .bind(&contact.uri)
                .bind(&update.user_agent)
                .bind(expiry as i64)
                .bind(expiry_time)
                .bind(&update.remote_socket)
                .bind(&update.proxy_socket)
                .bind(&update.registrar_socket)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }

        self.expel_overflow(&update.account_id).await?;
        self.get_for_account(&update.account_id).await
    }

    /// Expel the oldest bindings (by `last_update`) above the per-account cap.
    async fn expel_overflow(&self, account_id: &str) -> Result<()> {
        let cap = self.config.max_bindings_per_account as i64;
        let expelled = sqlx::query(
            "DELETE FROM bindings WHERE account_id = ? AND id NOT IN (
                 SELECT id FROM bindings WHERE account_id = ?
                 ORDER BY last_update DESC LIMIT ?
             )",
        )
        .bind(account_id)
        .bind(account_id)
        .bind(cap)
        .execute(&self.pool)
        .await?;

        if expelled.rows_affected() > 0 {
            warn!(
                account = %account_id,
                expelled = expelled.rows_affected(),
                "binding cap reached, oldest expelled"
            );
        }
        Ok(())
    }

    pub async fn get_for_account(&self, account_id: &str) -> Result<Vec<Binding>> {
        let rows = sqlx::query(
            "SELECT id, account_id, contact_uri, user_agent, expiry, expiry_time,
                    remote_socket, proxy_socket, registrar_socket, last_update
             FROM bindings WHERE account_id = ? ORDER BY last_update DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_binding).collect())
    }

    /// Delete every binding whose expiry time has passed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let swept = sqlx::query("DELETE FROM bindings WHERE expiry_time <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(swept.rows_affected())
    }

    /// Background loop deleting lapsed bindings until cancelled.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let interval = std::time::Duration::from_secs(store.config.sweep_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match store.sweep_expired().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "expired bindings swept"),
                            Err(err) => warn!(error = %err, "binding sweep failed"),
                        }
                    }
                }
            }
            debug!("binding sweeper stopped");
        })
    }
}

fn row_to_binding(row: sqlx::sqlite::SqliteRow) -> Binding {
    Binding {
        id: row.get("id"),
        account_id: row.get("account_id"),
        contact_uri: row.get("contact_uri"),
        user_agent: row.get("user_agent"),
        expiry: row.get::<i64, _>("expiry") as u32,
        expiry_time: row.get("expiry_time"),
        remote_socket: row.get("remote_socket"),
        proxy_socket: row.get("proxy_socket"),
        registrar_socket: row.get("registrar_socket"),
        last_update: row.get("last_update"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single connection: pooled sqlite::memory: connections do not share
    // a database.
    async fn store() -> BindingStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        BindingStore::new(pool, RegistrarConfig::default())
            .await
            .unwrap()
    }

    fn update_for(account: &str, uri: &str, expires: Option<u32>) -> BindingUpdate {
        BindingUpdate {
            account_id: account.to_string(),
            contacts: vec![ContactRegistration {
                uri: uri.to_string(),
                expires_param: None,
            }],
            header_expires: expires,
            user_agent: "test-ua/1.0".to_string(),
            remote_socket: "1.2.3.4:5060".to_string(),
            proxy_socket: "1.2.3.4:5060".to_string(),
            registrar_socket: "192.168.0.50:5060".to_string(),
        }
    }

    #[tokio::test]
    async fn register_then_refresh() {
        let store = store().await;

        let bindings = store
            .update(update_for("acc1", "sip:user@1.2.3.4:5060", Some(3600)))
            .await
            .unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].expiry, 3600);
        let first_id = bindings[0].id.clone();

        // Same contact refreshes in place rather than inserting.
        let bindings = store
            .update(update_for("acc1", "sip:user@1.2.3.4:5060", Some(600)))
            .await
            .unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].id, first_id);
        assert_eq!(bindings[0].expiry, 600);
    }

    #[tokio::test]
    async fn expiry_time_tracks_expiry() {
        let store = store().await;
        let bindings = store
            .update(update_for("acc1", "sip:user@1.2.3.4:5060", Some(3600)))
            .await
            .unwrap();
        let binding = &bindings[0];
        let delta = binding.expiry_time - binding.last_update;
        assert_eq!(delta.num_seconds(), 3600);
        let ttl = binding.remaining_ttl(Utc::now());
        assert!((3599..=3600).contains(&ttl));
    }

    #[tokio::test]
    async fn zero_expiry_removes() {
        let store = store().await;
        store
            .update(update_for("acc1", "sip:user@1.2.3.4:5060", Some(3600)))
            .await
            .unwrap();
        let bindings = store
            .update(update_for("acc1", "sip:user@1.2.3.4:5060", Some(0)))
            .await
            .unwrap();
        assert!(bindings.is_empty());
    }

    #[tokio::test]
    async fn oldest_expelled_above_cap() {
        let store = store().await;
        let cap = RegistrarConfig::default().max_bindings_per_account;

        for i in 0..=cap {
            store
                .update(update_for(
                    "acc1",
                    &format!("sip:user@10.0.0.{}:5060", i + 1),
                    Some(3600),
                ))
                .await
                .unwrap();
            // Distinct last_update ordering under SQLite's timestamp precision.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let bindings = store.get_for_account("acc1").await.unwrap();
        assert_eq!(bindings.len(), cap);
        // The first-registered contact is the one that was expelled.
        assert!(!bindings
            .iter()
            .any(|binding| binding.contact_uri == "sip:user@10.0.0.1:5060"));
    }

    #[tokio::test]
    async fn sweep_removes_lapsed_bindings() {
        let store = store().await;
        store
            .update(update_for("acc1", "sip:user@1.2.3.4:5060", Some(3600)))
            .await
            .unwrap();

        // Backdate the binding so the sweep sees it as lapsed.
        sqlx::query("UPDATE bindings SET expiry_time = ?")
            .bind(Utc::now() - Duration::seconds(1))
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(store.get_for_account("acc1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expiry_clamped_to_bounds() {
        let store = store().await;
        let contact = ContactRegistration {
            uri: "sip:a@b".into(),
            expires_param: Some(999_999),
        };
        assert_eq!(store.honored_expiry(&contact, None), 7200);

        let contact = ContactRegistration {
            uri: "sip:a@b".into(),
            expires_param: None,
        };
        assert_eq!(store.honored_expiry(&contact, Some(30)), 60);
        assert_eq!(store.honored_expiry(&contact, Some(0)), 0);
        assert_eq!(store.honored_expiry(&contact, None), 3600);
    }
}
