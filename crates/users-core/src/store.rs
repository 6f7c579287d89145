//! Directory storage over SQLite

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Account, CreateAccountRequest, Domain};
use crate::{ha1_digest, md5_hex};

/// Storage seam for domains and accounts.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn list_domains(&self) -> Result<Vec<Domain>>;
    async fn create_domain(&self, name: &str, aliases: &[String]) -> Result<Domain>;

    async fn create_account(&self, request: CreateAccountRequest, realm: &str) -> Result<Account>;
    async fn get_account(&self, id: &str) -> Result<Option<Account>>;
    async fn account_by_username(&self, username: &str, domain_id: &str)
        -> Result<Option<Account>>;
    /// Replace the account's HA1. Takes the plaintext and hashes here so no
    /// caller can persist an unhashed password.
    async fn update_password(&self, id: &str, realm: &str, password: &str) -> Result<()>;
    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<()>;
    async fn delete_account(&self, id: &str) -> Result<()>;
    async fn list_accounts(&self, domain_id: &str) -> Result<Vec<Account>>;
}

/// SQLite-backed directory store.
#[derive(Clone)]
pub struct SqliteDirectoryStore {
    pool: SqlitePool,
}

impl SqliteDirectoryStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let migration_sql = include_str!("../migrations/001_initial_schema.sql");
        sqlx::raw_sql(migration_sql).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_account(row: sqlx::sqlite::SqliteRow) -> Account {
        Account {
            id: row.get("id"),
            domain_id: row.get("domain_id"),
            username: row.get("username"),
            ha1_digest: row.get("ha1_digest"),
            disabled: row.get("disabled"),
            inserted: row.get("inserted"),
        }
    }
}

#[async_trait]
impl DirectoryStore for SqliteDirectoryStore {
    async fn list_domains(&self) -> Result<Vec<Domain>> {
        let rows = sqlx::query("SELECT id, name, aliases FROM domains ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let domains = rows
            .into_iter()
            .map(|row| {
                let aliases_json: String = row.get("aliases");
                let aliases: Vec<String> =
                    serde_json::from_str(&aliases_json).unwrap_or_default();
                Domain {
                    id: row.get("id"),
                    name: row.get("name"),
                    aliases,
                }
            })
            .collect();
        Ok(domains)
    }

    async fn create_domain(&self, name: &str, aliases: &[String]) -> Result<Domain> {
        let domain = Domain {
            id: md5_hex(name.to_ascii_lowercase().as_bytes()),
            name: name.to_string(),
            aliases: aliases.to_vec(),
        };
        let aliases_json = serde_json::to_string(&domain.aliases).unwrap_or_else(|_| "[]".into());

        sqlx::query("INSERT INTO domains (id, name, aliases) VALUES (?, ?, ?)")
            .bind(&domain.id)
            .bind(&domain.name)
            .bind(&aliases_json)
            .execute(&self.pool)
            .await?;

        Ok(domain)
    }

    async fn create_account(&self, request: CreateAccountRequest, realm: &str) -> Result<Account> {
        if self
            .account_by_username(&request.username, &request.domain_id)
            .await?
            .is_some()
        {
            return Err(Error::AccountExists {
                username: request.username,
                domain_id: request.domain_id,
            });
        }

        let account = Account {
            id: Account::new_id(),
            domain_id: request.domain_id,
            username: request.username.clone(),
            ha1_digest: ha1_digest(&request.username, realm, &request.password),
            disabled: false,
            inserted: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO accounts (id, domain_id, username, ha1_digest, disabled, inserted)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(&account.domain_id)
        .bind(&account.username)
        .bind(&account.ha1_digest)
        .bind(account.disabled)
        .bind(account.inserted)
        .execute(&self.pool)
        .await?;

        debug!(username = %account.username, "account created");
        Ok(account)
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT id, domain_id, username, ha1_digest, disabled, inserted
             FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::row_to_account))
    }

    async fn account_by_username(
        &self,
        username: &str,
        domain_id: &str,
    ) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT id, domain_id, username, ha1_digest, disabled, inserted
             FROM accounts WHERE username = ? AND domain_id = ?",
        )
        .bind(username)
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::row_to_account))
    }

    async fn update_password(&self, id: &str, realm: &str, password: &str) -> Result<()> {
        let account = self
            .get_account(id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;

        let digest = ha1_digest(&account.username, realm, password);
        sqlx::query("UPDATE accounts SET ha1_digest = ? WHERE id = ?")
            .bind(&digest)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET disabled = ? WHERE id = ?")
            .bind(disabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::AccountNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_account(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_accounts(&self, domain_id: &str) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT id, domain_id, username, ha1_digest, disabled, inserted
             FROM accounts WHERE domain_id = ? ORDER BY username",
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Self::row_to_account).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One connection and no idle reaping: every pooled connection to
    // sqlite::memory: would otherwise get its own empty database.
    async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn store() -> SqliteDirectoryStore {
        SqliteDirectoryStore::new(memory_pool().await).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_lookup_account() {
        let store = store().await;
        let domain = store.create_domain("192.168.0.50", &[]).await.unwrap();

        let account = store
            .create_account(
                CreateAccountRequest {
                    username: "user".into(),
                    domain_id: domain.id.clone(),
                    password: "password".into(),
                },
                &domain.name,
            )
            .await
            .unwrap();

        // The store only ever sees the digest.
        assert_eq!(account.ha1_digest, "bba0da00f6b94f726912a3ab6342da6e");

        let found = store
            .account_by_username("user", &domain.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, account.id);
        assert!(!found.disabled);
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let store = store().await;
        let domain = store.create_domain("example.com", &[]).await.unwrap();
        let request = CreateAccountRequest {
            username: "alice".into(),
            domain_id: domain.id.clone(),
            password: "pw".into(),
        };
        store
            .create_account(request.clone(), &domain.name)
            .await
            .unwrap();
        assert!(matches!(
            store.create_account(request, &domain.name).await,
            Err(Error::AccountExists { .. })
        ));
    }

    #[tokio::test]
    async fn update_password_rehashes() {
        let store = store().await;
        let domain = store.create_domain("example.com", &[]).await.unwrap();
        let account = store
            .create_account(
                CreateAccountRequest {
                    username: "bob".into(),
                    domain_id: domain.id.clone(),
                    password: "old".into(),
                },
                &domain.name,
            )
            .await
            .unwrap();

        store
            .update_password(&account.id, &domain.name, "new")
            .await
            .unwrap();

        let updated = store.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(updated.ha1_digest, ha1_digest("bob", "example.com", "new"));
        assert_ne!(updated.ha1_digest, account.ha1_digest);
    }
}
