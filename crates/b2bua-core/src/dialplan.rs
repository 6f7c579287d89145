//! Scripted call routing.
//!
//! The dialplan is a user-authored rhai snippet defining
//! `lookup(to_user, from_user, from_host)`; it returns a destination string
//! or unit for "no route". Compilation is expensive, so the AST is cached
//! and only refreshed when the persisted record's `last_update` (whole
//! seconds) moves past the compile time.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rhai::{Dynamic, Engine, Scope, AST};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{B2buaError, Result};

/// Script execution budget; routing scripts are pure dispatch logic and
/// never need more.
const MAX_SCRIPT_OPERATIONS: u64 = 100_000;

/// Name of the singleton record.
pub const DEFAULT_DIALPLAN: &str = "default";

/// Shipped routing script; replaced through the admin surface.
pub const SEED_SCRIPT: &str = r#"
fn lookup(to_user, from_user, from_host) {
    switch to_user {
        "100" => fwd("100@192.168.0.48"),
        _ => ()
    }
}
"#;

/// Where a call should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub uri: String,
}

impl CallDescriptor {
    pub fn new(destination: impl Into<String>) -> Self {
        let destination = destination.into();
        let uri = if destination.starts_with("sip:") || destination.starts_with("sips:") {
            destination
        } else {
            format!("sip:{}", destination)
        };
        Self { uri }
    }
}

/// Persisted dialplan record.
#[derive(Debug, Clone)]
pub struct DialplanRecord {
    pub name: String,
    pub script_source: String,
    pub last_update: DateTime<Utc>,
}

/// SQLite persistence for dialplan sources.
#[derive(Clone)]
pub struct DialplanStore {
    pool: SqlitePool,
}

impl DialplanStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dialplans (
                name          TEXT PRIMARY KEY,
                script_source TEXT NOT NULL,
                last_update   TIMESTAMP NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn get(&self, name: &str) -> Result<Option<DialplanRecord>> {
        let row = sqlx::query(
            "SELECT name, script_source, last_update FROM dialplans WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| DialplanRecord {
            name: row.get("name"),
            script_source: row.get("script_source"),
            last_update: row.get("last_update"),
        }))
    }

    /// Replace the script and stamp `last_update`.
    pub async fn update(&self, name: &str, script_source: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO dialplans (name, script_source, last_update) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET script_source = excluded.script_source,
                                             last_update = excluded.last_update",
        )
        .bind(name)
        .bind(script_source)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert the seed script when the table is empty.
    pub async fn seed_if_missing(&self) -> Result<()> {
        if self.get(DEFAULT_DIALPLAN).await?.is_none() {
            info!("seeding default dialplan");
            self.update(DEFAULT_DIALPLAN, SEED_SCRIPT).await?;
        }
        Ok(())
    }
}

struct CompiledPlan {
    ast: AST,
    /// `last_update` of the source this AST came from, truncated to whole
    /// seconds. Two updates inside one second will not retrigger a compile.
    compiled_from_secs: i64,
}

/// Compiles and caches the routing callable.
pub struct DialplanEvaluator {
    store: DialplanStore,
    engine: Engine,
    compiled: RwLock<Option<Arc<CompiledPlan>>>,
    last_error: Mutex<Option<String>>,
}

impl DialplanEvaluator {
    pub fn new(store: DialplanStore) -> Arc<Self> {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_SCRIPT_OPERATIONS);
        // `fwd("user@host")` sugar for building a destination.
        engine.register_fn("fwd", |destination: &str| {
            if destination.starts_with("sip:") || destination.starts_with("sips:") {
                destination.to_string()
            } else {
                format!("sip:{}", destination)
            }
        });

        Arc::new(Self {
            store,
            engine,
            compiled: RwLock::new(None),
            last_error: Mutex::new(None),
        })
    }

    /// The last compile failure, for the admin surface.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("error slot poisoned").clone()
    }

    /// Compile now if the persisted source is newer than the cached AST.
    /// Failures keep the previous AST in service.
    pub async fn refresh_if_stale(&self) -> Result<()> {
        let record = self
            .store
            .get(DEFAULT_DIALPLAN)
            .await?
            .ok_or_else(|| B2buaError::Dialplan("no dialplan record".into()))?;
        let source_secs = record.last_update.timestamp();

        {
            let current = self.compiled.read().await;
            if let Some(plan) = current.as_ref() {
                if source_secs <= plan.compiled_from_secs {
                    return Ok(());
                }
            }
        }

        match self.engine.compile(&record.script_source) {
            Ok(ast) => {
                let fresh = Arc::new(CompiledPlan {
                    ast,
                    compiled_from_secs: source_secs,
                });
                let mut slot = self.compiled.write().await;
                let previous = slot.replace(fresh);
                // In-flight lookups keep the pointer they captured; the old
                // AST is freed as soon as the last of them finishes.
                drop(previous);
                *self.last_error.lock().expect("error slot poisoned") = None;
                info!(updated = %record.last_update, "dialplan compiled");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "dialplan compile failed, keeping previous");
                *self.last_error.lock().expect("error slot poisoned") = Some(message.clone());
                // Only an error when there is no previous compile to fall
                // back on.
                if self.compiled.read().await.is_none() {
                    return Err(B2buaError::Dialplan(message));
                }
                Ok(())
            }
        }
    }

    /// Resolve a dialled user to a destination. `from_account` is the
    /// authenticated caller's username, empty for anonymous external
    /// callers.
    pub async fn lookup(
        &self,
        to_user: &str,
        from_account: &str,
        from_host: &str,
    ) -> Result<Option<CallDescriptor>> {
        self.refresh_if_stale().await?;

        let plan = {
            let slot = self.compiled.read().await;
            slot.as_ref()
                .cloned()
                .ok_or_else(|| B2buaError::Dialplan("dialplan not compiled".into()))?
        };

        let mut scope = Scope::new();
        let result: Dynamic = self
            .engine
            .call_fn(
                &mut scope,
                &plan.ast,
                "lookup",
                (
                    to_user.to_string(),
                    from_account.to_string(),
                    from_host.to_string(),
                ),
            )
            .map_err(|err| B2buaError::Dialplan(err.to_string()))?;

        if result.is_unit() {
            debug!(to_user, "dialplan returned no route");
            return Ok(None);
        }
        let destination: String = result
            .try_cast()
            .ok_or_else(|| B2buaError::Dialplan("lookup returned a non-string".into()))?;
        Ok(Some(CallDescriptor::new(destination)))
    }
}
