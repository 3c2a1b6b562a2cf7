//! Persistence layer.
//!
//! One [`Store`] trait, two engines: [`PostgresStore`] for deployments with a
//! `DATABASE_URL` and [`SqliteStore`] for everything else. The backend is
//! picked once in [`connect`]; nothing outside this module branches on engine
//! identity, and all dialect-specific SQL stays inside the respective impl.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;
use crate::sync::stable_coffee_uid;

mod models;
mod postgres;
mod sqlite;

pub use models::{CoffeeRow, User};
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation, e.g. duplicate username or a device id
    /// already bound to a different account.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Data(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Connects the backend selected by configuration: PostgreSQL when running
/// in production with a `DATABASE_URL`, SQLite otherwise.
pub async fn connect(config: &AppConfig) -> Result<Arc<dyn Store>, StoreError> {
    match &config.database.url {
        Some(url) if config.is_production() => {
            let store = PostgresStore::connect(url, config.database.max_connections).await?;
            info!("Connected to PostgreSQL");
            Ok(Arc::new(store))
        }
        _ => {
            let store =
                SqliteStore::connect(&config.database.sqlite_path, config.database.max_connections)
                    .await?;
            info!(path = %config.database.sqlite_path, "Connected to SQLite");
            Ok(Arc::new(store))
        }
    }
}

/// Storage contract shared by both engines.
///
/// Everything here is a single-statement operation. Multi-step writes go
/// through [`Store::begin`] and the [`StoreTx`] handle so failures roll back
/// as one unit.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotently creates the current schema and migrates older shapes
    /// forward: adds missing columns with their defaults, renames the
    /// retired `fellow` grinder value, assigns `coffee_uid`s to rows from
    /// before the uid column existed, then builds the supporting indexes.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Cheap connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Inserts a new user with preference defaults and returns the stored
    /// row. Duplicate username or token surfaces as [`StoreError::Conflict`].
    async fn create_user(&self, username: &str, token: &str) -> Result<User, StoreError>;

    /// Looks a user up by token, optionally requiring a matching bound
    /// device id.
    async fn user_by_token(
        &self,
        token: &str,
        device_id: Option<&str>,
    ) -> Result<Option<User>, StoreError>;

    /// Case-insensitive username existence check.
    async fn username_exists(&self, username: &str) -> Result<bool, StoreError>;

    async fn user_count(&self) -> Result<i64, StoreError>;

    async fn touch_last_login(&self, user_id: i64) -> Result<(), StoreError>;

    /// Binds a device to a user in one conditional update (`WHERE device_id
    /// IS NULL`), also storing the device-info snapshot and refreshing
    /// `last_login_at`. Returns whether this call won the binding; a `false`
    /// result means some other request bound the user first and the caller
    /// must re-read and apply the mismatch rule.
    async fn bind_device(
        &self,
        user_id: i64,
        device_id: &str,
        device_info: &str,
    ) -> Result<bool, StoreError>;

    async fn set_grinder_preference(&self, user_id: i64, grinder: &str)
        -> Result<(), StoreError>;

    async fn set_method_preference(&self, user_id: i64, method: &str) -> Result<(), StoreError>;

    async fn set_water_hardness(&self, user_id: i64, hardness: f64) -> Result<(), StoreError>;

    /// All coffee rows for a user, most recently saved first.
    async fn get_user_coffees(&self, user_id: i64) -> Result<Vec<CoffeeRow>, StoreError>;

    /// Unconditionally deletes every coffee row for a user.
    async fn delete_user_coffees(&self, user_id: i64) -> Result<(), StoreError>;

    /// Opens a transaction. Dropping the returned handle without committing
    /// rolls back. A caller must never hold two handles at once.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// Transactional coffee operations. Obtained from [`Store::begin`].
#[async_trait]
pub trait StoreTx: Send {
    /// Upserts a document keyed on `(user_id, uid)`: inserts a new row or
    /// overwrites `data`/`method`/`created_at` of the existing one. Returns
    /// the row id.
    async fn save_coffee(
        &mut self,
        user_id: i64,
        uid: &str,
        data: &str,
        method: Option<&str>,
    ) -> Result<i64, StoreError>;

    /// Deletes every row for the user whose uid is not in `keep_uids`; an
    /// empty list deletes all rows. Returns the number of rows removed.
    async fn replace_user_coffees(
        &mut self,
        user_id: i64,
        keep_uids: &[String],
    ) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Maps a unique-constraint violation to [`StoreError::Conflict`] with a
/// caller-supplied message; everything else passes through.
fn unique_conflict(message: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(message.to_string())
        }
        _ => StoreError::Sqlx(err),
    }
}

/// Assigns uids to rows written before the `coffee_uid` column existed.
///
/// `legacy` rows arrive newest-first per user so the most recent duplicate
/// keeps the clean uid and older ones get a `-{row_id}` suffix; `taken` seeds
/// the collision set with uids already present for migrated rows. Every row
/// receives a uid, nothing is deleted.
fn plan_uid_backfill(
    legacy: &[(i64, i64, String)],
    taken: &[(i64, String)],
) -> Vec<(i64, String)> {
    let mut seen: HashSet<(i64, String)> = taken.iter().cloned().collect();
    let mut plan = Vec::with_capacity(legacy.len());

    for (row_id, user_id, data) in legacy {
        let doc = serde_json::from_str(data).unwrap_or(serde_json::Value::Null);
        let mut uid = stable_coffee_uid(&doc);
        if seen.contains(&(*user_id, uid.clone())) {
            uid = format!("{uid}-{row_id}");
            while seen.contains(&(*user_id, uid.clone())) {
                uid = format!("{uid}-{row_id}");
            }
        }
        seen.insert((*user_id, uid.clone()));
        plan.push((*row_id, uid));
    }

    plan
}
