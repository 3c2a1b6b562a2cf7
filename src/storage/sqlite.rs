use std::collections::HashSet;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use super::{unique_conflict, CoffeeRow, Store, StoreError, StoreTx, User};

const USER_COLUMNS: &str = "id, username, token, device_id, device_info, grinder_preference, \
     method_preference, water_hardness, last_login_at, created_at";

/// SQLite-backed store. The default engine for development and the one the
/// test suite runs against (`:memory:`).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        // An in-memory database exists per connection, so cap the pool at a
        // single connection that never retires; every caller then sees the
        // same database.
        let pool = if path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?
        };
        Ok(Self { pool })
    }

    /// Raw pool access, used by tests to stage legacy schemas.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL UNIQUE,
                device_id TEXT,
                device_info TEXT,
                grinder_preference TEXT NOT NULL DEFAULT 'fellow_gen2',
                method_preference TEXT NOT NULL DEFAULT 'v60',
                water_hardness REAL,
                last_login_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coffees (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                coffee_uid TEXT,
                data TEXT NOT NULL,
                method TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // SQLite has no ADD COLUMN IF NOT EXISTS; consult the actual shape.
        let user_columns = table_columns(&mut tx, "users").await?;
        for (name, ddl) in [
            ("device_id", "ALTER TABLE users ADD COLUMN device_id TEXT"),
            ("device_info", "ALTER TABLE users ADD COLUMN device_info TEXT"),
            (
                "grinder_preference",
                "ALTER TABLE users ADD COLUMN grinder_preference TEXT NOT NULL DEFAULT 'fellow_gen2'",
            ),
            (
                "method_preference",
                "ALTER TABLE users ADD COLUMN method_preference TEXT NOT NULL DEFAULT 'v60'",
            ),
            (
                "water_hardness",
                "ALTER TABLE users ADD COLUMN water_hardness REAL",
            ),
            (
                "last_login_at",
                "ALTER TABLE users ADD COLUMN last_login_at TEXT",
            ),
        ] {
            if !user_columns.contains(name) {
                sqlx::query(ddl).execute(&mut *tx).await?;
            }
        }

        let coffee_columns = table_columns(&mut tx, "coffees").await?;
        for (name, ddl) in [
            ("coffee_uid", "ALTER TABLE coffees ADD COLUMN coffee_uid TEXT"),
            ("method", "ALTER TABLE coffees ADD COLUMN method TEXT"),
        ] {
            if !coffee_columns.contains(name) {
                sqlx::query(ddl).execute(&mut *tx).await?;
            }
        }

        sqlx::query("UPDATE users SET grinder_preference = 'fellow_gen2' WHERE grinder_preference = 'fellow'")
            .execute(&mut *tx)
            .await?;

        let legacy: Vec<(i64, i64, String)> = sqlx::query_as(
            "SELECT id, user_id, data FROM coffees WHERE coffee_uid IS NULL \
             ORDER BY user_id, created_at DESC, id DESC",
        )
        .fetch_all(&mut *tx)
        .await?;
        if !legacy.is_empty() {
            let taken: Vec<(i64, String)> =
                sqlx::query_as("SELECT user_id, coffee_uid FROM coffees WHERE coffee_uid IS NOT NULL")
                    .fetch_all(&mut *tx)
                    .await?;
            for (row_id, uid) in super::plan_uid_backfill(&legacy, &taken) {
                sqlx::query("UPDATE coffees SET coffee_uid = ?1 WHERE id = ?2")
                    .bind(&uid)
                    .bind(row_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        // Indexes last: the unique ones only hold once the backfill ran.
        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_users_token ON users(token)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_device_id ON users(device_id)",
            "CREATE INDEX IF NOT EXISTS idx_coffees_user_id ON coffees(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_coffees_user_created ON coffees(user_id, created_at DESC)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_coffees_user_uid ON coffees(user_id, coffee_uid)",
        ] {
            sqlx::query(ddl).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_user(&self, username: &str, token: &str) -> Result<User, StoreError> {
        let sql = format!(
            "INSERT INTO users (username, token, created_at) VALUES (?1, ?2, ?3) RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .bind(token)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(unique_conflict("Username already taken"))?;
        Ok(user)
    }

    async fn user_by_token(
        &self,
        token: &str,
        device_id: Option<&str>,
    ) -> Result<Option<User>, StoreError> {
        let user = match device_id {
            Some(device) => {
                let sql =
                    format!("SELECT {USER_COLUMNS} FROM users WHERE token = ?1 AND device_id = ?2");
                sqlx::query_as::<_, User>(&sql)
                    .bind(token)
                    .bind(device)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE token = ?1");
                sqlx::query_as::<_, User>(&sql)
                    .bind(token)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        Ok(user)
    }

    async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE LOWER(username) = LOWER(?1))")
                .bind(username)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn user_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn touch_last_login(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_login_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bind_device(
        &self,
        user_id: i64,
        device_id: &str,
        device_info: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET device_id = ?1, device_info = ?2, last_login_at = ?3 \
             WHERE id = ?4 AND device_id IS NULL",
        )
        .bind(device_id)
        .bind(device_info)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(unique_conflict("This device is already linked to another account"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_grinder_preference(
        &self,
        user_id: i64,
        grinder: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET grinder_preference = ?1 WHERE id = ?2")
            .bind(grinder)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_method_preference(&self, user_id: i64, method: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET method_preference = ?1 WHERE id = ?2")
            .bind(method)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_water_hardness(&self, user_id: i64, hardness: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET water_hardness = ?1 WHERE id = ?2")
            .bind(hardness)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_user_coffees(&self, user_id: i64) -> Result<Vec<CoffeeRow>, StoreError> {
        let rows = sqlx::query_as::<_, CoffeeRow>(
            "SELECT id, user_id, coffee_uid, data, method, created_at FROM coffees \
             WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_user_coffees(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM coffees WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteStoreTx { tx }))
    }
}

struct SqliteStoreTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteStoreTx {
    async fn save_coffee(
        &mut self,
        user_id: i64,
        uid: &str,
        data: &str,
        method: Option<&str>,
    ) -> Result<i64, StoreError> {
        let row_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO coffees (user_id, coffee_uid, data, method, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (user_id, coffee_uid)
            DO UPDATE SET data = excluded.data, method = excluded.method, created_at = excluded.created_at
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(uid)
        .bind(data)
        .bind(method)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row_id)
    }

    async fn replace_user_coffees(
        &mut self,
        user_id: i64,
        keep_uids: &[String],
    ) -> Result<u64, StoreError> {
        if keep_uids.is_empty() {
            let result = sqlx::query("DELETE FROM coffees WHERE user_id = ?1")
                .bind(user_id)
                .execute(&mut *self.tx)
                .await?;
            return Ok(result.rows_affected());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM coffees WHERE user_id = ");
        builder.push_bind(user_id);
        builder.push(" AND coffee_uid NOT IN (");
        let mut uids = builder.separated(", ");
        for uid in keep_uids {
            uids.push_bind(uid.as_str());
        }
        uids.push_unseparated(")");

        let result = builder.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn table_columns(
    tx: &mut Transaction<'static, Sqlite>,
    table: &str,
) -> Result<HashSet<String>, StoreError> {
    let sql = format!("PRAGMA table_info({table})");
    let rows = sqlx::query(&sql).fetch_all(&mut **tx).await?;
    let mut columns = HashSet::with_capacity(rows.len());
    for row in rows {
        columns.insert(row.try_get::<String, _>("name")?);
    }
    Ok(columns)
}
