use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use super::{unique_conflict, CoffeeRow, Store, StoreError, StoreTx, User};

const USER_COLUMNS: &str = "id, username, token, device_id, device_info, grinder_preference, \
     method_preference, water_hardness, last_login_at, created_at";

/// PostgreSQL-backed store, used in production deployments.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGSERIAL PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL UNIQUE,
                device_id TEXT,
                device_info TEXT,
                grinder_preference TEXT NOT NULL DEFAULT 'fellow_gen2',
                method_preference TEXT NOT NULL DEFAULT 'v60',
                water_hardness DOUBLE PRECISION,
                last_login_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coffees (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                coffee_uid TEXT,
                data TEXT NOT NULL,
                method TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        for ddl in [
            "ALTER TABLE users ADD COLUMN IF NOT EXISTS device_id TEXT",
            "ALTER TABLE users ADD COLUMN IF NOT EXISTS device_info TEXT",
            "ALTER TABLE users ADD COLUMN IF NOT EXISTS grinder_preference TEXT NOT NULL DEFAULT 'fellow_gen2'",
            "ALTER TABLE users ADD COLUMN IF NOT EXISTS method_preference TEXT NOT NULL DEFAULT 'v60'",
            "ALTER TABLE users ADD COLUMN IF NOT EXISTS water_hardness DOUBLE PRECISION",
            "ALTER TABLE users ADD COLUMN IF NOT EXISTS last_login_at TIMESTAMPTZ",
            "ALTER TABLE coffees ADD COLUMN IF NOT EXISTS coffee_uid TEXT",
            "ALTER TABLE coffees ADD COLUMN IF NOT EXISTS method TEXT",
        ] {
            sqlx::query(ddl).execute(&mut *tx).await?;
        }

        // Databases created by the pre-rewrite schema used 32-bit serials and
        // naive timestamps; widen and timezone-qualify them in place.
        for (table, column) in [("users", "id"), ("coffees", "id"), ("coffees", "user_id")] {
            if column_type(&mut tx, table, column).await?.as_deref() == Some("integer") {
                let ddl = format!("ALTER TABLE {table} ALTER COLUMN {column} TYPE BIGINT");
                sqlx::query(&ddl).execute(&mut *tx).await?;
            }
        }
        for (table, column) in [
            ("users", "created_at"),
            ("users", "last_login_at"),
            ("coffees", "created_at"),
        ] {
            if column_type(&mut tx, table, column).await?.as_deref()
                == Some("timestamp without time zone")
            {
                let ddl = format!(
                    "ALTER TABLE {table} ALTER COLUMN {column} TYPE TIMESTAMPTZ \
                     USING {column} AT TIME ZONE 'UTC'"
                );
                sqlx::query(&ddl).execute(&mut *tx).await?;
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
                sqlx::query("UPDATE coffees SET coffee_uid = $1 WHERE id = $2")
                    .bind(&uid)
                    .bind(row_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

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
            "INSERT INTO users (username, token, created_at) VALUES ($1, $2, $3) RETURNING {USER_COLUMNS}"
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
                    format!("SELECT {USER_COLUMNS} FROM users WHERE token = $1 AND device_id = $2");
                sqlx::query_as::<_, User>(&sql)
                    .bind(token)
                    .bind(device)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE token = $1");
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
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE LOWER(username) = LOWER($1))")
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
        sqlx::query("UPDATE users SET last_login_at = $1 WHERE id = $2")
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
            "UPDATE users SET device_id = $1, device_info = $2, last_login_at = $3 \
             WHERE id = $4 AND device_id IS NULL",
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
        sqlx::query("UPDATE users SET grinder_preference = $1 WHERE id = $2")
            .bind(grinder)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_method_preference(&self, user_id: i64, method: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET method_preference = $1 WHERE id = $2")
            .bind(method)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_water_hardness(&self, user_id: i64, hardness: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET water_hardness = $1 WHERE id = $2")
            .bind(hardness)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_user_coffees(&self, user_id: i64) -> Result<Vec<CoffeeRow>, StoreError> {
        let rows = sqlx::query_as::<_, CoffeeRow>(
            "SELECT id, user_id, coffee_uid, data, method, created_at FROM coffees \
             WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_user_coffees(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM coffees WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
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
            VALUES ($1, $2, $3, $4, $5)
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
            let result = sqlx::query("DELETE FROM coffees WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *self.tx)
                .await?;
            return Ok(result.rows_affected());
        }

        let mut builder: QueryBuilder<Postgres> =
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

async fn column_type(
    tx: &mut Transaction<'static, Postgres>,
    table: &str,
    column: &str,
) -> Result<Option<String>, StoreError> {
    let data_type: Option<String> = sqlx::query_scalar(
        "SELECT data_type FROM information_schema.columns \
         WHERE table_name = $1 AND column_name = $2",
    )
    .bind(table)
    .bind(column)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(data_type)
}
