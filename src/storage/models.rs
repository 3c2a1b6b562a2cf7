use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered account. `device_id` starts out null and is set exactly once
/// by the first successful authentication with the account's token.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub token: String,
    pub device_id: Option<String>,
    pub device_info: Option<String>,
    pub grinder_preference: String,
    pub method_preference: String,
    pub water_hardness: Option<f64>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One stored coffee document. `data` is the serialized JSON document;
/// `coffee_uid` is only null on rows written before the uid migration ran.
#[derive(Debug, Clone, FromRow)]
pub struct CoffeeRow {
    pub id: i64,
    pub user_id: i64,
    pub coffee_uid: Option<String>,
    pub data: String,
    pub method: Option<String>,
    pub created_at: DateTime<Utc>,
}
