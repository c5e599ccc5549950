use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::db::Database;

/// Read-through cache on the local store. Expiry is checked lazily on read;
/// expired rows stay until overwritten.
#[derive(Clone)]
pub struct Cache {
    db: Database,
}

impl Cache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.get_at(key, Utc::now().timestamp_millis()).await
    }

    pub async fn get_at(&self, key: &str, now_ms: i64) -> Result<Option<Value>> {
        let key = key.to_string();
        let row: Option<(String, i64)> = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT payload, expires_at FROM cache WHERE key = ?1",
                        params![key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?)
            })
            .await?;

        match row {
            Some((payload, expires_at)) if now_ms < expires_at => Ok(Some(
                serde_json::from_str(&payload).context("corrupt cache payload")?,
            )),
            _ => Ok(None),
        }
    }

    pub async fn put(&self, key: &str, payload: &Value, ttl: Duration) -> Result<()> {
        self.put_at(key, payload, ttl, Utc::now().timestamp_millis()).await
    }

    pub async fn put_at(&self, key: &str, payload: &Value, ttl: Duration, now_ms: i64) -> Result<()> {
        let key = key.to_string();
        let raw = payload.to_string();
        let expires_at = now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO cache (key, payload, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, expires_at = excluded.expires_at",
                    params![key, raw, expires_at],
                )
                .context("Failed to write cache entry")?;
                Ok(())
            })
            .await
    }
}
