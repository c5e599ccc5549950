use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::db::queries::{self, KeyClaim};
use crate::db::Database;

/// A pending reservation older than this is treated as abandoned, e.g. by a
/// server that stopped mid-write.
pub const PENDING_TIMEOUT_MS: i64 = 5 * 60 * 1000;

/// An `Idempotency-Key` as seen by one user on one route.
#[derive(Debug, Clone)]
pub struct KeyScope {
    pub user: String,
    pub route: &'static str,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// First sighting; the caller performs the write.
    Fresh,
    /// Already written; answer with the stored response.
    Replay(Value),
    /// Another request with the same key is still writing.
    InFlight,
}

pub async fn claim(store: &Database, scope: &KeyScope) -> Result<Claim> {
    claim_at(store, scope, Utc::now().timestamp_millis()).await
}

pub async fn claim_at(store: &Database, scope: &KeyScope, now_ms: i64) -> Result<Claim> {
    let scope = scope.clone();
    let stale_before = now_ms - PENDING_TIMEOUT_MS;
    let claimed = store
        .execute(move |conn| {
            queries::claim_idempotency_key(
                conn,
                &scope.user,
                scope.route,
                &scope.key,
                now_ms,
                stale_before,
            )
        })
        .await?;
    Ok(match claimed {
        KeyClaim::Claimed => Claim::Fresh,
        KeyClaim::Pending => Claim::InFlight,
        KeyClaim::Completed(raw) => Claim::Replay(
            serde_json::from_str(&raw).context("Corrupt stored idempotent response")?,
        ),
    })
}

/// Store the response of the write that owns the key.
pub async fn complete(store: &Database, scope: &KeyScope, response: &Value) -> Result<()> {
    let scope = scope.clone();
    let raw = response.to_string();
    store
        .execute(move |conn| {
            queries::complete_idempotency_key(conn, &scope.user, scope.route, &scope.key, &raw)
        })
        .await
}

/// Give the key back after a write that stored nothing worth replaying.
pub async fn release(store: &Database, scope: &KeyScope) -> Result<()> {
    let scope = scope.clone();
    store
        .execute(move |conn| {
            queries::release_idempotency_key(conn, &scope.user, scope.route, &scope.key)
        })
        .await
}
