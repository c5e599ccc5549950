use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, info};

use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Entry,
    Receipt,
    Material,
    Task,
    /// A whole dashboard command captured while offline.
    Command,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::Entry => "entry",
            EntryType::Receipt => "receipt",
            EntryType::Material => "material",
            EntryType::Task => "task",
            EntryType::Command => "command",
        }
    }

    /// Path of the endpoint a queued entry of this type is replayed against.
    pub fn endpoint(self) -> &'static str {
        match self {
            EntryType::Entry => "/api/entries",
            EntryType::Receipt => "/api/receipts",
            EntryType::Material => "/api/materials",
            EntryType::Task => "/api/tasks",
            EntryType::Command => "/execute-dashboard-command",
        }
    }
}

impl FromStr for EntryType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "entry" => Ok(EntryType::Entry),
            "receipt" => Ok(EntryType::Receipt),
            "material" => Ok(EntryType::Material),
            "task" => Ok(EntryType::Task),
            "command" => Ok(EntryType::Command),
            other => Err(anyhow!("unknown queue entry type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub payload: Value,
    pub idempotency_key: String,
    pub enqueued_at: i64,
    pub synced: bool,
}

const ENTRY_COLUMNS: &str = "id, type, payload, idempotency_key, enqueued_at, synced";

fn row_to_entry(row: &Row) -> Result<QueueEntry> {
    let entry_type: String = row.get(1)?;
    let payload: String = row.get(2)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        entry_type: entry_type.parse()?,
        payload: serde_json::from_str(&payload).context("corrupt queued payload")?,
        idempotency_key: row.get(3)?,
        enqueued_at: row.get(4)?,
        synced: row.get(5)?,
    })
}

/// Local id: enqueue time in hex plus a random suffix.
fn local_id(now_ms: i64) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{:x}-{}", now_ms, &random[..8])
}

/// Durable record of write intents made without connectivity. Entries are
/// listed by insertion sequence, never by `enqueued_at`, which follows the
/// wall clock. `synced` only ever goes from false to true.
#[derive(Clone)]
pub struct OfflineQueue {
    db: Database,
}

impl OfflineQueue {
    /// Wrap a ready local store (opened with [`crate::db::Schema::Local`]).
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, entry_type: EntryType, payload: Value) -> Result<String> {
        self.enqueue_keyed(entry_type, payload, uuid::Uuid::new_v4().to_string())
            .await
    }

    /// Enqueue under an idempotency key that was already sent with a failed
    /// online attempt, so the replay cannot duplicate a write that landed.
    pub async fn enqueue_keyed(
        &self,
        entry_type: EntryType,
        payload: Value,
        key: String,
    ) -> Result<String> {
        let now = Utc::now().timestamp_millis();
        let id = local_id(now);
        let raw = payload.to_string();

        let row_id = id.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO offline_queue (id, type, payload, idempotency_key, enqueued_at, synced)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                    params![row_id, entry_type.as_str(), raw, key, now],
                )
                .context("Failed to enqueue offline entry")?;
                Ok(())
            })
            .await?;

        info!("queued {} entry {}", entry_type.as_str(), id);
        Ok(id)
    }

    pub async fn list_unsynced(&self) -> Result<Vec<QueueEntry>> {
        self.select(format!(
            "SELECT {ENTRY_COLUMNS} FROM offline_queue WHERE synced = 0 ORDER BY seq ASC"
        ))
        .await
    }

    pub async fn list_all(&self) -> Result<Vec<QueueEntry>> {
        self.select(format!(
            "SELECT {ENTRY_COLUMNS} FROM offline_queue ORDER BY seq ASC"
        ))
        .await
    }

    async fn select(&self, sql: String) -> Result<Vec<QueueEntry>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut entries = Vec::new();
                while let Some(row) = rows.next()? {
                    entries.push(row_to_entry(row)?);
                }
                Ok(entries)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueEntry>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let sql = format!("SELECT {ENTRY_COLUMNS} FROM offline_queue WHERE id = ?1");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_entry(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Idempotent; a missing id is a no-op.
    pub async fn mark_synced(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let updated = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "UPDATE offline_queue SET synced = 1 WHERE id = ?1",
                    params![id],
                )?)
            })
            .await?;
        if updated == 0 {
            debug!("mark_synced: no queue entry with that id");
        }
        Ok(())
    }

    /// Delete synced entries enqueued before `cutoff_ms`. Unsynced entries
    /// are never removed.
    pub async fn purge_synced(&self, cutoff_ms: i64) -> Result<usize> {
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM offline_queue WHERE synced = 1 AND enqueued_at < ?1",
                    params![cutoff_ms],
                )?)
            })
            .await?;
        info!("purged {} synced queue entries", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Schema;
    use serde_json::json;

    fn queue() -> OfflineQueue {
        OfflineQueue::new(Database::open_in_memory(Schema::Local).unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_starts_unsynced() {
        let q = queue();
        let id = q.enqueue(EntryType::Task, json!({"content": "Zaun"})).await.unwrap();
        let entry = q.get(&id).await.unwrap().unwrap();
        assert!(!entry.synced);
        assert_eq!(entry.entry_type, EntryType::Task);
        assert_eq!(entry.payload["content"], "Zaun");
        assert_eq!(entry.idempotency_key.len(), 36);
    }

    #[tokio::test]
    async fn test_enqueue_keyed_keeps_the_key() {
        let q = queue();
        let id = q
            .enqueue_keyed(EntryType::Command, json!({"type": "create_task"}), "k-42".to_string())
            .await
            .unwrap();
        assert_eq!(q.get(&id).await.unwrap().unwrap().idempotency_key, "k-42");
    }

    #[tokio::test]
    async fn test_unsynced_are_listed_in_enqueue_order() {
        let q = queue();
        let mut ids = Vec::new();
        for (i, kind) in [EntryType::Entry, EntryType::Receipt, EntryType::Command].into_iter().enumerate() {
            ids.push(q.enqueue(kind, json!({ "n": i })).await.unwrap());
        }
        q.mark_synced(&ids[1]).await.unwrap();

        let pending: Vec<String> = q.list_unsynced().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(pending, vec![ids[0].clone(), ids[2].clone()]);
        assert_eq!(q.list_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_order_survives_clock_stepping_back() {
        let q = queue();
        let first = q.enqueue(EntryType::Command, json!({"type": "create_project"})).await.unwrap();
        let second = q.enqueue(EntryType::Command, json!({"type": "add_worktime"})).await.unwrap();

        let moved = second.clone();
        q.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE offline_queue SET enqueued_at = enqueued_at - 60000 WHERE id = ?1",
                    params![moved],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let pending: Vec<String> = q.list_unsynced().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(pending, vec![first.clone(), second.clone()]);
        let all: Vec<String> = q.list_all().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(all, vec![first, second]);
    }

    #[tokio::test]
    async fn test_mark_synced_is_idempotent() {
        let q = queue();
        let id = q.enqueue(EntryType::Material, json!({})).await.unwrap();
        q.mark_synced(&id).await.unwrap();
        q.mark_synced(&id).await.unwrap();
        q.mark_synced("does-not-exist").await.unwrap();
        assert!(q.get(&id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn test_purge_only_touches_synced() {
        let q = queue();
        let done = q.enqueue(EntryType::Entry, json!({})).await.unwrap();
        let pending = q.enqueue(EntryType::Entry, json!({})).await.unwrap();
        q.mark_synced(&done).await.unwrap();

        let removed = q.purge_synced(Utc::now().timestamp_millis() + 1).await.unwrap();
        assert_eq!(removed, 1);
        assert!(q.get(&done).await.unwrap().is_none());
        assert!(q.get(&pending).await.unwrap().is_some());
    }

    #[test]
    fn test_entry_type_endpoints() {
        assert_eq!(EntryType::Entry.endpoint(), "/api/entries");
        assert_eq!("receipt".parse::<EntryType>().unwrap(), EntryType::Receipt);
        assert!("invoice".parse::<EntryType>().is_err());
    }
}
