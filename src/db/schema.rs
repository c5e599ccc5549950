use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Which of the two stores a connection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// Backing store behind the web server: customers, worksites and the
    /// records attached to them.
    Store,
    /// On-device store: offline write queue and read-through cache.
    Local,
}

impl Schema {
    pub fn name(self) -> &'static str {
        match self {
            Schema::Store => "store",
            Schema::Local => "local",
        }
    }

    fn migrations(self) -> &'static [&'static str] {
        match self {
            Schema::Store => STORE_MIGRATIONS,
            Schema::Local => LOCAL_MIGRATIONS,
        }
    }
}

const STORE_MIGRATIONS: &[&str] = &[
    "
    CREATE TABLE customers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL,
        city TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE worksites (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        address_key TEXT NOT NULL,
        description TEXT,
        customer_id TEXT REFERENCES customers(id),
        status TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE tasks (
        id TEXT PRIMARY KEY,
        worksite_id TEXT NOT NULL REFERENCES worksites(id),
        content TEXT NOT NULL,
        priority TEXT NOT NULL,
        category TEXT NOT NULL,
        is_completed INTEGER NOT NULL DEFAULT 0,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE time_entries (
        id TEXT PRIMARY KEY,
        worksite_id TEXT NOT NULL REFERENCES worksites(id),
        user_id TEXT NOT NULL,
        date TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT NOT NULL,
        break_minutes INTEGER NOT NULL DEFAULT 0,
        hours REAL NOT NULL,
        description TEXT NOT NULL,
        notes TEXT,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX idx_worksites_created ON worksites(created_at);
    CREATE INDEX idx_customers_name_key ON customers(name_key);
    CREATE INDEX idx_tasks_worksite ON tasks(worksite_id);
    CREATE INDEX idx_time_entries_worksite ON time_entries(worksite_id);
    ",
    "
    CREATE TABLE materials (
        id TEXT PRIMARY KEY,
        worksite_id TEXT NOT NULL REFERENCES worksites(id),
        name TEXT NOT NULL,
        quantity REAL NOT NULL,
        unit TEXT NOT NULL,
        notes TEXT,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE receipts (
        id TEXT PRIMARY KEY,
        worksite_id TEXT REFERENCES worksites(id),
        vendor TEXT NOT NULL,
        amount REAL NOT NULL,
        date TEXT NOT NULL,
        notes TEXT,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE idempotency_keys (
        key TEXT PRIMARY KEY,
        response TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    ",
    "
    DROP TABLE idempotency_keys;

    CREATE TABLE idempotency_keys (
        user_id TEXT NOT NULL,
        route TEXT NOT NULL,
        key TEXT NOT NULL,
        response TEXT,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, route, key)
    );
    ",
];

const LOCAL_MIGRATIONS: &[&str] = &["
    CREATE TABLE offline_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        type TEXT NOT NULL,
        payload TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        enqueued_at INTEGER NOT NULL,
        synced INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX idx_queue_type ON offline_queue(type);
    CREATE INDEX idx_queue_enqueued_at ON offline_queue(enqueued_at);
    CREATE INDEX idx_queue_synced ON offline_queue(synced);

    CREATE TABLE cache (
        key TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE INDEX idx_cache_expires_at ON cache(expires_at);
    "];

pub fn run_migrations(conn: &mut Connection, schema: Schema) -> Result<()> {
    let migrations = schema.migrations();
    let target = migrations.len() as i32;

    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > target {
        bail!(
            "{} database version ({}) is newer than supported schema ({})",
            schema.name(),
            version,
            target
        );
    }
    if version == target {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;
    while version < target {
        let next = version + 1;
        tx.execute_batch(migrations[version as usize])
            .with_context(|| format!("{} migration to version {next} failed", schema.name()))?;
        version = next;
    }
    tx.pragma_update(None, "user_version", target)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}
