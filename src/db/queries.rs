use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::models::{Customer, Material, Receipt, Task, TimeEntry, Worksite};
use crate::resolve::matching::normalize;

const WORKSITE_COLUMNS: &str =
    "id, name, address, description, customer_id, status, created_by, created_at";

fn row_to_worksite(row: &Row) -> Result<Worksite> {
    let status: String = row.get(5)?;
    Ok(Worksite {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        description: row.get(3)?,
        customer_id: row.get(4)?,
        status: status.parse()?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_customer(row: &Row) -> Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        city: row.get(2)?,
        created_by: row.get(3)?,
        created_at: row.get(4)?,
    })
}

pub fn insert_customer(conn: &Connection, customer: &Customer) -> Result<()> {
    conn.execute(
        "INSERT INTO customers (id, name, name_key, city, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            customer.id,
            customer.name,
            normalize(&customer.name),
            customer.city,
            customer.created_by,
            customer.created_at,
        ],
    )
    .context("Failed to insert customer")?;
    Ok(())
}

pub fn delete_customer(conn: &Connection, id: &str) -> Result<usize> {
    let removed = conn
        .execute("DELETE FROM customers WHERE id = ?1", params![id])
        .context("Failed to delete customer")?;
    Ok(removed)
}

/// Customers whose normalised name contains `name_key` or is contained in it,
/// newest first.
pub fn find_customers_by_name(conn: &Connection, name_key: &str) -> Result<Vec<Customer>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, city, created_by, created_at
         FROM customers
         WHERE instr(name_key, ?1) > 0 OR instr(?1, name_key) > 0
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let mut rows = stmt.query(params![name_key])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_customer(row)?);
    }
    Ok(results)
}

pub fn insert_worksite(conn: &Connection, worksite: &Worksite) -> Result<()> {
    conn.execute(
        "INSERT INTO worksites (id, name, address, address_key, description, customer_id, status, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            worksite.id,
            worksite.name,
            worksite.address,
            normalize(&worksite.address),
            worksite.description,
            worksite.customer_id,
            worksite.status.as_str(),
            worksite.created_by,
            worksite.created_at,
        ],
    )
    .context("Failed to insert worksite")?;
    Ok(())
}

pub fn get_worksite(conn: &Connection, id: &str) -> Result<Option<Worksite>> {
    let sql = format!("SELECT {WORKSITE_COLUMNS} FROM worksites WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_worksite(row)?)),
        None => Ok(None),
    }
}

/// Worksites whose address contains every fragment (already normalised).
///
/// Ties are broken by closeness of the stored address length to the query,
/// then by recency: shortest address first, newest first.
pub fn find_worksites_containing(conn: &Connection, fragments: &[String]) -> Result<Vec<Worksite>> {
    if fragments.is_empty() {
        return Ok(Vec::new());
    }
    let filter = (1..=fragments.len())
        .map(|i| format!("instr(address_key, ?{i}) > 0"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!(
        "SELECT {WORKSITE_COLUMNS} FROM worksites
         WHERE {filter}
         ORDER BY length(address_key) ASC, created_at DESC, rowid DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(fragments.iter()))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_worksite(row)?);
    }
    Ok(results)
}

pub fn list_worksites(conn: &Connection, limit: usize) -> Result<Vec<Worksite>> {
    let sql = format!(
        "SELECT {WORKSITE_COLUMNS} FROM worksites ORDER BY created_at DESC, rowid DESC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![limit as i64])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_worksite(row)?);
    }
    Ok(results)
}

pub fn insert_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, worksite_id, content, priority, category, is_completed, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.id,
            task.worksite_id,
            task.content,
            task.priority.as_str(),
            task.category.as_str(),
            task.is_completed,
            task.created_by,
            task.created_at,
        ],
    )
    .context("Failed to insert task")?;
    Ok(())
}

pub fn insert_time_entry(conn: &Connection, entry: &TimeEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO time_entries (id, worksite_id, user_id, date, start_time, end_time, break_minutes, hours, description, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entry.id,
            entry.worksite_id,
            entry.user_id,
            entry.date,
            entry.start_time,
            entry.end_time,
            entry.break_minutes,
            entry.hours,
            entry.description,
            entry.notes,
            entry.created_at,
        ],
    )
    .context("Failed to insert time entry")?;
    Ok(())
}

pub fn insert_material(conn: &Connection, material: &Material) -> Result<()> {
    conn.execute(
        "INSERT INTO materials (id, worksite_id, name, quantity, unit, notes, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            material.id,
            material.worksite_id,
            material.name,
            material.quantity,
            material.unit,
            material.notes,
            material.created_by,
            material.created_at,
        ],
    )
    .context("Failed to insert material")?;
    Ok(())
}

pub fn insert_receipt(conn: &Connection, receipt: &Receipt) -> Result<()> {
    conn.execute(
        "INSERT INTO receipts (id, worksite_id, vendor, amount, date, notes, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            receipt.id,
            receipt.worksite_id,
            receipt.vendor,
            receipt.amount,
            receipt.date,
            receipt.notes,
            receipt.created_by,
            receipt.created_at,
        ],
    )
    .context("Failed to insert receipt")?;
    Ok(())
}

/// State of an idempotency key after [`claim_idempotency_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyClaim {
    /// The caller now owns the key and must complete or release it.
    Claimed,
    /// A previous write finished; its stored response.
    Completed(String),
    /// Another request holds the key and has not finished yet.
    Pending,
}

/// Reserve `(user_id, route, key)` for a write. A pending reservation older
/// than `stale_before` is taken over. Both statements run on the store's
/// single connection, so two claims for the same key cannot both succeed.
pub fn claim_idempotency_key(
    conn: &Connection,
    user_id: &str,
    route: &str,
    key: &str,
    now: i64,
    stale_before: i64,
) -> Result<KeyClaim> {
    let claimed = conn
        .execute(
            "INSERT INTO idempotency_keys (user_id, route, key, response, created_at)
             VALUES (?1, ?2, ?3, NULL, ?4)
             ON CONFLICT(user_id, route, key) DO UPDATE SET created_at = excluded.created_at
             WHERE idempotency_keys.response IS NULL AND idempotency_keys.created_at < ?5",
            params![user_id, route, key, now, stale_before],
        )
        .context("Failed to claim idempotency key")?;
    if claimed == 1 {
        return Ok(KeyClaim::Claimed);
    }

    let response: Option<String> = conn
        .query_row(
            "SELECT response FROM idempotency_keys WHERE user_id = ?1 AND route = ?2 AND key = ?3",
            params![user_id, route, key],
            |row| row.get(0),
        )
        .context("Failed to read idempotency key")?;
    Ok(match response {
        Some(response) => KeyClaim::Completed(response),
        None => KeyClaim::Pending,
    })
}

pub fn complete_idempotency_key(
    conn: &Connection,
    user_id: &str,
    route: &str,
    key: &str,
    response: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE idempotency_keys SET response = ?4
         WHERE user_id = ?1 AND route = ?2 AND key = ?3 AND response IS NULL",
        params![user_id, route, key, response],
    )
    .context("Failed to store idempotent response")?;
    Ok(())
}

/// Drop a pending reservation so a retry is evaluated again.
pub fn release_idempotency_key(conn: &Connection, user_id: &str, route: &str, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM idempotency_keys
         WHERE user_id = ?1 AND route = ?2 AND key = ?3 AND response IS NULL",
        params![user_id, route, key],
    )
    .context("Failed to release idempotency key")?;
    Ok(())
}
