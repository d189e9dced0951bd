//! SQLite database for allocation persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Every commit reaches the disk before the call returns
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- One row per live allocation, record is the JSON encoded Allocation
            CREATE TABLE IF NOT EXISTS allocations (
                client_id TEXT PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Key-value store for misc state
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Underlying connection, for maintenance and tests
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    // ========================================================================
    // Allocations
    // ========================================================================

    /// Insert or replace the allocation row for a client
    pub fn upsert_allocation(&self, client_id: &str, address: &str, record: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT INTO allocations (client_id, address, record, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(client_id) DO UPDATE SET
                address = excluded.address,
                record = excluded.record,
                updated_at = excluded.updated_at",
            params![client_id, address, record, now],
        )?;

        debug!("Stored allocation for {}", client_id);
        Ok(())
    }

    /// Delete the allocation row for a client
    pub fn delete_allocation(&self, client_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM allocations WHERE client_id = ?1",
            params![client_id],
        )?;

        if rows > 0 {
            debug!("Deleted allocation for {}", client_id);
        }

        Ok(rows > 0)
    }

    /// Load every allocation row without interpreting the record
    pub fn load_allocations(&self) -> Result<Vec<AllocationRow>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT client_id, address, record, updated_at FROM allocations ORDER BY updated_at ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(AllocationRow {
                client_id: row.get(0)?,
                address: row.get(1)?,
                record: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }

    // ========================================================================
    // Key-value store
    // ========================================================================

    /// Set a key-value pair
    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;

        Ok(())
    }

    /// Get a value by key
    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();

        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }
}

/// Raw allocation row before parsing
#[derive(Debug, Clone)]
pub struct AllocationRow {
    pub client_id: String,
    pub address: String,
    pub record: String,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_rows() {
        let db = Database::open_memory().unwrap();

        db.upsert_allocation("a.k", "::1", "{}").unwrap();
        db.upsert_allocation("b.k", "::2", "{}").unwrap();
        db.upsert_allocation("a.k", "::1", "{\"renewed\":true}").unwrap();

        let rows = db.load_allocations().unwrap();
        assert_eq!(rows.len(), 2);
        let a = rows.iter().find(|r| r.client_id == "a.k").unwrap();
        assert_eq!(a.record, "{\"renewed\":true}");

        assert!(db.delete_allocation("a.k").unwrap());
        assert!(!db.delete_allocation("a.k").unwrap());
        assert_eq!(db.load_allocations().unwrap().len(), 1);
    }

    #[test]
    fn test_address_unique() {
        let db = Database::open_memory().unwrap();
        db.upsert_allocation("a.k", "::1", "{}").unwrap();
        assert!(db.upsert_allocation("b.k", "::1", "{}").is_err());
    }

    #[test]
    fn test_kv() {
        let db = Database::open_memory().unwrap();
        assert_eq!(db.kv_get("admin").unwrap(), None);
        db.kv_set("admin", "one").unwrap();
        db.kv_set("admin", "two").unwrap();
        assert_eq!(db.kv_get("admin").unwrap().as_deref(), Some("two"));
    }
}
