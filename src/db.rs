//! SQLite store for lease records and name records
//!
//! The same database file can be shared by several launch service processes
//! on one host; every mutation is a single SQL statement, so SQLite's own
//! write lock provides the atomicity the lease protocol relies on.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 3;

/// How long a writer waits for another process's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// A stored lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub key: String,
    pub holder: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

/// A discoverable address record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    /// Fully qualified record name, e.g. "backend.demo"
    pub name: String,
    /// Role of the endpoint the record points at
    pub role: String,
    /// Workload the endpoint belongs to
    pub workload: String,
    /// Address the name resolves to
    pub address: String,
    /// Unit that owns the record; empty for records written before owners were tracked
    #[serde(default)]
    pub unit: String,
    pub ttl_secs: u32,
    /// Last upsert time in milliseconds since the epoch
    pub updated_at_ms: i64,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets readers proceed while another process holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }

            if current_version < 3 {
                Self::migrate_v3(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: leases
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: leases");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: name records
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: name records");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS name_records (
                name TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                workload TEXT NOT NULL,
                address TEXT NOT NULL,
                ttl_secs INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_name_records_workload ON name_records(workload);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    /// Migration v3: record owners
    fn migrate_v3(conn: &Connection) -> Result<()> {
        debug!("Applying migration v3: name record owners");

        conn.execute_batch(
            r#"
            ALTER TABLE name_records ADD COLUMN unit TEXT NOT NULL DEFAULT '';

            INSERT INTO schema_migrations (version) VALUES (3);
        "#,
        )?;

        Ok(())
    }

    // ==================== Lease Operations ====================

    /// Create the lease for `key`, or take it over if the existing one expired
    /// at or before `now_ms`. Returns true if `holder` now owns the lease.
    ///
    /// This is one statement: the existence check and the write cannot be
    /// interleaved with another acquirer.
    pub fn try_acquire_lease(&self, key: &str, holder: &str, now_ms: i64, expires_at_ms: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "INSERT INTO leases (key, holder, acquired_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at_ms = excluded.acquired_at_ms,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE leases.expires_at_ms <= excluded.acquired_at_ms",
                params![key, holder, now_ms, expires_at_ms],
            )
            .context("Failed to acquire lease")?;
        Ok(changed == 1)
    }

    /// Delete the lease for `key` if `holder` still owns it
    pub fn release_lease(&self, key: &str, holder: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM leases WHERE key = ?1 AND holder = ?2",
            params![key, holder],
        )?;
        Ok(rows > 0)
    }

    /// Get the lease record for `key`, expired or not
    pub fn get_lease(&self, key: &str) -> Result<Option<LeaseRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key, holder, acquired_at_ms, expires_at_ms FROM leases WHERE key = ?1",
            params![key],
            |row| {
                Ok(LeaseRecord {
                    key: row.get(0)?,
                    holder: row.get(1)?,
                    acquired_at_ms: row.get(2)?,
                    expires_at_ms: row.get(3)?,
                })
            },
        )
        .optional()
        .context("Failed to get lease")
    }

    // ==================== Name Record Operations ====================

    /// Insert or replace a name record
    pub fn upsert_name_record(&self, record: &NameRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO name_records (name, role, workload, address, unit, ttl_secs, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                role = excluded.role,
                workload = excluded.workload,
                address = excluded.address,
                unit = excluded.unit,
                ttl_secs = excluded.ttl_secs,
                updated_at_ms = excluded.updated_at_ms",
            params![
                record.name,
                record.role,
                record.workload,
                record.address,
                record.unit,
                record.ttl_secs,
                record.updated_at_ms
            ],
        )?;
        Ok(())
    }

    /// Delete a name record owned by `unit`. Returns false if none existed or
    /// another unit has taken the name over since.
    pub fn delete_name_record(&self, name: &str, unit: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM name_records WHERE name = ?1 AND (unit = ?2 OR unit = '')",
            params![name, unit],
        )?;
        Ok(rows > 0)
    }

    /// List name records whose name starts with `prefix`
    pub fn find_name_records(&self, prefix: &str) -> Result<Vec<NameRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, role, workload, address, unit, ttl_secs, updated_at_ms
             FROM name_records WHERE substr(name, 1, length(?1)) = ?1 ORDER BY name",
        )?;

        let records = stmt
            .query_map(params![prefix], |row| {
                Ok(NameRecord {
                    name: row.get(0)?,
                    role: row.get(1)?,
                    workload: row.get(2)?,
                    address: row.get(3)?,
                    unit: row.get(4)?,
                    ttl_secs: row.get(5)?,
                    updated_at_ms: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }
}
