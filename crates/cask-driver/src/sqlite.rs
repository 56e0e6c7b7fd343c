use std::path::Path;

use cask_types::{Bucket, Hash};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::DriverResult;
use crate::traits::Driver;

const ROOT_KEY: &str = "root";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS a (k TEXT PRIMARY KEY, v BLOB NOT NULL);
    CREATE TABLE IF NOT EXISTS b (k TEXT PRIMARY KEY, v BLOB NOT NULL);
    CREATE TABLE IF NOT EXISTS control (k TEXT PRIMARY KEY, v BLOB NOT NULL);
";

/// Embedded relational driver.
///
/// Each bucket is a table (`a`, `b`) keyed by the hex hash; the root lives
/// under key `"root"` in the `control` table. One connection is shared
/// behind a mutex, so statements are serialized.
pub struct SqliteDriver {
    conn: Mutex<Connection>,
    name: String,
}

impl SqliteDriver {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> DriverResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn, format!("sqlite:{}", path.display()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> DriverResult<Self> {
        Self::init(Connection::open_in_memory()?, "sqlite::memory:".into())
    }

    fn init(conn: Connection, name: String) -> DriverResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            name,
        })
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, key: &Hash, value: &[u8], bucket: Bucket) -> DriverResult<()> {
        let sql = format!("INSERT OR IGNORE INTO {} (k, v) VALUES (?1, ?2)", bucket.as_str());
        let inserted = self.conn.lock().execute(&sql, params![key.to_hex(), value])?;
        if inserted > 0 {
            debug!(driver = %self.name, %bucket, key = %key.short_hex(), len = value.len(), "row inserted");
        }
        Ok(())
    }

    fn load(&self, key: &Hash, bucket: Bucket) -> DriverResult<Option<Vec<u8>>> {
        let sql = format!("SELECT v FROM {} WHERE k = ?1", bucket.as_str());
        let value = self
            .conn
            .lock()
            .query_row(&sql, params![key.to_hex()], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    fn exists(&self, key: &Hash, bucket: Bucket) -> DriverResult<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE k = ?1", bucket.as_str());
        let found = self
            .conn
            .lock()
            .query_row(&sql, params![key.to_hex()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn store_root(&self, value: &[u8]) -> DriverResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO control (k, v) VALUES (?1, ?2)",
            params![ROOT_KEY, value],
        )?;
        Ok(())
    }

    fn load_root(&self) -> DriverResult<Option<Vec<u8>>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT v FROM control WHERE k = ?1",
                params![ROOT_KEY],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn count(&self, bucket: Bucket) -> DriverResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", bucket.as_str());
        let count: i64 = self.conn.lock().query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("name", &self.name)
            .finish()
    }
}
