//! # Directory Store
//!
//! Durable byte-oriented key-value persistence backed by SQLite. Two
//! independent partitions ("buckets") are kept as two tables:
//!
//! | Bucket | Table | Key | Value |
//! |--------|-------|-----|-------|
//! | [`Bucket::Node`] | `cluster_node` | node address | sealed node record |
//! | [`Bucket::Group`] | `cluster_group` | [`GROUP_INDEX_KEY`] | sealed group index |
//!
//! The store knows nothing about entity structure; callers seal and open the
//! bytes themselves (see [`crate::entity`]). Tables are created idempotently
//! every time a store is opened.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;

/// Key of the single aggregate record in [`Bucket::Group`].
pub const GROUP_INDEX_KEY: &str = "ClusterGroupKey";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    Node,
    Group,
}

impl Bucket {
    fn table(self) -> &'static str {
        match self {
            Bucket::Node => "cluster_node",
            Bucket::Group => "cluster_group",
        }
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store file and ensure both buckets exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        create_buckets(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory store for tests; WAL is not available here.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_buckets(&conn)?;
        Ok(Self { conn })
    }

    pub fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", bucket.table());
        let value = self
            .conn
            .query_row(&sql, params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, bucket: Bucket, key: &str, value: &[u8]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            bucket.table()
        );
        self.conn.execute(&sql, params![key, value])?;
        Ok(())
    }

    /// Returns whether a record was removed.
    pub fn delete(&self, bucket: Bucket, key: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", bucket.table());
        let removed = self.conn.execute(&sql, params![key])?;
        Ok(removed > 0)
    }
}

fn create_buckets(conn: &Connection) -> rusqlite::Result<()> {
    for bucket in [Bucket::Node, Bucket::Group] {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key   TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL
            );",
            bucket.table()
        ))?;
    }
    Ok(())
}
