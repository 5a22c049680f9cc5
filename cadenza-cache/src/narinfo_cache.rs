// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Local disk cache for narinfo lookups.
//!
//! Remote narinfo lookups are tiny but high-latency, and negative results
//! (path not on this cache) are extremely common during substitution. A
//! small SQLite table remembers both outcomes per (cache, hash-part), with
//! a shorter time-to-live for negative entries so new uploads are picked
//! up reasonably fast.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, params};
use tracing::debug;

use cadenza_store::{Result, StoreError};

/// Positive entries stay fresh this long.
const POSITIVE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Negative entries expire much sooner.
const NEGATIVE_TTL: Duration = Duration::from_secs(3600);

const SCHEMA: &str = r#"
create table if not exists NarInfos (
    cache     text not null,
    hashPart  text not null,
    present   integer not null,
    narinfo   text,
    timestamp integer not null,
    primary key (cache, hashPart)
);
"#;

/// A cached lookup outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedLookup {
    /// No entry, or the entry expired.
    Unknown,
    /// The remote cache had no narinfo for this path.
    Absent,
    /// The narinfo text as originally fetched.
    Present(String),
}

/// SQLite-backed narinfo lookup cache.
pub struct NarInfoDiskCache {
    conn: std::sync::Mutex<Connection>,
}

impl NarInfoDiskCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Corrupt(format!("narinfo cache: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Corrupt(format!("narinfo cache: {e}")))?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Corrupt(format!("narinfo cache: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Corrupt(format!("narinfo cache: {e}")))?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn lookup(&self, cache_url: &str, hash_part: &str) -> Result<CachedLookup> {
        let conn = self.conn.lock().expect("narinfo cache lock poisoned");
        let row: Option<(bool, Option<String>, i64)> = conn
            .query_row(
                "SELECT present, narinfo, timestamp FROM NarInfos WHERE cache = ?1 AND hashPart = ?2",
                params![cache_url, hash_part],
                |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Corrupt(format!("narinfo cache: {other}"))),
            })?;

        let Some((present, narinfo, timestamp)) = row else {
            return Ok(CachedLookup::Unknown);
        };

        let age = now_secs().saturating_sub(timestamp as u64);
        let ttl = if present { POSITIVE_TTL } else { NEGATIVE_TTL };
        if age > ttl.as_secs() {
            debug!(cache_url, hash_part, "narinfo cache entry expired");
            return Ok(CachedLookup::Unknown);
        }

        Ok(match (present, narinfo) {
            (true, Some(text)) => CachedLookup::Present(text),
            _ => CachedLookup::Absent,
        })
    }

    pub fn record(&self, cache_url: &str, hash_part: &str, narinfo: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().expect("narinfo cache lock poisoned");
        conn.execute(
            r#"
            INSERT OR REPLACE INTO NarInfos (cache, hashPart, present, narinfo, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                cache_url,
                hash_part,
                i32::from(narinfo.is_some()),
                narinfo,
                now_secs() as i64
            ],
        )
        .map_err(|e| StoreError::Corrupt(format!("narinfo cache: {e}")))?;
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
