// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Database connection management.
//!
//! The database is owned by a single process and mutated through one
//! connection; WAL mode plus `BEGIN IMMEDIATE` transactions give readers a
//! consistent view while a writer is active. The schema version lives in a
//! sibling `schema` file so it can be checked before SQLite ever parses
//! the database.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::{CA_SCHEMA_SQL, SCHEMA_SQL, SCHEMA_VERSION};

/// Open mode for the store database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Create and initialise the schema when missing.
    Create,
}

/// SQLite-backed registry of valid paths.
pub struct StoreDb {
    pub(crate) conn: Connection,
}

impl StoreDb {
    /// Open (or with [`OpenMode::Create`], initialise) the database at
    /// `db_path`, checking the sibling schema-version file.
    pub fn open<P: AsRef<Path>>(db_path: P, mode: OpenMode) -> Result<Self> {
        let db_path = db_path.as_ref();
        let flags = match mode {
            OpenMode::ReadOnly => {
                if !db_path.exists() {
                    return Err(Error::DatabaseNotFound(db_path.to_owned()));
                }
                OpenFlags::SQLITE_OPEN_READ_ONLY
            }
            OpenMode::ReadWrite => {
                if !db_path.exists() {
                    return Err(Error::DatabaseNotFound(db_path.to_owned()));
                }
                OpenFlags::SQLITE_OPEN_READ_WRITE
            }
            OpenMode::Create => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };

        check_schema_version(&schema_version_path(db_path))?;

        let conn = Connection::open_with_flags(db_path, flags).map_err(|e| Error::DatabaseOpen {
            path: db_path.to_owned(),
            source: e,
        })?;
        let db = Self { conn };

        if mode == OpenMode::Create {
            db.configure_pragmas()?;
            db.create_schema()?;
            std::fs::write(schema_version_path(db_path), format!("{SCHEMA_VERSION}\n"))?;
        }

        debug!("opened store database at {} ({mode:?})", db_path.display());
        Ok(db)
    }

    /// In-memory database with the full schema, for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure_pragmas()?;
        db.create_schema()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        self.conn.execute_batch(CA_SCHEMA_SQL)?;
        Ok(())
    }

    /// Raw connection, for maintenance commands.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn schema_version_path(db_path: &Path) -> PathBuf {
    db_path.with_file_name("schema")
}

/// Upgrades are one-way: refuse databases from the future, accept older
/// ones (the tables are created `if not exists`).
fn check_schema_version(version_path: &Path) -> Result<()> {
    let Ok(contents) = std::fs::read_to_string(version_path) else {
        return Ok(());
    };
    let found: i32 = contents.trim().parse().unwrap_or(0);
    if found > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}
