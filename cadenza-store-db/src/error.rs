// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database not found at {0}")]
    DatabaseNotFound(PathBuf),

    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("path '{0}' is not registered as valid")]
    InvalidPath(String),

    #[error("cannot register '{referrer}': reference '{reference}' is neither valid nor part of the batch")]
    RefNotValid { referrer: String, reference: String },

    #[error("store database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
