// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The error surface shared by every store implementation.

use thiserror::Error;

use cadenza_store_core::store_path::BadStorePath;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    BadStorePath(#[from] BadStorePath),

    #[error("path '{0}' is not valid")]
    InvalidPath(String),

    #[error("path '{0}' is in use")]
    PathInUse(String),

    #[error("hash mismatch for '{path}': expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for '{path}': expected {expected}, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("path '{0}' lacks a valid signature")]
    MissingSignature(String),

    #[error(transparent)]
    BadArchive(#[from] cadenza_nar::BadArchive),

    #[error(transparent)]
    Restore(#[from] cadenza_nar::restore::RestoreError),

    #[error(transparent)]
    Db(#[from] cadenza_store_db::Error),

    #[error("substituter '{0}' is disabled")]
    SubstituterDisabled(String),

    #[error("file '{0}' does not exist in binary cache '{1}'")]
    NoSuchBinaryCacheFile(String, String),

    #[error("transfer of '{url}' failed: {reason}")]
    FileTransferError { url: String, reason: String },

    #[error("store '{0}' does not support this operation")]
    NotSupported(String),

    #[error("unsupported store URI '{0}'")]
    UnsupportedUri(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("operation was interrupted")]
    Interrupted,

    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Errors that a substitution should treat as "try the next
    /// substituter" rather than a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::SubstituterDisabled(_)
                | StoreError::NoSuchBinaryCacheFile(..)
                | StoreError::FileTransferError { .. }
        )
    }
}
