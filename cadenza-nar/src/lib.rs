// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! NAR (Nix ARchive) encoding, decoding and restoration.
//!
//! A NAR is the canonical serialisation of a filesystem tree: regular
//! files (with an executable bit), directories with entries in strict
//! lexicographic order, and symlinks. Because the encoding is canonical,
//! the SHA-256 of a tree's NAR is the tree's identity — the store hashes,
//! transports and verifies objects exclusively through this format.
//!
//! The layers here:
//!
//! - [`wire`] — the length-prefixed string framing
//! - [`dump`] — filesystem → NAR byte stream
//! - [`parse`] — NAR byte stream → validated event stream
//! - [`restore`] — event stream → filesystem, create-exclusive
//! - [`hash_modulo`] — hashing with self-reference placeholders zeroed
//! - [`rewrite`] — streaming byte substitution over NAR data

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub mod dump;
pub mod hash_modulo;
pub mod parse;
pub mod restore;
pub mod rewrite;
pub mod wire;

mod byte_stream;

pub use byte_stream::NarByteStream;
pub use dump::{dump_to_vec, dump_to_writer, DumpOptions};
pub use hash_modulo::compute_hash_modulo;
pub use parse::{NarEvent, NarParser, NarEncoder};
pub use restore::{restore, RestoreOptions};
pub use rewrite::StreamRewriter;

/// Magic header of every NAR stream.
pub const NAR_VERSION_MAGIC: &str = "nix-archive-1";

/// Suffix appended to entry names to disambiguate case collisions on
/// case-folding filesystems. Forbidden inside archives.
pub const CASE_HACK_SUFFIX: &str = "~nix~case~hack~";

/// Errors produced while encoding or decoding archives.
#[derive(Error, Debug)]
pub enum BadArchive {
    #[error("archive ended unexpectedly: {0}")]
    Truncated(#[source] io::Error),

    #[error("malformed archive: {0}")]
    Corrupt(String),

    #[error("invalid entry name '{0}'")]
    BadName(String),

    #[error("directory entry '{new}' not sorted after '{prev}'")]
    Unsorted { prev: String, new: String },

    #[error("path '{0}' has an unsupported file type")]
    UnsupportedType(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BadArchive {
    pub(crate) fn truncated(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            BadArchive::Truncated(err)
        } else {
            BadArchive::Io(err)
        }
    }
}
