// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! SQLite persistence for store metadata.
//!
//! This crate knows nothing about NARs, hashing or the filesystem layout
//! of the store — it is the registry of which paths are valid, how they
//! reference each other, which derivations produced them, and which
//! realisations have been recorded. The local store engine in
//! `cadenza-store` composes it with the on-disk object tree.

mod connection;
mod error;
mod query;
mod schema;
mod types;
mod write;

pub use connection::{OpenMode, StoreDb};
pub use error::{Error, Result};
pub use schema::{CA_SCHEMA_SQL, SCHEMA_SQL, SCHEMA_VERSION};
pub use types::{DerivationOutputRow, PathInfoRow, RealisationRow};
pub use write::RegisterPathParams;
