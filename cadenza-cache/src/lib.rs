// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Binary-cache stores.
//!
//! A binary cache is the read-mostly store behind `file://` and
//! `http(s)://` URIs: narinfo documents describe paths, compressed NARs
//! carry the bytes, signatures carry the trust. [`BinaryCacheStore`]
//! implements the shared [`Store`](cadenza_store::Store) trait on top of
//! a pluggable [`CacheTransport`].

pub mod binary_cache;
pub mod cacheinfo;
pub mod compression;
pub mod narinfo;
pub mod narinfo_cache;
pub mod transport;

pub use binary_cache::{BinaryCacheConfig, BinaryCacheStore};
pub use cacheinfo::CacheInfo;
pub use narinfo::{Compression, NarInfo, NarInfoError};
pub use narinfo_cache::{CachedLookup, NarInfoDiskCache};
pub use transport::{CacheTransport, FileStream, FileTransport, HttpTransport};
