// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The capability surface every store exposes.
//!
//! Concrete stores (the local engine, binary caches) differ wildly in what
//! they can do; the scheduler only ever talks to this trait. Writers that
//! a store cannot support return [`StoreError::NotSupported`] rather than
//! being absent, so substituter lists can hold stores of any kind.

use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use cadenza_store_core::realisation::{DrvOutput, Realisation};
use cadenza_store_core::store_path::{StoreDir, StorePath};
use cadenza_store_core::ValidPathInfo;

use crate::error::{Result, StoreError};

/// A boxed NAR byte source.
pub type NarSource = Pin<Box<dyn AsyncRead + Send>>;

/// A boxed NAR byte sink.
pub type NarSink<'a> = Pin<&'a mut (dyn AsyncWrite + Send)>;

/// Whether signatures must be checked when ingesting a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckSigs {
    Require,
    Skip,
}

/// Client trust, as reported by a store about its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    Trusted,
    NotTrusted,
    /// Treat conservatively: verify signatures.
    Unknown,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// The store directory paths in this store are relative to.
    fn store_dir(&self) -> &StoreDir;

    /// Diagnostic URI (`local`, `https://cache.example.org`, …).
    fn uri(&self) -> String;

    /// Substituter priority; lower is preferred.
    fn priority(&self) -> u32 {
        0
    }

    /// Whether bulk validity queries against this store are worthwhile.
    fn want_mass_query(&self) -> bool {
        false
    }

    /// How much this store trusts its client.
    fn is_trusted_client(&self) -> Trust {
        Trust::Unknown
    }

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        Ok(self.query_path_info(path).await?.is_some())
    }

    /// Metadata for `path`, or `None` when the store does not have it.
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<ValidPathInfo>>;

    /// Resolve a textual hash part to a full path, when supported.
    async fn query_path_from_hash_part(&self, _hash_part: &str) -> Result<Option<StorePath>> {
        Err(StoreError::NotSupported(self.uri()))
    }

    /// Which of `paths` this store could substitute.
    async fn query_substitutable_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>> {
        let mut out = BTreeSet::new();
        for path in paths {
            if self.is_valid_path(path).await? {
                out.insert(path.clone());
            }
        }
        Ok(out)
    }

    /// Stream the NAR serialisation of `path` into `sink`.
    async fn nar_from_path(&self, path: &StorePath, sink: NarSink<'_>) -> Result<()>;

    /// Ingest a NAR whose metadata is `info`.
    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        nar: NarSource,
        repair: bool,
        check_sigs: CheckSigs,
    ) -> Result<()>;

    /// Look up a realisation of a floating output.
    async fn query_realisation(&self, _id: &DrvOutput) -> Result<Option<Realisation>> {
        Ok(None)
    }

    /// Record a realisation.
    async fn register_realisation(&self, _realisation: &Realisation) -> Result<()> {
        Err(StoreError::NotSupported(self.uri()))
    }
}
