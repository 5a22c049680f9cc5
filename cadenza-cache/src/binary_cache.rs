// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The binary-cache store.
//!
//! Logical layout under the cache root:
//!
//! - `nix-cache-info` — store dir, mass-query flag, priority
//! - `<hashPart>.narinfo` — one document per path
//! - `nar/<fileHash>.nar[.<ext>]` — the (compressed) NAR body
//! - `realisations/<drvOutput>.doi` — CA realisation documents
//! - `log/<drv-basename>` — optional build logs
//!
//! Uploads write the NAR before the narinfo, so a narinfo visible to
//! clients never references a missing NAR.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt as _;
use tracing::{debug, warn};

use cadenza_store::store::{CheckSigs, NarSink, NarSource, Store};
use cadenza_store::{Result, StoreError};
use cadenza_store_core::realisation::{DrvOutput, Realisation};
use cadenza_store_core::signing::{PublicKey, SecretKey};
use cadenza_store_core::store_path::{StoreDir, StorePath};
use cadenza_store_core::ValidPathInfo;
use cadenza_utils_hash::{Algorithm, Hash};

use crate::cacheinfo::CacheInfo;
use crate::compression::{compress, decompress_stream};
use crate::narinfo::{Compression, NarInfo};
use crate::narinfo_cache::{CachedLookup, NarInfoDiskCache};
use crate::transport::CacheTransport;

/// Configuration of a binary-cache store.
pub struct BinaryCacheConfig {
    pub store_dir: StoreDir,
    /// Codec for uploaded NARs.
    pub compression: Compression,
    /// Key used to sign uploaded narinfos.
    pub secret_key: Option<SecretKey>,
    /// Keys that downloaded narinfos must verify against.
    pub trusted_public_keys: Vec<PublicKey>,
    /// Whether downloaded narinfos must carry a valid signature.
    pub require_sigs: bool,
    /// Substituter priority; overridden by `nix-cache-info` on init.
    pub priority: u32,
}

impl Default for BinaryCacheConfig {
    fn default() -> Self {
        Self {
            store_dir: StoreDir::default(),
            compression: Compression::Xz,
            secret_key: None,
            trusted_public_keys: Vec::new(),
            require_sigs: true,
            priority: 50,
        }
    }
}

/// A store backed by a [`CacheTransport`].
pub struct BinaryCacheStore {
    config: BinaryCacheConfig,
    transport: Box<dyn CacheTransport>,
    disk_cache: Option<Arc<NarInfoDiskCache>>,
    /// Effective values after `init`.
    priority: std::sync::atomic::AtomicU32,
    want_mass_query: std::sync::atomic::AtomicBool,
}

impl BinaryCacheStore {
    pub fn new(config: BinaryCacheConfig, transport: Box<dyn CacheTransport>) -> Self {
        let priority = config.priority;
        Self {
            config,
            transport,
            disk_cache: None,
            priority: std::sync::atomic::AtomicU32::new(priority),
            want_mass_query: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_disk_cache(mut self, disk_cache: Arc<NarInfoDiskCache>) -> Self {
        self.disk_cache = Some(disk_cache);
        self
    }

    /// Fetch `nix-cache-info` and adopt the advertised settings. A
    /// writable cache that lacks the file gets one created.
    pub async fn init(&self) -> Result<()> {
        match self.transport.get_file_contents("nix-cache-info").await {
            Ok(contents) => {
                let info = CacheInfo::parse(&String::from_utf8_lossy(&contents));
                if info.store_dir != self.config.store_dir {
                    return Err(StoreError::Corrupt(format!(
                        "binary cache '{}' serves store dir '{}', expected '{}'",
                        self.uri(),
                        info.store_dir,
                        self.config.store_dir
                    )));
                }
                self.priority
                    .store(info.priority, std::sync::atomic::Ordering::Relaxed);
                self.want_mass_query
                    .store(info.want_mass_query, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
            Err(StoreError::NoSuchBinaryCacheFile(..)) => {
                let info = CacheInfo {
                    store_dir: self.config.store_dir.clone(),
                    want_mass_query: false,
                    priority: self.config.priority,
                };
                self.transport
                    .upsert_file("nix-cache-info", info.render().into_bytes(), "text/x-nix-cache-info")
                    .await
            }
            Err(e) => Err(e),
        }
    }

    fn narinfo_path(path: &StorePath) -> String {
        format!("{}.narinfo", path.hash_part())
    }

    async fn fetch_narinfo_text(&self, path: &StorePath) -> Result<Option<String>> {
        let hash_part = path.hash_part();
        if let Some(cache) = &self.disk_cache {
            match cache.lookup(&self.transport.url(), &hash_part)? {
                CachedLookup::Present(text) => return Ok(Some(text)),
                CachedLookup::Absent => return Ok(None),
                CachedLookup::Unknown => {}
            }
        }

        let result = match self
            .transport
            .get_file_contents(&Self::narinfo_path(path))
            .await
        {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(StoreError::NoSuchBinaryCacheFile(..)) => None,
            Err(e) => return Err(e),
        };

        if let Some(cache) = &self.disk_cache {
            cache.record(&self.transport.url(), &hash_part, result.as_deref())?;
        }
        Ok(result)
    }

    /// Fetch a build log for a derivation, when the cache carries one.
    pub async fn get_build_log(&self, drv_path: &StorePath) -> Result<Option<Vec<u8>>> {
        match self
            .transport
            .get_file_contents(&format!("log/{drv_path}"))
            .await
        {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StoreError::NoSuchBinaryCacheFile(..)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Store for BinaryCacheStore {
    fn store_dir(&self) -> &StoreDir {
        &self.config.store_dir
    }

    fn uri(&self) -> String {
        self.transport.url()
    }

    fn priority(&self) -> u32 {
        self.priority.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn want_mass_query(&self) -> bool {
        self.want_mass_query
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        if self.disk_cache.is_some() {
            // The narinfo is about to be needed anyway; go through the
            // cached lookup so negative results stick.
            return Ok(self.query_path_info(path).await?.is_some());
        }
        self.transport.file_exists(&Self::narinfo_path(path)).await
    }

    async fn query_path_info(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
        let Some(text) = self.fetch_narinfo_text(path).await? else {
            return Ok(None);
        };
        let narinfo = NarInfo::parse(&text)
            .map_err(|e| StoreError::Corrupt(format!("narinfo for '{path}': {e}")))?;
        let info = narinfo
            .to_path_info(&self.config.store_dir)
            .map_err(|e| StoreError::Corrupt(format!("narinfo for '{path}': {e}")))?;

        if info.path != *path {
            return Err(StoreError::Corrupt(format!(
                "narinfo for '{path}' describes '{}'",
                info.path
            )));
        }

        if self.config.require_sigs
            && !info.is_trusted(&self.config.store_dir, &self.config.trusted_public_keys)
        {
            return Err(StoreError::MissingSignature(
                self.config.store_dir.display_path(path),
            ));
        }

        Ok(Some(info))
    }

    async fn nar_from_path(&self, path: &StorePath, mut sink: NarSink<'_>) -> Result<()> {
        let Some(text) = self.fetch_narinfo_text(path).await? else {
            return Err(StoreError::InvalidPath(
                self.config.store_dir.display_path(path),
            ));
        };
        let narinfo = NarInfo::parse(&text)
            .map_err(|e| StoreError::Corrupt(format!("narinfo for '{path}': {e}")))?;

        let compressed = self.transport.get_file(&narinfo.url).await?;
        let mut nar = decompress_stream(narinfo.compression, compressed)?;
        tokio::io::copy(&mut nar, &mut sink).await?;
        Ok(())
    }

    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        mut nar: NarSource,
        _repair: bool,
        _check_sigs: CheckSigs,
    ) -> Result<()> {
        let mut nar_bytes = Vec::new();
        nar.read_to_end(&mut nar_bytes).await?;

        // Sanity: what we upload must be what the metadata promises.
        let actual_hash = Algorithm::SHA256.digest(&nar_bytes);
        if actual_hash != Hash::from(info.nar_hash) {
            return Err(StoreError::HashMismatch {
                path: self.config.store_dir.display_path(&info.path),
                expected: Hash::from(info.nar_hash).to_sri(),
                actual: actual_hash.to_sri(),
            });
        }

        let compressed = compress(self.config.compression, &nar_bytes).await?;
        let file_hash = Algorithm::SHA256.digest(&compressed);
        let nar_url = format!(
            "nar/{}.nar{}",
            file_hash.to_base32(),
            self.config.compression.extension()
        );

        let mut narinfo = NarInfo::from_path_info(&self.config.store_dir, info);
        narinfo.url = nar_url.clone();
        narinfo.compression = self.config.compression;
        narinfo.file_hash = Some(file_hash);
        narinfo.file_size = Some(compressed.len() as u64);

        if let Some(key) = &self.config.secret_key {
            let fingerprint = info.fingerprint(&self.config.store_dir);
            let sig = key.sign(fingerprint);
            if !narinfo.sigs.contains(&sig) {
                narinfo.sigs.push(sig);
            }
        }

        debug!(path = %info.path, url = %nar_url, "uploading NAR");
        self.transport
            .upsert_file(&nar_url, compressed, "application/x-nix-nar")
            .await?;
        // Narinfo strictly after the NAR body.
        self.transport
            .upsert_file(
                &Self::narinfo_path(&info.path),
                narinfo.render().into_bytes(),
                "text/x-nix-narinfo",
            )
            .await?;

        if let Some(cache) = &self.disk_cache
            && let Err(e) =
                cache.record(&self.transport.url(), &info.path.hash_part(), Some(&narinfo.render()))
        {
            warn!("failed to update narinfo disk cache: {e}");
        }
        Ok(())
    }

    async fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>> {
        match self
            .transport
            .get_file_contents(&format!("realisations/{id}.doi"))
            .await
        {
            Ok(bytes) => Ok(Some(Realisation::from_json(&bytes).map_err(|e| {
                StoreError::Corrupt(format!("realisation {id}: {e}"))
            })?)),
            Err(StoreError::NoSuchBinaryCacheFile(..)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn register_realisation(&self, realisation: &Realisation) -> Result<()> {
        self.transport
            .upsert_file(
                &format!("realisations/{}.doi", realisation.id),
                realisation.to_json(),
                "application/json",
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FileTransport;
    use cadenza_store_core::OutputName;
    use std::collections::BTreeSet;
    use std::pin::Pin;

    fn file_cache(root: &std::path::Path, config: BinaryCacheConfig) -> BinaryCacheStore {
        BinaryCacheStore::new(config, Box::new(FileTransport::new(root)))
    }

    async fn make_nar() -> (tempfile::TempDir, Vec<u8>) {
        let dir = tempfile::TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir(&tree).unwrap();
        std::fs::write(tree.join("data"), b"cache me if you can").unwrap();
        let nar = cadenza_nar::dump_to_vec(&tree).await.unwrap();
        (dir, nar)
    }

    fn info_for(nar: &[u8]) -> ValidPathInfo {
        let path = StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();
        ValidPathInfo::new(
            path,
            cadenza_utils_hash::NarHash::digest(nar),
            nar.len() as u64,
        )
    }

    #[tokio::test]
    async fn upload_then_download_roundtrip() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                require_sigs: false,
                compression: Compression::Zstd,
                ..Default::default()
            },
        );
        store.init().await.unwrap();

        let (_tree_dir, nar) = make_nar().await;
        let info = info_for(&nar);
        store
            .add_to_store(
                &info,
                Box::pin(std::io::Cursor::new(nar.clone())),
                false,
                CheckSigs::Skip,
            )
            .await
            .unwrap();

        // The narinfo exists and references an existing NAR.
        let fetched = store.query_path_info(&info.path).await.unwrap().unwrap();
        assert_eq!(fetched.nar_hash, info.nar_hash);
        assert_eq!(fetched.nar_size, info.nar_size);

        let mut out = Vec::new();
        let pinned_out: Pin<&mut Vec<u8>> = Pin::new(&mut out);
        store.nar_from_path(&info.path, pinned_out).await.unwrap();
        assert_eq!(out, nar);
    }

    #[tokio::test]
    async fn upload_signs_and_download_verifies() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        let key = SecretKey::generate("test-cache-1");
        let public = key.to_public();

        let writer = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                secret_key: Some(key),
                require_sigs: false,
                compression: Compression::None,
                ..Default::default()
            },
        );
        writer.init().await.unwrap();

        let (_tree_dir, nar) = make_nar().await;
        let info = info_for(&nar);
        writer
            .add_to_store(
                &info,
                Box::pin(std::io::Cursor::new(nar)),
                false,
                CheckSigs::Skip,
            )
            .await
            .unwrap();

        // A verifying reader with the right key accepts…
        let reader = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                require_sigs: true,
                trusted_public_keys: vec![public],
                ..Default::default()
            },
        );
        assert!(reader.query_path_info(&info.path).await.unwrap().is_some());

        // …and one with the wrong key refuses.
        let wrong = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                require_sigs: true,
                trusted_public_keys: vec![SecretKey::generate("other-1").to_public()],
                ..Default::default()
            },
        );
        let err = wrong.query_path_info(&info.path).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingSignature(_)));
    }

    #[tokio::test]
    async fn missing_path_is_none_not_error() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                require_sigs: false,
                ..Default::default()
            },
        );
        store.init().await.unwrap();

        let path = StorePath::from_base_path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-gone").unwrap();
        assert!(store.query_path_info(&path).await.unwrap().is_none());
        assert!(!store.is_valid_path(&path).await.unwrap());
    }

    #[tokio::test]
    async fn disk_cache_remembers_negative_lookups() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        let disk_cache = Arc::new(NarInfoDiskCache::open_memory().unwrap());
        let store = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                require_sigs: false,
                ..Default::default()
            },
        )
        .with_disk_cache(Arc::clone(&disk_cache));
        store.init().await.unwrap();

        let path = StorePath::from_base_path("cccccccccccccccccccccccccccccccc-nope").unwrap();
        assert!(store.query_path_info(&path).await.unwrap().is_none());
        assert_eq!(
            disk_cache
                .lookup(&store.uri(), &path.hash_part())
                .unwrap(),
            CachedLookup::Absent
        );
    }

    #[tokio::test]
    async fn realisation_roundtrip() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                require_sigs: false,
                ..Default::default()
            },
        );

        let id = DrvOutput {
            drv_hash: Algorithm::SHA256.digest("some-drv"),
            output_name: OutputName::out(),
        };
        let realisation = Realisation::new(
            id.clone(),
            StorePath::from_base_path("dddddddddddddddddddddddddddddddd-out").unwrap(),
        );
        store.register_realisation(&realisation).await.unwrap();

        let found = store.query_realisation(&id).await.unwrap().unwrap();
        assert_eq!(found, realisation);
        assert!(
            store
                .query_realisation(&DrvOutput {
                    drv_hash: Algorithm::SHA256.digest("other"),
                    output_name: OutputName::out(),
                })
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn init_rejects_foreign_store_dir() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            cache_dir.path().join("nix-cache-info"),
            "StoreDir: /other/store\n",
        )
        .unwrap();
        let store = file_cache(cache_dir.path(), BinaryCacheConfig::default());
        assert!(store.init().await.is_err());
    }

    #[tokio::test]
    async fn references_survive_narinfo_roundtrip() {
        let cache_dir = tempfile::TempDir::new().unwrap();
        let store = file_cache(
            cache_dir.path(),
            BinaryCacheConfig {
                require_sigs: false,
                compression: Compression::None,
                ..Default::default()
            },
        );
        store.init().await.unwrap();

        let (_tree_dir, nar) = make_nar().await;
        let mut info = info_for(&nar);
        info.references = BTreeSet::from([
            info.path.clone(),
            StorePath::from_base_path("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee-dep").unwrap(),
        ]);
        store
            .add_to_store(
                &info,
                Box::pin(std::io::Cursor::new(nar)),
                false,
                CheckSigs::Skip,
            )
            .await
            .unwrap();

        let fetched = store.query_path_info(&info.path).await.unwrap().unwrap();
        assert_eq!(fetched.references, info.references);
    }

    #[test]
    fn narinfo_path_shape() {
        let path = StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-x").unwrap();
        assert_eq!(
            BinaryCacheStore::narinfo_path(&path),
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa.narinfo"
        );
    }
}
