// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The local store engine.
//!
//! Owns an object tree (the store directory), a SQLite metadata registry
//! and the state directory (GC roots, temp roots, locks). All mutation
//! happens under the shared side of the global GC lock, so the collector
//! can exclude every writer by taking the exclusive side.
//!
//! Ingestion is staged: bytes land in a scratch location inside the store
//! filesystem, are hash-verified and canonicalised there, and only then
//! renamed onto the final path and registered — a path is never visible
//! under its final name in a half-written state.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt as _;
use tokio::sync::Mutex;
use tracing::{debug, info};

use cadenza_nar::restore;
use cadenza_store_core::content_address::{ContentAddress, FileIngestionMethod};
use cadenza_store_core::realisation::{DrvOutput, Realisation};
use cadenza_store_core::signing::{PublicKey, SecretKey};
use cadenza_store_core::store_path::{StoreDir, StorePath, StorePathName, StoreReferences};
use cadenza_store_core::ValidPathInfo;
use cadenza_store_db::{OpenMode, RegisterPathParams, StoreDb};
use cadenza_utils_hash::{Algorithm, Encoding, Hash, HashingReader, NarHash};

use crate::error::{Result, StoreError};
use crate::pathlocks::{GcLock, LockMode, PathLock};
use crate::store::{CheckSigs, NarSink, NarSource, Store, Trust};
use crate::{canonicalize, closure};

/// Configuration of a local store.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    pub store_dir: StoreDir,
    /// Holds the database, GC roots, temp roots and locks.
    pub state_dir: PathBuf,
    /// Require a valid signature (or content address) on ingested paths.
    pub require_sigs: bool,
    pub trusted_public_keys: Vec<PublicKey>,
    /// Start an automatic GC when free space drops below this.
    pub min_free: u64,
    /// Target free space for the automatic GC.
    pub max_free: u64,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            store_dir: StoreDir::default(),
            state_dir: PathBuf::from("/nix/var/nix"),
            require_sigs: true,
            trusted_public_keys: Vec::new(),
            min_free: 0,
            max_free: u64::MAX,
        }
    }
}

impl LocalStoreConfig {
    /// A store rooted under `root`, for tests and chroot-style stores.
    pub fn under_root(root: &Path) -> Self {
        Self {
            store_dir: StoreDir::new(root.join("store").to_string_lossy().into_owned())
                .expect("absolute root yields a valid store dir"),
            state_dir: root.join("var"),
            require_sigs: false,
            ..Default::default()
        }
    }
}

/// The SQLite-backed local store.
pub struct LocalStore {
    config: LocalStoreConfig,
    pub(crate) db: Arc<Mutex<StoreDb>>,
    /// Open, exclusively locked temp-roots file for this process.
    pub(crate) temp_roots: std::sync::Mutex<Option<nix::fcntl::Flock<std::fs::File>>>,
    /// Single-flight guard for the automatic GC.
    pub(crate) auto_gc_running: Arc<Mutex<()>>,
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

impl LocalStore {
    /// Open (creating when necessary) the store described by `config`.
    pub async fn open(config: LocalStoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(config.store_dir.to_path()).await?;
        tokio::fs::create_dir_all(config.state_dir.join("db")).await?;
        tokio::fs::create_dir_all(config.state_dir.join("temproots")).await?;
        tokio::fs::create_dir_all(config.state_dir.join("gcroots").join("auto")).await?;

        let db_path = config.state_dir.join("db").join("db.sqlite");
        let db = tokio::task::spawn_blocking(move || StoreDb::open(db_path, OpenMode::Create))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        info!(store_dir = %config.store_dir, "opened local store");
        Ok(Self {
            config,
            db: Arc::new(Mutex::new(db)),
            temp_roots: std::sync::Mutex::new(None),
            auto_gc_running: Arc::new(Mutex::new(())),
        })
    }

    pub fn config(&self) -> &LocalStoreConfig {
        &self.config
    }

    /// Absolute filesystem location of a store path.
    pub fn real_path(&self, path: &StorePath) -> PathBuf {
        self.config.store_dir.real_path(path)
    }

    /// Absolute textual form of a store path.
    pub fn display_path(&self, path: &StorePath) -> String {
        self.config.store_dir.display_path(path)
    }

    pub(crate) fn gc_lock_path(&self) -> PathBuf {
        self.config.state_dir.join("gc.lock")
    }

    pub(crate) fn temproots_dir(&self) -> PathBuf {
        self.config.state_dir.join("temproots")
    }

    pub(crate) fn gcroots_dir(&self) -> PathBuf {
        self.config.state_dir.join("gcroots")
    }

    pub(crate) fn links_dir(&self) -> PathBuf {
        self.config.store_dir.to_path().join(".links")
    }

    /// Take the shared (writer) side of the GC lock.
    pub(crate) async fn writer_lock(&self) -> Result<GcLock> {
        let lock_path = self.gc_lock_path();
        tokio::task::spawn_blocking(move || GcLock::acquire(&lock_path, LockMode::Shared))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
            .map_err(StoreError::Io)
    }

    /// A fresh scratch directory on the store filesystem (so the final
    /// rename is atomic).
    async fn scratch_dir(&self) -> Result<PathBuf> {
        let id = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = self.config.store_dir.to_path().join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            id
        ));
        tokio::fs::create_dir(&dir).await?;
        Ok(dir)
    }

    fn row_to_info(&self, row: cadenza_store_db::PathInfoRow) -> Result<ValidPathInfo> {
        let path = self.config.store_dir.parse_path(&row.path)?;
        let hash = Hash::parse_any(&row.hash)
            .map_err(|e| StoreError::Corrupt(format!("bad hash for '{}': {e}", row.path)))?;
        let nar_hash = NarHash::try_from(hash)
            .map_err(|e| StoreError::Corrupt(format!("bad NAR hash for '{}': {e}", row.path)))?;

        let mut info = ValidPathInfo::new(path, nar_hash, row.nar_size.unwrap_or(0));
        info.registration_time = row.registration_time;
        info.ultimate = row.ultimate;
        if let Some(deriver) = &row.deriver {
            info.deriver = Some(self.config.store_dir.parse_path(deriver)?);
        }
        for reference in &row.references {
            info.references
                .insert(self.config.store_dir.parse_path(reference)?);
        }
        if let Some(sigs) = &row.sigs {
            for sig in sigs.split_whitespace() {
                info.signatures.insert(sig.parse().map_err(|e| {
                    StoreError::Corrupt(format!("bad signature on '{}': {e}", row.path))
                })?);
            }
        }
        if let Some(ca) = &row.ca {
            info.ca = Some(ca.parse().map_err(|e| {
                StoreError::Corrupt(format!("bad content address on '{}': {e}", row.path))
            })?);
        }
        Ok(info)
    }

    fn info_to_params(&self, info: &ValidPathInfo) -> RegisterPathParams {
        let sigs = if info.signatures.is_empty() {
            None
        } else {
            Some(
                info.signatures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        };
        RegisterPathParams {
            path: self.display_path(&info.path),
            hash: Hash::from(info.nar_hash).format(Encoding::Base16),
            registration_time: info.registration_time,
            deriver: info.deriver.as_ref().map(|d| self.display_path(d)),
            nar_size: Some(info.nar_size),
            ultimate: info.ultimate,
            sigs,
            ca: info.ca.as_ref().map(ToString::to_string),
            references: info
                .references
                .iter()
                .map(|r| self.display_path(r))
                .collect(),
        }
    }

    /// Atomically register a batch of paths; every reference must be
    /// valid already or a member of the batch.
    pub async fn register_valid_paths(&self, batch: Vec<ValidPathInfo>) -> Result<()> {
        let _writer = self.writer_lock().await?;
        let params: Vec<RegisterPathParams> =
            batch.iter().map(|info| self.info_to_params(info)).collect();
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut db = db.blocking_lock();
            db.register_valid_paths(&params).map(drop)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// Store `contents` as a text object (the `.drv` form), returning its
    /// path. Idempotent.
    pub async fn add_text_to_store(
        &self,
        name: &StorePathName,
        contents: &[u8],
        refs: &StoreReferences,
    ) -> Result<StorePath> {
        let path = self
            .config
            .store_dir
            .compute_store_path_for_text(name, contents, refs)?;
        if self.is_valid_path(&path).await? {
            return Ok(path);
        }

        let _writer = self.writer_lock().await?;
        let real = self.real_path(&path);
        let _lock = lock_path_blocking(&real).await?;

        let scratch = self.scratch_dir().await?;
        let staged = scratch.join("text");
        tokio::fs::write(&staged, contents).await?;
        canonicalize::canonicalise_path_metadata(&staged).await?;

        if tokio::fs::symlink_metadata(&real).await.is_ok() {
            remove_path_forcibly(&real).await?;
        }
        tokio::fs::rename(&staged, &real).await?;
        let _ = tokio::fs::remove_dir(&scratch).await;

        let (nar_hash, nar_size) = cadenza_nar::hash_modulo::nar_hash_and_size(&real).await?;

        let mut info = ValidPathInfo::new(path.clone(), nar_hash, nar_size);
        info.references = refs.others.clone();
        info.ultimate = true;
        info.ca = Some(ContentAddress::Text(
            Algorithm::SHA256.digest(contents),
        ));
        self.register_one(&info).await?;
        debug!(path = %path, "added text object");
        Ok(path)
    }

    /// Ingest an arbitrary byte stream, either flat or as a NAR, and
    /// compute its content-addressed path.
    pub async fn add_to_store_from_dump(
        &self,
        mut dump: NarSource,
        name: &StorePathName,
        method: FileIngestionMethod,
        hash_algo: Algorithm,
        refs: &StoreReferences,
        repair: bool,
    ) -> Result<StorePath> {
        // Spool to scratch while hashing: the final path depends on the
        // hash, so nothing can be materialised in place yet.
        let scratch = self.scratch_dir().await?;
        let spool_path = scratch.join("dump");
        let mut hasher = cadenza_utils_hash::HashSink::new(hash_algo);
        {
            let mut spool = tokio::fs::File::create(&spool_path).await?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let got = dump.read(&mut buf).await?;
                if got == 0 {
                    break;
                }
                hasher.update(&buf[..got]);
                tokio::io::AsyncWriteExt::write_all(&mut spool, &buf[..got]).await?;
            }
            tokio::io::AsyncWriteExt::flush(&mut spool).await?;
        }
        let (_, hash) = hasher.finish();

        let path = self
            .config
            .store_dir
            .make_fixed_output_path(method, &hash, name, refs)?;
        if self.is_valid_path(&path).await? && !repair {
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Ok(path);
        }

        let _writer = self.writer_lock().await?;
        let real = self.real_path(&path);
        let _lock = lock_path_blocking(&real).await?;

        // Materialise the object from the spool.
        let staged = scratch.join("obj");
        match method {
            FileIngestionMethod::Recursive => {
                let spool = tokio::fs::File::open(&spool_path).await?;
                restore::restore(tokio::io::BufReader::new(spool), &staged).await?;
            }
            FileIngestionMethod::Flat => {
                tokio::fs::copy(&spool_path, &staged).await?;
            }
        }
        canonicalize::canonicalise_path_metadata(&staged).await?;

        if tokio::fs::symlink_metadata(&real).await.is_ok() {
            remove_path_forcibly(&real).await?;
        }
        tokio::fs::rename(&staged, &real).await?;
        let _ = tokio::fs::remove_file(&spool_path).await;
        let _ = tokio::fs::remove_dir(&scratch).await;

        let (nar_hash, nar_size) = cadenza_nar::hash_modulo::nar_hash_and_size(&real).await?;

        let mut info = ValidPathInfo::new(path.clone(), nar_hash, nar_size);
        info.references = refs.others.clone();
        if refs.self_ref {
            info.references.insert(path.clone());
        }
        info.ultimate = true;
        info.ca = Some(ContentAddress::Fixed(method, hash));
        self.register_one(&info).await?;
        Ok(path)
    }

    pub(crate) async fn register_one(&self, info: &ValidPathInfo) -> Result<()> {
        let params = self.info_to_params(info);
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut db = db.blocking_lock();
            db.register_valid_path(&params).map(drop)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    /// The closure of `paths` under references (or referrers when
    /// `backwards`).
    pub async fn compute_fs_closure(
        &self,
        paths: BTreeSet<StorePath>,
        backwards: bool,
    ) -> Result<BTreeSet<StorePath>> {
        closure::compute_closure(paths, |path| async move {
            let display = self.display_path(&path);
            let db = self.db.lock().await;
            let edges = if backwards {
                db.query_referrers(&display)?
            } else {
                db.query_references(&display)?
            };
            drop(db);
            let mut out = BTreeSet::new();
            for edge in edges {
                let p = self.config.store_dir.parse_path(&edge)?;
                if p != path {
                    out.insert(p);
                }
            }
            Ok::<_, StoreError>(out)
        })
        .await
    }

    /// All valid paths, parsed.
    pub async fn all_valid_paths(&self) -> Result<BTreeSet<StorePath>> {
        let db = self.db.lock().await;
        let raw = db.query_all_valid_paths()?;
        drop(db);
        raw.iter()
            .map(|p| self.config.store_dir.parse_path(p).map_err(StoreError::from))
            .collect()
    }

    /// Valid derivations recorded as producing `path`.
    pub async fn query_valid_derivers(&self, path: &StorePath) -> Result<Vec<StorePath>> {
        let display = self.display_path(path);
        let db = self.db.lock().await;
        let raw = db.query_valid_derivers(&display)?;
        drop(db);
        raw.iter()
            .map(|p| self.config.store_dir.parse_path(p).map_err(StoreError::from))
            .collect()
    }

    pub async fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let display = self.display_path(path);
        let db = self.db.lock().await;
        let raw = db.query_referrers(&display)?;
        drop(db);
        raw.iter()
            .map(|p| self.config.store_dir.parse_path(p).map_err(StoreError::from))
            .collect()
    }

    /// Invalidate a path in the database only (the object file tree is
    /// handled by the caller, e.g. the collector).
    pub(crate) async fn invalidate_path(&self, path: &StorePath) -> Result<bool> {
        let display = self.display_path(path);
        let db = self.db.lock().await;
        Ok(db.invalidate_path(&display)?)
    }
}

/// Acquire a [`PathLock`] off the async runtime.
pub(crate) async fn lock_path_blocking(path: &Path) -> Result<PathLock> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || PathLock::lock(&path))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
        .map_err(StoreError::Io)
}

/// Remove a store object whose permissions have been canonicalised to
/// read-only: directories need their write bit restored first.
pub(crate) async fn remove_path_forcibly(path: &Path) -> Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        fn make_writable(path: &Path) -> std::io::Result<()> {
            use std::os::unix::fs::PermissionsExt as _;
            let meta = std::fs::symlink_metadata(path)?;
            if meta.is_dir() {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
                for entry in std::fs::read_dir(path)? {
                    make_writable(&entry?.path())?;
                }
            }
            Ok(())
        }
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            make_writable(&path)?;
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        }
    })
    .await
    .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    .map_err(StoreError::Io)
}

#[async_trait]
impl Store for LocalStore {
    fn store_dir(&self) -> &StoreDir {
        &self.config.store_dir
    }

    fn uri(&self) -> String {
        "local".to_owned()
    }

    fn is_trusted_client(&self) -> Trust {
        // In-process callers own the store.
        Trust::Trusted
    }

    async fn query_path_info(&self, path: &StorePath) -> Result<Option<ValidPathInfo>> {
        let display = self.display_path(path);
        let db = self.db.lock().await;
        let row = db.query_path_info(&display)?;
        drop(db);
        row.map(|row| self.row_to_info(row)).transpose()
    }

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        let display = self.display_path(path);
        let db = self.db.lock().await;
        Ok(db.is_valid_path(&display)?)
    }

    async fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<StorePath>> {
        let db = self.db.lock().await;
        let found = db.query_path_from_hash_part(self.config.store_dir.as_str(), hash_part)?;
        drop(db);
        found
            .map(|p| self.config.store_dir.parse_path(&p).map_err(StoreError::from))
            .transpose()
    }

    async fn nar_from_path(&self, path: &StorePath, mut sink: NarSink<'_>) -> Result<()> {
        if !self.is_valid_path(path).await? {
            return Err(StoreError::InvalidPath(self.display_path(path)));
        }
        cadenza_nar::dump_to_writer(self.real_path(path), &mut sink).await?;
        Ok(())
    }

    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        nar: NarSource,
        repair: bool,
        check_sigs: CheckSigs,
    ) -> Result<()> {
        let display = self.display_path(&info.path);

        if check_sigs == CheckSigs::Require
            && self.config.require_sigs
            && info.ca.is_none()
            && info.count_valid_signatures(
                &self.config.store_dir,
                &self.config.trusted_public_keys,
            ) == 0
        {
            return Err(StoreError::MissingSignature(display));
        }

        if self.is_valid_path(&info.path).await? && !repair {
            return Ok(());
        }

        let _writer = self.writer_lock().await?;
        let real = self.real_path(&info.path);
        let _lock = lock_path_blocking(&real).await?;

        // Restore into scratch while hashing the stream.
        let scratch = self.scratch_dir().await?;
        let staged = scratch.join("obj");
        let (reader, state) = HashingReader::new(tokio::io::BufReader::new(nar));
        let restore_result = restore::restore(reader, &staged).await;

        let state = Arc::try_unwrap(state)
            .map_err(|_| StoreError::Corrupt("hash state still shared".into()))?
            .into_inner()
            .expect("hash state mutex cannot be poisoned");
        let nar_size = state.bytes_read;
        let nar_hash = state.finish();

        if let Err(e) = restore_result {
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Err(e.into());
        }

        if nar_hash != Hash::from(info.nar_hash) {
            let _ = remove_path_forcibly(&staged).await;
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Err(StoreError::HashMismatch {
                path: display,
                expected: Hash::from(info.nar_hash).to_sri(),
                actual: nar_hash.to_sri(),
            });
        }
        if nar_size != info.nar_size {
            let _ = remove_path_forcibly(&staged).await;
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Err(StoreError::SizeMismatch {
                path: display,
                expected: info.nar_size,
                actual: nar_size,
            });
        }

        canonicalize::canonicalise_path_metadata(&staged).await?;

        if tokio::fs::symlink_metadata(&real).await.is_ok() {
            remove_path_forcibly(&real).await?;
        }
        tokio::fs::rename(&staged, &real).await?;
        let _ = tokio::fs::remove_dir(&scratch).await;

        if let Err(e) = self.register_one(info).await {
            // Roll back the object so the "valid implies present and
            // registered" invariant keeps holding.
            let _ = remove_path_forcibly(&real).await;
            return Err(e);
        }
        debug!(path = %info.path, nar_size, "added path to local store");
        Ok(())
    }

    async fn query_realisation(&self, id: &DrvOutput) -> Result<Option<Realisation>> {
        let drv_hash = id.drv_hash.to_string();
        let output_name = id.output_name.to_string();
        let db = self.db.lock().await;
        let Some(row) = db.query_realisation(&drv_hash, &output_name)? else {
            return Ok(None);
        };
        let path = db
            .path_by_id(row.output_path_id)?
            .ok_or_else(|| StoreError::Corrupt("realisation points at missing path".into()))?;
        drop(db);

        let mut realisation =
            Realisation::new(id.clone(), self.config.store_dir.parse_path(&path)?);
        if let Some(sigs) = row.signatures {
            for sig in sigs.split_whitespace() {
                realisation.signatures.insert(sig.parse().map_err(|e| {
                    StoreError::Corrupt(format!("bad realisation signature: {e}"))
                })?);
            }
        }
        Ok(Some(realisation))
    }

    async fn register_realisation(&self, realisation: &Realisation) -> Result<()> {
        let drv_hash = realisation.id.drv_hash.to_string();
        let output_name = realisation.id.output_name.to_string();
        let out_path = self.display_path(&realisation.out_path);
        let sigs = if realisation.signatures.is_empty() {
            None
        } else {
            Some(
                realisation
                    .signatures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        };
        let db = self.db.lock().await;
        db.register_realisation(&drv_hash, &output_name, &out_path, sigs.as_deref())?;
        Ok(())
    }
}

/// Sign an already-valid path with `key` and persist the signature.
pub async fn sign_path(store: &LocalStore, path: &StorePath, key: &SecretKey) -> Result<()> {
    let mut info = store
        .query_path_info(path)
        .await?
        .ok_or_else(|| StoreError::InvalidPath(store.display_path(path)))?;
    info.sign(&store.config.store_dir, key);
    let sigs = info
        .signatures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let display = store.display_path(path);
    let db = store.db.lock().await;
    db.update_signatures(&display, &sigs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_store_core::OutputName;

    pub(crate) async fn temp_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalStore::open(LocalStoreConfig::under_root(dir.path()))
            .await
            .unwrap();
        (dir, store)
    }

    fn name(s: &str) -> StorePathName {
        StorePathName::new(s).unwrap()
    }

    #[tokio::test]
    async fn text_object_roundtrip() {
        let (_dir, store) = temp_store().await;
        let path = store
            .add_text_to_store(&name("hello.drv"), b"recipe", &StoreReferences::default())
            .await
            .unwrap();

        assert!(store.is_valid_path(&path).await.unwrap());
        let real = store.real_path(&path);
        assert_eq!(std::fs::read(&real).unwrap(), b"recipe");

        let info = store.query_path_info(&path).await.unwrap().unwrap();
        assert!(matches!(info.ca, Some(ContentAddress::Text(_))));
        assert!(info.ultimate);

        // Idempotent: same contents, same path, no error.
        let again = store
            .add_text_to_store(&name("hello.drv"), b"recipe", &StoreReferences::default())
            .await
            .unwrap();
        assert_eq!(again, path);
    }

    #[tokio::test]
    async fn dump_ingestion_recursive() {
        let (dir, store) = temp_store().await;

        let tree = dir.path().join("input");
        std::fs::create_dir(&tree).unwrap();
        std::fs::write(tree.join("data"), b"payload").unwrap();
        let nar = cadenza_nar::dump_to_vec(&tree).await.unwrap();

        let path = store
            .add_to_store_from_dump(
                Box::pin(std::io::Cursor::new(nar)),
                &name("input"),
                FileIngestionMethod::Recursive,
                Algorithm::SHA256,
                &StoreReferences::default(),
                false,
            )
            .await
            .unwrap();

        assert!(store.is_valid_path(&path).await.unwrap());
        assert_eq!(
            std::fs::read(store.real_path(&path).join("data")).unwrap(),
            b"payload"
        );
        let info = store.query_path_info(&path).await.unwrap().unwrap();
        assert!(matches!(
            info.ca,
            Some(ContentAddress::Fixed(FileIngestionMethod::Recursive, _))
        ));
    }

    #[tokio::test]
    async fn nar_add_to_store_verifies_hash() {
        let (dir, store) = temp_store().await;

        let tree = dir.path().join("obj");
        std::fs::create_dir(&tree).unwrap();
        std::fs::write(tree.join("f"), b"contents").unwrap();
        let nar = cadenza_nar::dump_to_vec(&tree).await.unwrap();
        let nar_hash = NarHash::digest(&nar);

        let path = StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-obj").unwrap();
        let info = ValidPathInfo::new(path.clone(), nar_hash, nar.len() as u64);

        store
            .add_to_store(
                &info,
                Box::pin(std::io::Cursor::new(nar.clone())),
                false,
                CheckSigs::Skip,
            )
            .await
            .unwrap();
        assert!(store.is_valid_path(&path).await.unwrap());

        // Dumping back out reproduces the same NAR.
        let mut out = Vec::new();
        store
            .nar_from_path(&path, std::pin::Pin::new(&mut out))
            .await
            .unwrap();
        assert_eq!(out, nar);
    }

    #[tokio::test]
    async fn nar_add_to_store_rejects_wrong_hash() {
        let (dir, store) = temp_store().await;

        let tree = dir.path().join("obj");
        std::fs::create_dir(&tree).unwrap();
        std::fs::write(tree.join("f"), b"contents").unwrap();
        let nar = cadenza_nar::dump_to_vec(&tree).await.unwrap();

        let path = StorePath::from_base_path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-obj").unwrap();
        let wrong = NarHash::digest(b"something else");
        let info = ValidPathInfo::new(path.clone(), wrong, nar.len() as u64);

        let err = store
            .add_to_store(
                &info,
                Box::pin(std::io::Cursor::new(nar)),
                false,
                CheckSigs::Skip,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));

        // Neither registered nor materialised.
        assert!(!store.is_valid_path(&path).await.unwrap());
        assert!(!store.real_path(&path).exists());
    }

    #[tokio::test]
    async fn signature_requirement_enforced() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = LocalStoreConfig::under_root(dir.path());
        config.require_sigs = true;
        let store = LocalStore::open(config).await.unwrap();

        let nar = {
            let f = dir.path().join("f");
            std::fs::write(&f, b"x").unwrap();
            cadenza_nar::dump_to_vec(&f).await.unwrap()
        };
        let path = StorePath::from_base_path("cccccccccccccccccccccccccccccccc-f").unwrap();
        let info = ValidPathInfo::new(path, NarHash::digest(&nar), nar.len() as u64);

        let err = store
            .add_to_store(
                &info,
                Box::pin(std::io::Cursor::new(nar.clone())),
                false,
                CheckSigs::Require,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingSignature(_)));

        // Explicitly skipping the check admits the path.
        store
            .add_to_store(
                &info,
                Box::pin(std::io::Cursor::new(nar)),
                false,
                CheckSigs::Skip,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closure_follows_references() {
        let (_dir, store) = temp_store().await;

        // Build three text objects referencing each other: c -> b -> a.
        let a = store
            .add_text_to_store(&name("a"), b"a", &StoreReferences::default())
            .await
            .unwrap();
        let b = store
            .add_text_to_store(
                &name("b"),
                b"b",
                &StoreReferences {
                    others: BTreeSet::from([a.clone()]),
                    self_ref: false,
                },
            )
            .await
            .unwrap();
        let c = store
            .add_text_to_store(
                &name("c"),
                b"c",
                &StoreReferences {
                    others: BTreeSet::from([b.clone()]),
                    self_ref: false,
                },
            )
            .await
            .unwrap();

        let closure = store
            .compute_fs_closure(BTreeSet::from([c.clone()]), false)
            .await
            .unwrap();
        assert_eq!(closure, BTreeSet::from([a.clone(), b.clone(), c.clone()]));

        let referrers = store
            .compute_fs_closure(BTreeSet::from([a.clone()]), true)
            .await
            .unwrap();
        assert_eq!(referrers, BTreeSet::from([a, b, c]));
    }

    #[tokio::test]
    async fn hash_part_lookup() {
        let (_dir, store) = temp_store().await;
        let path = store
            .add_text_to_store(&name("lookup"), b"x", &StoreReferences::default())
            .await
            .unwrap();

        let found = store
            .query_path_from_hash_part(&path.hash_part())
            .await
            .unwrap();
        assert_eq!(found, Some(path));
    }

    #[tokio::test]
    async fn sign_path_persists_signature() {
        let (_dir, store) = temp_store().await;
        let path = store
            .add_text_to_store(&name("signed"), b"x", &StoreReferences::default())
            .await
            .unwrap();

        let key = SecretKey::generate("test-key-1");
        sign_path(&store, &path, &key).await.unwrap();

        let info = store.query_path_info(&path).await.unwrap().unwrap();
        assert_eq!(
            info.count_valid_signatures(store.store_dir(), &[key.to_public()]),
            1
        );
    }

    #[tokio::test]
    async fn realisation_roundtrip() {
        let (_dir, store) = temp_store().await;
        let out = store
            .add_text_to_store(&name("ca-out"), b"payload", &StoreReferences::default())
            .await
            .unwrap();

        let id = DrvOutput {
            drv_hash: Algorithm::SHA256.digest("drv"),
            output_name: OutputName::out(),
        };
        let realisation = Realisation::new(id.clone(), out.clone());
        store.register_realisation(&realisation).await.unwrap();

        let found = store.query_realisation(&id).await.unwrap().unwrap();
        assert_eq!(found.out_path, out);
    }
}
