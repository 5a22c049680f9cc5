// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Store consistency checking.

use std::collections::BTreeSet;

use tracing::{info, warn};

use cadenza_utils_hash::Hash;

use crate::error::Result;
use crate::local::LocalStore;
use crate::store::Store as _;

/// Outcome of a verification pass.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Human-readable descriptions of everything found wrong.
    pub errors: Vec<String>,
    /// Paths invalidated (missing) or re-registered during repair.
    pub repaired: Vec<String>,
}

impl VerifyResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl LocalStore {
    /// Walk every valid path and check it against the database.
    ///
    /// Presence and references are always checked. With `check_contents`
    /// the NAR of every path is recomputed and compared against the
    /// registered hash — expensive, but the only way to find bit rot.
    ///
    /// With `repair`, missing paths are invalidated (a rebuild or
    /// substitution can then bring them back); corrupted paths are
    /// reported but kept, since deleting the only copy helps nobody.
    pub async fn verify_store(&self, check_contents: bool, repair: bool) -> Result<VerifyResult> {
        let mut result = VerifyResult::default();
        let valid = self.all_valid_paths().await?;
        info!(paths = valid.len(), check_contents, "verifying store");

        // Pass 1: presence.
        let mut missing = BTreeSet::new();
        for path in &valid {
            if tokio::fs::symlink_metadata(self.real_path(path)).await.is_err() {
                result
                    .errors
                    .push(format!("path '{}' is valid but missing on disk", path));
                missing.insert(path.clone());
            }
        }

        if repair {
            // Referrer-first, so the foreign keys stay satisfiable.
            for path in &missing {
                for referrer in self.query_referrers(path).await? {
                    if !missing.contains(&referrer) {
                        result.errors.push(format!(
                            "referrer '{referrer}' of missing path '{path}' is still valid"
                        ));
                    }
                }
            }
            for path in missing.iter().rev() {
                if self.invalidate_path(path).await.unwrap_or(false) {
                    result.repaired.push(self.display_path(path));
                }
            }
        }

        // Pass 2: reference integrity.
        for path in &valid {
            if missing.contains(path) {
                continue;
            }
            let Some(info) = self.query_path_info(path).await? else {
                continue;
            };
            for reference in &info.references {
                if !valid.contains(reference) {
                    result.errors.push(format!(
                        "path '{path}' references invalid path '{reference}'"
                    ));
                }
            }

            // Pass 3 (optional): contents.
            if check_contents {
                let (nar_hash, nar_size) =
                    cadenza_nar::hash_modulo::nar_hash_and_size(self.real_path(path)).await?;
                if Hash::from(nar_hash) != Hash::from(info.nar_hash) {
                    warn!(path = %path, "content hash mismatch");
                    result.errors.push(format!(
                        "path '{path}' was modified: expected {}, got {}",
                        Hash::from(info.nar_hash),
                        Hash::from(nar_hash),
                    ));
                } else if nar_size != info.nar_size {
                    result.errors.push(format!(
                        "path '{path}' has wrong NAR size: expected {}, got {nar_size}",
                        info.nar_size
                    ));
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalStore, LocalStoreConfig};
    use cadenza_store_core::store_path::{StorePathName, StoreReferences};

    async fn temp_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = LocalStore::open(LocalStoreConfig::under_root(dir.path()))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn clean_store_verifies() {
        let (_dir, store) = temp_store().await;
        store
            .add_text_to_store(
                &StorePathName::new("ok").unwrap(),
                b"fine",
                &StoreReferences::default(),
            )
            .await
            .unwrap();

        let result = store.verify_store(true, false).await.unwrap();
        assert!(result.is_clean(), "{:?}", result.errors);
    }

    #[tokio::test]
    async fn missing_path_detected_and_repaired() {
        let (_dir, store) = temp_store().await;
        let path = store
            .add_text_to_store(
                &StorePathName::new("vanishing").unwrap(),
                b"soon gone",
                &StoreReferences::default(),
            )
            .await
            .unwrap();
        std::fs::remove_file(store.real_path(&path)).unwrap();

        let result = store.verify_store(false, false).await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(store.is_valid_path(&path).await.unwrap(), "no repair yet");

        let result = store.verify_store(false, true).await.unwrap();
        assert_eq!(result.repaired.len(), 1);
        assert!(!store.is_valid_path(&path).await.unwrap());
    }

    #[tokio::test]
    async fn corruption_detected_by_content_check() {
        let (_dir, store) = temp_store().await;
        let path = store
            .add_text_to_store(
                &StorePathName::new("bits").unwrap(),
                b"original bits",
                &StoreReferences::default(),
            )
            .await
            .unwrap();

        // Flip the contents behind the store's back.
        let real = store.real_path(&path);
        let mut perms = std::fs::metadata(&real).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt as _;
        perms.set_mode(0o644);
        std::fs::set_permissions(&real, perms).unwrap();
        std::fs::write(&real, b"corrupted bits").unwrap();

        let result = store.verify_store(false, false).await.unwrap();
        assert!(result.is_clean(), "presence-only check sees nothing");

        let result = store.verify_store(true, false).await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("was modified"));
        // The object is reported, not deleted.
        assert!(store.is_valid_path(&path).await.unwrap());
    }
}
