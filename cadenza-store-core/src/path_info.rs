// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Metadata describing a valid store path.

use std::collections::BTreeSet;
use std::time::SystemTime;

use cadenza_utils_hash::NarHash;

use crate::content_address::ContentAddress;
use crate::fingerprint::fingerprint_path;
use crate::signature::NarSignature;
use crate::signing::{PublicKey, SecretKey};
use crate::store_path::{StoreDir, StorePath};

/// Everything the store records about one valid path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub path: StorePath,
    /// The derivation that produced this path, when known.
    pub deriver: Option<StorePath>,
    pub nar_hash: NarHash,
    pub nar_size: u64,
    /// Store paths referenced by this object, possibly including itself.
    pub references: BTreeSet<StorePath>,
    pub registration_time: SystemTime,
    /// True when the path was built locally under this store's trust.
    pub ultimate: bool,
    pub signatures: BTreeSet<NarSignature>,
    /// Present when the path is content-addressed.
    pub ca: Option<ContentAddress>,
}

impl ValidPathInfo {
    pub fn new(path: StorePath, nar_hash: NarHash, nar_size: u64) -> Self {
        Self {
            path,
            deriver: None,
            nar_hash,
            nar_size,
            references: BTreeSet::new(),
            registration_time: SystemTime::now(),
            ultimate: false,
            signatures: BTreeSet::new(),
            ca: None,
        }
    }

    /// The canonical string that signatures cover.
    pub fn fingerprint(&self, store_dir: &StoreDir) -> String {
        fingerprint_path(
            store_dir,
            &self.path,
            &self.nar_hash,
            self.nar_size,
            &self.references,
        )
    }

    /// Add a signature produced by `key`.
    pub fn sign(&mut self, store_dir: &StoreDir, key: &SecretKey) {
        let fingerprint = self.fingerprint(store_dir);
        self.signatures.insert(key.sign(fingerprint));
    }

    /// Number of signatures that verify under `keys`.
    pub fn count_valid_signatures(&self, store_dir: &StoreDir, keys: &[PublicKey]) -> usize {
        let fingerprint = self.fingerprint(store_dir);
        self.signatures
            .iter()
            .filter(|sig| keys.iter().any(|key| key.verify(&fingerprint, sig)))
            .count()
    }

    /// Whether this path counts as trusted: built locally, carrying a valid
    /// signature, or content-addressed (checkable from the bytes).
    pub fn is_trusted(&self, store_dir: &StoreDir, keys: &[PublicKey]) -> bool {
        self.ultimate || self.ca.is_some() || self.count_valid_signatures(store_dir, keys) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_utils_hash::Algorithm;

    fn some_info() -> ValidPathInfo {
        let path = StorePath::from_base_path("7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-foo").unwrap();
        let nar_hash = NarHash::new(Algorithm::SHA256.digest("x").digest_bytes());
        ValidPathInfo::new(path, nar_hash, 42)
    }

    #[test]
    fn sign_then_verify() {
        let dir = StoreDir::default();
        let key = SecretKey::generate("test-1");
        let mut info = some_info();
        assert_eq!(info.count_valid_signatures(&dir, &[key.to_public()]), 0);

        info.sign(&dir, &key);
        assert_eq!(info.count_valid_signatures(&dir, &[key.to_public()]), 1);

        let other = SecretKey::generate("other-1");
        assert_eq!(info.count_valid_signatures(&dir, &[other.to_public()]), 0);
    }

    #[test]
    fn signature_invalidated_by_reference_change() {
        let dir = StoreDir::default();
        let key = SecretKey::generate("test-1");
        let mut info = some_info();
        info.sign(&dir, &key);

        info.references
            .insert(StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep").unwrap());
        assert_eq!(info.count_valid_signatures(&dir, &[key.to_public()]), 0);
    }

    #[test]
    fn trust_sources() {
        let dir = StoreDir::default();
        let mut info = some_info();
        assert!(!info.is_trusted(&dir, &[]));
        info.ultimate = true;
        assert!(info.is_trusted(&dir, &[]));
        info.ultimate = false;
        info.ca = Some(
            crate::content_address::ContentAddress::parse(
                "fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s",
            )
            .unwrap(),
        );
        assert!(info.is_trusted(&dir, &[]));
    }
}
