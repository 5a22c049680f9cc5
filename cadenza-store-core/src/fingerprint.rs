// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The canonical string that path signatures sign.

use std::collections::BTreeSet;

use cadenza_utils_hash::NarHash;

use crate::store_path::{StoreDir, StorePath};

/// Render the version-1 path fingerprint:
///
/// `1;<path>;<narHash>;<narSize>;<ref1>,<ref2>,…`
///
/// References are absolute paths in sorted order; the NAR hash uses the
/// prefixed base32 form. Every signer and verifier must produce this string
/// byte for byte.
pub fn fingerprint_path(
    store_dir: &StoreDir,
    path: &StorePath,
    nar_hash: &NarHash,
    nar_size: u64,
    references: &BTreeSet<StorePath>,
) -> String {
    let refs = references
        .iter()
        .map(|r| store_dir.display_path(r))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "1;{};{};{};{}",
        store_dir.display_path(path),
        nar_hash,
        nar_size,
        refs
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_utils_hash::Algorithm;

    #[test]
    fn fingerprint_shape() {
        let dir = StoreDir::default();
        let path = StorePath::from_base_path("7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-foo").unwrap();
        let r1 = StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep1").unwrap();
        let r2 = StorePath::from_base_path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep2").unwrap();
        let nar_hash = NarHash::new(Algorithm::SHA256.digest("x").digest_bytes());

        let refs = BTreeSet::from([r2.clone(), r1.clone()]);
        let fp = fingerprint_path(&dir, &path, &nar_hash, 1234, &refs);

        assert!(fp.starts_with("1;/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-foo;sha256:"));
        assert!(fp.ends_with(
            ";1234;/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep1,/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep2"
        ));
    }

    #[test]
    fn empty_references() {
        let dir = StoreDir::default();
        let path = StorePath::from_base_path("7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-foo").unwrap();
        let nar_hash = NarHash::new(Algorithm::SHA256.digest("x").digest_bytes());
        let fp = fingerprint_path(&dir, &path, &nar_hash, 0, &BTreeSet::new());
        assert!(fp.ends_with(";0;"));
    }
}
