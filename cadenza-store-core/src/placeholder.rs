// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Output placeholders.
//!
//! Builds of content-addressed derivations cannot know their output paths
//! ahead of time, so the environment hands the builder an opaque
//! placeholder instead. The placeholder is an illegal store path (its
//! "hash part" is 52 characters), which guarantees it can never collide
//! with a real path; after the build the executor rewrites every
//! occurrence to the final path.

use cadenza_utils_hash::{Algorithm, Hash};

use cadenza_utils_base_encoding as base32;

use crate::derivation::OutputName;
use crate::realisation::DrvOutput;

/// Placeholder for an output of the derivation being built, as substituted
/// into `$out` and friends: `/<base32(sha256("nix-output:<name>"))>`.
pub fn hash_placeholder(output_name: &OutputName) -> String {
    let hash = Algorithm::SHA256.digest(format!("nix-output:{output_name}"));
    format!("/{}", base32::encode(hash.digest_bytes()))
}

/// Placeholder for an output of a *dependency* derivation whose path is
/// not yet known: `/<base32(sha256("nix-upstream-output:<drv-hash>:<name>"))>`.
pub fn downstream_placeholder(drv_hash: &Hash, output_name: &OutputName) -> String {
    let hash = Algorithm::SHA256.digest(format!(
        "nix-upstream-output:{}:{}",
        drv_hash.to_base32(),
        output_name
    ));
    format!("/{}", base32::encode(hash.digest_bytes()))
}

/// Placeholder for a dependency realisation, by its id.
pub fn realisation_placeholder(id: &DrvOutput) -> String {
    downstream_placeholder(&id.drv_hash, &id.output_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_stable_and_path_shaped() {
        let a = hash_placeholder(&OutputName::out());
        let b = hash_placeholder(&OutputName::out());
        assert_eq!(a, b);
        assert!(a.starts_with('/'));
        // 52 characters of base32: deliberately not a valid store path
        // hash part, which is 32.
        assert_eq!(a.len(), 1 + 52);
    }

    #[test]
    fn distinct_outputs_get_distinct_placeholders() {
        let out = hash_placeholder(&OutputName::out());
        let dev = hash_placeholder(&OutputName::new("dev").unwrap());
        assert_ne!(out, dev);
    }

    #[test]
    fn downstream_differs_from_direct() {
        let drv_hash = Algorithm::SHA256.digest("drv");
        let direct = hash_placeholder(&OutputName::out());
        let downstream = downstream_placeholder(&drv_hash, &OutputName::out());
        assert_ne!(direct, downstream);
    }
}
