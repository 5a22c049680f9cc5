// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Store paths and the rules that construct them.
//!
//! A store path is `<storeDir>/<hashPart>-<name>` where the hash part is
//! exactly 32 nix-base32 characters (a 20-byte digest) and the name is
//! drawn from a restricted charset. [`StorePath`] is the relative part
//! (`<hashPart>-<name>`); prepending the store directory is always explicit
//! through [`StoreDir`], because paths from different store directories are
//! not comparable.
//!
//! The constructors at the bottom ([`StoreDir::make_store_path`] and
//! friends) implement the store-path derivation rules: they are pure
//! functions of their inputs and never touch the filesystem.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadenza_utils_base_encoding as base32;
use cadenza_utils_hash::{Algorithm, Encoding, Hash};

use crate::content_address::FileIngestionMethod;

/// Size in bytes of the digest in a store path hash part.
pub const STORE_PATH_HASH_BYTES: usize = 20;

/// Maximum length of a store path name.
pub const STORE_PATH_NAME_MAX: usize = 211;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BadStorePath {
    #[error("path '{0}' is not in the store directory")]
    NotInStore(String),
    #[error("store path '{0}' lacks a hash part")]
    MissingHashPart(String),
    #[error("store path hash part '{0}' is invalid")]
    BadHashPart(String),
    #[error("store path name '{0}' is invalid")]
    BadName(String),
    #[error("references are not allowed in '{0}'")]
    RefsNotAllowed(String),
}

/// The 20-byte digest identifying a store object, displayed as 32
/// nix-base32 characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathHash([u8; STORE_PATH_HASH_BYTES]);

impl StorePathHash {
    /// Length of the textual hash part.
    pub const fn encoded_len() -> usize {
        base32::encoded_len(STORE_PATH_HASH_BYTES)
    }

    pub fn new(bytes: [u8; STORE_PATH_HASH_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STORE_PATH_HASH_BYTES] {
        &self.0
    }

    fn parse(s: &str) -> Result<Self, BadStorePath> {
        if s.len() != Self::encoded_len() {
            return Err(BadStorePath::BadHashPart(s.to_owned()));
        }
        let bytes =
            base32::decode(s.as_bytes()).map_err(|_| BadStorePath::BadHashPart(s.to_owned()))?;
        let mut out = [0u8; STORE_PATH_HASH_BYTES];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Compress an arbitrary-size digest to the store path hash size by
    /// XOR-folding.
    pub fn compress(hash: &Hash) -> Self {
        let mut out = [0u8; STORE_PATH_HASH_BYTES];
        for (i, byte) in hash.digest_bytes().iter().enumerate() {
            out[i % STORE_PATH_HASH_BYTES] ^= byte;
        }
        Self(out)
    }
}

impl fmt::Display for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base32::encode(&self.0))
    }
}

/// A validated store path name: `[A-Za-z0-9+._?=-]{1,211}`, not starting
/// with a period.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePathName(String);

impl StorePathName {
    pub fn new(name: impl Into<String>) -> Result<Self, BadStorePath> {
        let name = name.into();
        if name.is_empty() || name.len() > STORE_PATH_NAME_MAX || name.starts_with('.') {
            return Err(BadStorePath::BadName(name));
        }
        let valid = name.bytes().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
        });
        if !valid {
            return Err(BadStorePath::BadName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StorePathName {
    type Err = BadStorePath;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// The store-relative part of a store path: `<hashPart>-<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    hash: StorePathHash,
    name: StorePathName,
}

impl StorePath {
    pub fn new(hash: StorePathHash, name: StorePathName) -> Self {
        Self { hash, name }
    }

    /// Parse a base path of the form `<32 base32 chars>-<name>`.
    pub fn from_base_path(base: &str) -> Result<Self, BadStorePath> {
        let (hash_part, rest) = base
            .split_at_checked(StorePathHash::encoded_len())
            .ok_or_else(|| BadStorePath::MissingHashPart(base.to_owned()))?;
        let name = rest
            .strip_prefix('-')
            .ok_or_else(|| BadStorePath::MissingHashPart(base.to_owned()))?;
        Ok(Self {
            hash: StorePathHash::parse(hash_part)?,
            name: StorePathName::new(name)?,
        })
    }

    pub fn hash(&self) -> &StorePathHash {
        &self.hash
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    /// The textual hash part.
    pub fn hash_part(&self) -> String {
        self.hash.to_string()
    }

    /// True when the name ends in `.drv`.
    pub fn is_derivation(&self) -> bool {
        self.name.as_str().ends_with(".drv")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.name)
    }
}

impl FromStr for StorePath {
    type Err = BadStorePath;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base_path(s)
    }
}

impl Serialize for StorePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StorePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StorePath::from_base_path(&s).map_err(serde::de::Error::custom)
    }
}

/// The absolute directory that anchors a store, `/nix/store` by default.
///
/// Carries the parsing and construction rules for paths under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreDir(String);

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir("/nix/store".to_owned())
    }
}

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Result<Self, BadStorePath> {
        let dir = dir.into();
        if !dir.starts_with('/') || dir.ends_with('/') {
            return Err(BadStorePath::NotInStore(dir));
        }
        Ok(StoreDir(dir))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Render a store path as an absolute path string.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    /// Render a store path as an absolute [`PathBuf`].
    pub fn real_path(&self, path: &StorePath) -> PathBuf {
        self.to_path().join(path.to_string())
    }

    /// Parse an absolute path that must lie directly inside this store
    /// directory.
    pub fn parse_path(&self, s: &str) -> Result<StorePath, BadStorePath> {
        let rest = s
            .strip_prefix(&self.0)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| BadStorePath::NotInStore(s.to_owned()))?;
        if rest.contains('/') {
            return Err(BadStorePath::NotInStore(s.to_owned()));
        }
        StorePath::from_base_path(rest)
    }

    /// Like [`parse_path`](Self::parse_path), but accepts paths pointing
    /// *inside* a store object and returns the object's path.
    pub fn to_store_path(&self, s: &str) -> Result<StorePath, BadStorePath> {
        let rest = s
            .strip_prefix(&self.0)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| BadStorePath::NotInStore(s.to_owned()))?;
        let base = rest.split('/').next().unwrap_or(rest);
        StorePath::from_base_path(base)
    }

    /// The fundamental store-path construction rule.
    ///
    /// Hashes `"<type>:<innerHash>:<storeDir>:<name>"` with SHA-256,
    /// XOR-folds the digest to 20 bytes, and pairs it with the name.
    pub fn make_store_path(&self, path_type: &str, inner: &str, name: &StorePathName) -> StorePath {
        let fingerprint = format!("{}:{}:{}:{}", path_type, inner, self.0, name);
        let hash = StorePathHash::compress(&Algorithm::SHA256.digest(&fingerprint));
        StorePath::new(hash, name.clone())
    }

    fn make_type(&self, base: &str, refs: &StoreReferences) -> String {
        let mut out = base.to_owned();
        for r in &refs.others {
            out.push(':');
            out.push_str(&self.display_path(r));
        }
        if refs.self_ref {
            out.push_str(":self");
        }
        out
    }

    /// Construct the path of a fixed-output or source object.
    ///
    /// The recursive-SHA-256 case is the common `source` form and may carry
    /// references; every other combination embeds the ingestion method and
    /// algorithm in the inner fingerprint and must be reference-free.
    pub fn make_fixed_output_path(
        &self,
        method: FileIngestionMethod,
        hash: &Hash,
        name: &StorePathName,
        refs: &StoreReferences,
    ) -> Result<StorePath, BadStorePath> {
        if hash.algorithm() == Algorithm::SHA256 && method == FileIngestionMethod::Recursive {
            Ok(self.make_store_path(
                &self.make_type("source", refs),
                &hash.format(Encoding::Base16),
                name,
            ))
        } else {
            if !refs.is_empty() {
                return Err(BadStorePath::RefsNotAllowed(name.to_string()));
            }
            let inner = Algorithm::SHA256.digest(format!(
                "fixed:out:{}{}:",
                method.prefix(),
                hash.format(Encoding::Base16)
            ));
            Ok(self.make_store_path("output:out", &inner.format(Encoding::Base16), name))
        }
    }

    /// Construct the path of an input-addressed derivation output.
    ///
    /// `drv_hash` is the hash-modulo of the derivation; the output name is
    /// appended to the store path name except for `out`.
    pub fn make_output_path(
        &self,
        output_name: &str,
        drv_hash: &Hash,
        drv_name: &StorePathName,
    ) -> Result<StorePath, BadStorePath> {
        let name = if output_name == "out" {
            drv_name.clone()
        } else {
            StorePathName::new(format!("{drv_name}-{output_name}"))?
        };
        Ok(self.make_store_path(
            &format!("output:{output_name}"),
            &drv_hash.format(Encoding::Base16),
            &name,
        ))
    }

    /// Construct the path a text object (e.g. a `.drv` file) will occupy.
    pub fn make_text_path(
        &self,
        name: &StorePathName,
        content_hash: &Hash,
        refs: &StoreReferences,
    ) -> Result<StorePath, BadStorePath> {
        // Text objects cannot refer to themselves; the hash would have to
        // contain itself.
        if refs.self_ref {
            return Err(BadStorePath::RefsNotAllowed(name.to_string()));
        }
        Ok(self.make_store_path(
            &self.make_type("text", refs),
            &content_hash.format(Encoding::Base16),
            name,
        ))
    }

    /// Compute the store path for a text object from its contents.
    pub fn compute_store_path_for_text(
        &self,
        name: &StorePathName,
        contents: &[u8],
        refs: &StoreReferences,
    ) -> Result<StorePath, BadStorePath> {
        self.make_text_path(name, &Algorithm::SHA256.digest(contents), refs)
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The reference set used while constructing a content-addressed path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreReferences {
    /// References to other store objects.
    pub others: std::collections::BTreeSet<StorePath>,
    /// Whether the object refers to its own store path.
    pub self_ref: bool,
}

impl StoreReferences {
    pub fn is_empty(&self) -> bool {
        self.others.is_empty() && !self.self_ref
    }
}

#[cfg(test)]
mod unittests {
    use rstest::rstest;

    use super::*;

    fn store_dir() -> StoreDir {
        StoreDir::default()
    }

    #[test]
    fn parse_display_roundtrip() {
        let dir = store_dir();
        let s = "/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3";
        let path = dir.parse_path(s).unwrap();
        assert_eq!(path.name().as_str(), "konsole-18.12.3");
        assert_eq!(path.hash_part(), "7h7qgvs4kgzsn8a6rb273saxyqh4jxlz");
        assert_eq!(dir.display_path(&path), s);
    }

    #[rstest]
    #[case::wrong_dir("/usr/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-x")]
    #[case::no_name("/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz")]
    #[case::short_hash("/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxl-x")]
    #[case::bad_hash_char("/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlu-x")]
    #[case::nested("/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-x/bin/x")]
    #[case::empty_name("/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-")]
    fn parse_rejects(#[case] s: &str) {
        assert!(store_dir().parse_path(s).is_err());
    }

    #[test]
    fn to_store_path_accepts_inner_paths() {
        let dir = store_dir();
        let inner = "/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3/bin/konsole";
        let path = dir.to_store_path(inner).unwrap();
        assert_eq!(path.name().as_str(), "konsole-18.12.3");
    }

    #[rstest]
    #[case::dot_leading(".hidden")]
    #[case::bad_char("has space")]
    #[case::bad_char_2("has~tilde")]
    #[case::empty("")]
    fn name_rejects(#[case] name: &str) {
        assert!(StorePathName::new(name).is_err());
    }

    #[test]
    fn name_length_limit() {
        assert!(StorePathName::new("a".repeat(STORE_PATH_NAME_MAX)).is_ok());
        assert!(StorePathName::new("a".repeat(STORE_PATH_NAME_MAX + 1)).is_err());
    }

    /// Fixed-output path construction is stable: the same inputs always
    /// yield the same path, and the recursive-SHA-256 form matches the
    /// value produced by every other store implementation.
    #[test]
    fn fixed_output_path_stable() {
        let dir = store_dir();
        let hash = cadenza_utils_hash::Algorithm::SHA256.digest("hello\n");
        assert_eq!(
            hash.to_base16(),
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
        let name = StorePathName::new("hello").unwrap();
        let a = dir
            .make_fixed_output_path(
                FileIngestionMethod::Recursive,
                &hash,
                &name,
                &StoreReferences::default(),
            )
            .unwrap();
        let b = dir
            .make_fixed_output_path(
                FileIngestionMethod::Recursive,
                &hash,
                &name,
                &StoreReferences::default(),
            )
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name().as_str(), "hello");
        assert_eq!(a.hash_part().len(), 32);
    }

    /// Flat ingestion with a non-empty reference set is rejected.
    #[test]
    fn fixed_output_path_refs_rejected() {
        let dir = store_dir();
        let hash = cadenza_utils_hash::Algorithm::SHA1.digest("x");
        let name = StorePathName::new("x").unwrap();
        let mut refs = StoreReferences::default();
        refs.self_ref = true;
        assert!(
            dir.make_fixed_output_path(FileIngestionMethod::Flat, &hash, &name, &refs)
                .is_err()
        );
    }

    #[test]
    fn output_path_name_suffix() {
        let dir = store_dir();
        let drv_hash = cadenza_utils_hash::Algorithm::SHA256.digest("drv");
        let name = StorePathName::new("hello-2.10").unwrap();
        let out = dir.make_output_path("out", &drv_hash, &name).unwrap();
        let dev = dir.make_output_path("dev", &drv_hash, &name).unwrap();
        assert_eq!(out.name().as_str(), "hello-2.10");
        assert_eq!(dev.name().as_str(), "hello-2.10-dev");
        assert_ne!(out.hash(), dev.hash());
    }

    #[test]
    fn text_path_depends_on_references() {
        let dir = store_dir();
        let name = StorePathName::new("foo.drv").unwrap();
        let plain = dir
            .compute_store_path_for_text(&name, b"contents", &StoreReferences::default())
            .unwrap();
        let mut refs = StoreReferences::default();
        refs.others.insert(plain.clone());
        let with_ref = dir
            .compute_store_path_for_text(&name, b"contents", &refs)
            .unwrap();
        assert_ne!(plain, with_ref);
    }

    #[test]
    fn text_path_rejects_self_reference() {
        let dir = store_dir();
        let name = StorePathName::new("foo.drv").unwrap();
        let refs = StoreReferences {
            others: Default::default(),
            self_ref: true,
        };
        assert!(dir.compute_store_path_for_text(&name, b"c", &refs).is_err());
    }
}
