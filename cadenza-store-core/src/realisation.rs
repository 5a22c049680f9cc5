// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Realisations bind floating content-addressed outputs to concrete paths.
//!
//! An input-addressed output's path is fixed before the build; a floating
//! output's path only exists once something has built (or substituted) it.
//! The binding is a [`Realisation`], keyed by [`DrvOutput`] and signable so
//! that bindings can be trusted across store boundaries. The JSON form is
//! what binary caches serve as `realisations/<id>.doi`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadenza_utils_hash::{Hash, ParseHashError};

use crate::derivation::{OutputName, ParseDerivationError};
use crate::signature::NarSignature;
use crate::signing::{PublicKey, SecretKey};
use crate::store_path::{BadStorePath, StorePath};

/// Identifier of one output of one derivation: `<drv-hash>!<output>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutput {
    /// Hash of the derivation (modulo its own output paths).
    pub drv_hash: Hash,
    pub output_name: OutputName,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseDrvOutputError {
    #[error("derivation output id '{0}' lacks a '!' separator")]
    MissingSeparator(String),
    #[error(transparent)]
    BadHash(#[from] ParseHashError),
    #[error(transparent)]
    BadOutputName(#[from] ParseDerivationError),
}

impl DrvOutput {
    pub fn parse(s: &str) -> Result<Self, ParseDrvOutputError> {
        let (hash, output) = s
            .split_once('!')
            .ok_or_else(|| ParseDrvOutputError::MissingSeparator(s.to_owned()))?;
        Ok(Self {
            drv_hash: Hash::parse_any(hash)?,
            output_name: OutputName::new(output)?,
        })
    }
}

impl fmt::Display for DrvOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv_hash, self.output_name)
    }
}

impl FromStr for DrvOutput {
    type Err = ParseDrvOutputError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DrvOutput {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DrvOutput {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DrvOutput::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// The resolved binding of a [`DrvOutput`] to a store path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realisation {
    pub id: DrvOutput,
    pub out_path: StorePath,
    #[serde(default)]
    pub signatures: BTreeSet<NarSignature>,
    /// Bindings this realisation's closure depends on, so a consumer can
    /// resolve the full graph without rebuilding.
    #[serde(default)]
    pub dependent_realisations: BTreeMap<DrvOutput, StorePath>,
}

#[derive(Error, Debug)]
pub enum RealisationError {
    #[error("realisation is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error(transparent)]
    BadStorePath(#[from] BadStorePath),
}

impl Realisation {
    pub fn new(id: DrvOutput, out_path: StorePath) -> Self {
        Self {
            id,
            out_path,
            signatures: BTreeSet::new(),
            dependent_realisations: BTreeMap::new(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, RealisationError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("realisation serialisation cannot fail")
    }

    /// The string signatures cover: the canonical JSON with the signature
    /// set emptied, so signing is stable regardless of who signed before.
    pub fn fingerprint(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.signatures = BTreeSet::new();
        String::from_utf8(unsigned.to_json()).expect("canonical JSON is UTF-8")
    }

    pub fn sign(&mut self, key: &SecretKey) {
        let fingerprint = self.fingerprint();
        self.signatures.insert(key.sign(fingerprint));
    }

    pub fn count_valid_signatures(&self, keys: &[PublicKey]) -> usize {
        let fingerprint = self.fingerprint();
        self.signatures
            .iter()
            .filter(|sig| keys.iter().any(|key| key.verify(&fingerprint, sig)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_utils_hash::Algorithm;

    fn sample() -> Realisation {
        let id = DrvOutput {
            drv_hash: Algorithm::SHA256.digest("some-drv"),
            output_name: OutputName::out(),
        };
        let out_path = StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg").unwrap();
        Realisation::new(id, out_path)
    }

    #[test]
    fn id_text_roundtrip() {
        let id = sample().id;
        let text = id.to_string();
        assert!(text.contains('!'));
        assert_eq!(DrvOutput::parse(&text).unwrap(), id);
    }

    #[test]
    fn json_roundtrip() {
        let mut r = sample();
        r.dependent_realisations.insert(
            DrvOutput {
                drv_hash: Algorithm::SHA256.digest("dep"),
                output_name: OutputName::new("dev").unwrap(),
            },
            StorePath::from_base_path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep").unwrap(),
        );
        let parsed = Realisation::from_json(&r.to_json()).unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn signing_is_stable_under_existing_signatures() {
        let mut r = sample();
        let key_a = SecretKey::generate("a-1");
        let key_b = SecretKey::generate("b-1");

        r.sign(&key_a);
        let fp_after_one = r.fingerprint();
        r.sign(&key_b);
        assert_eq!(r.fingerprint(), fp_after_one);

        let keys = [key_a.to_public(), key_b.to_public()];
        assert_eq!(r.count_valid_signatures(&keys), 2);
    }

    #[test]
    fn tampered_out_path_fails_verification() {
        let mut r = sample();
        let key = SecretKey::generate("k-1");
        r.sign(&key);
        r.out_path = StorePath::from_base_path("cccccccccccccccccccccccccccccccc-evil").unwrap();
        assert_eq!(r.count_valid_signatures(&[key.to_public()]), 0);
    }
}
