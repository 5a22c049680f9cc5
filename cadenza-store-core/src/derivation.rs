// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Build recipes as the scheduler consumes them.
//!
//! A [`BasicDerivation`] is the already-parsed form of a `.drv` store
//! object: inputs are split into opaque store paths and outputs of other
//! derivations, and each output declares how its path comes to be (see
//! [`DerivationOutput`]). The evaluator that produces these lives outside
//! this workspace; we only store, load and execute them.
//!
//! On disk a derivation is serialised as canonical JSON and registered as a
//! text object whose name ends in `.drv`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadenza_utils_hash::{Algorithm, Hash};

use crate::content_address::{ContentAddress, FileIngestionMethod};
use crate::store_path::{BadStorePath, StoreDir, StorePath, StorePathName, StoreReferences};

/// A validated derivation output name (`out`, `dev`, `doc`, …).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputName(String);

impl OutputName {
    pub fn new(name: impl Into<String>) -> Result<Self, ParseDerivationError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'+' | b'-' | b'.' | b'_'));
        if !valid {
            return Err(ParseDerivationError::BadOutputName(name));
        }
        Ok(Self(name))
    }

    /// The default output name.
    pub fn out() -> Self {
        Self("out".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_out(&self) -> bool {
        self.0 == "out"
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OutputName {
    type Err = ParseDerivationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for OutputName {
    type Error = ParseDerivationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<OutputName> for String {
    fn from(name: OutputName) -> String {
        name.0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseDerivationError {
    #[error("invalid output name '{0}'")]
    BadOutputName(String),
    #[error(transparent)]
    BadStorePath(#[from] BadStorePath),
    #[error("derivation is not valid JSON: {0}")]
    BadJson(String),
}

/// How one output of a derivation obtains its store path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DerivationOutput {
    /// The path was computed ahead of time from a hash of the derivation.
    InputAddressed { path: StorePath },
    /// The author declared the output hash; the builder must reproduce it.
    CaFixed { ca: ContentAddress },
    /// The path is computed from the actual contents after the build.
    CaFloating {
        method: FileIngestionMethod,
        hash_algo: Algorithm,
    },
}

impl DerivationOutput {
    /// The store path this output will occupy, when it is knowable before
    /// the build. Floating outputs return `None`.
    pub fn path(
        &self,
        store_dir: &StoreDir,
        drv_name: &StorePathName,
        output_name: &OutputName,
    ) -> Result<Option<StorePath>, BadStorePath> {
        match self {
            DerivationOutput::InputAddressed { path } => Ok(Some(path.clone())),
            DerivationOutput::CaFixed { ca } => {
                let name = output_path_name(drv_name, output_name)?;
                let path = store_dir.make_fixed_output_path(
                    ca.ingestion_method(),
                    ca.hash(),
                    &name,
                    &StoreReferences::default(),
                )?;
                Ok(Some(path))
            }
            DerivationOutput::CaFloating { .. } => Ok(None),
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, DerivationOutput::CaFixed { .. })
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, DerivationOutput::CaFloating { .. })
    }
}

/// `<drv-name>` for `out`, `<drv-name>-<output>` otherwise.
pub fn output_path_name(
    drv_name: &StorePathName,
    output_name: &OutputName,
) -> Result<StorePathName, BadStorePath> {
    if output_name.is_out() {
        Ok(drv_name.clone())
    } else {
        StorePathName::new(format!("{drv_name}-{output_name}"))
    }
}

/// A derivation with all evaluation-time indirection resolved: exactly what
/// the build scheduler needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicDerivation {
    /// Store path name of the derivation, without the `.drv` suffix.
    pub name: StorePathName,
    /// Platform the builder runs on, e.g. `x86_64-linux`.
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Opaque store-path inputs (sources, already-built dependencies).
    pub input_srcs: BTreeSet<StorePath>,
    /// Outputs of other derivations this build needs, by `.drv` path.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
}

impl BasicDerivation {
    /// Parse the canonical JSON form stored in `.drv` objects.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ParseDerivationError> {
        serde_json::from_slice(bytes).map_err(|e| ParseDerivationError::BadJson(e.to_string()))
    }

    /// Render the canonical JSON form. `BTreeMap` keys make the output
    /// deterministic, which the text store path depends on.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("derivation serialisation cannot fail")
    }

    /// The store path name of the `.drv` object itself.
    pub fn drv_name(&self) -> Result<StorePathName, BadStorePath> {
        StorePathName::new(format!("{}.drv", self.name))
    }

    /// Resolve every output whose path is knowable before the build.
    pub fn output_paths(
        &self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<OutputName, Option<StorePath>>, BadStorePath> {
        self.outputs
            .iter()
            .map(|(name, output)| Ok((name.clone(), output.path(store_dir, &self.name, name)?)))
            .collect()
    }

    /// A fixed-output derivation has exactly one output, `out`, declared
    /// `CaFixed`. These are the only builds allowed network access.
    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1
            && self
                .outputs
                .get(&OutputName::out())
                .is_some_and(DerivationOutput::is_fixed)
    }

    /// Structured attributes, when the derivation carries a `__json` env
    /// entry.
    pub fn structured_attrs(
        &self,
    ) -> Option<serde_json::Map<String, serde_json::Value>> {
        let raw = self.env.get("__json")?;
        match serde_json::from_str(raw) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// The hash that [`StoreDir::make_output_path`] consumes for
    /// input-addressed outputs: a SHA-256 of the canonical JSON with all
    /// output paths blanked, so the hash does not depend on itself.
    pub fn derivation_hash(&self) -> Hash {
        let mut masked = self.clone();
        for output in masked.outputs.values_mut() {
            if let DerivationOutput::InputAddressed { path } = output {
                *path = StorePath::new(
                    crate::store_path::StorePathHash::new([0u8; 20]),
                    masked.name.clone(),
                );
            }
        }
        for name in self.outputs.keys() {
            masked.env.insert(name.to_string(), String::new());
        }
        Algorithm::SHA256.digest(masked.to_json())
    }
}

/// Build-policy switches a derivation declares through its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivationOptions {
    /// Paths the outputs may reference; `None` means unrestricted.
    pub allowed_references: Option<BTreeSet<String>>,
    pub disallowed_references: BTreeSet<String>,
    /// Like `allowed_references`, but over the full requisite closure.
    pub allowed_requisites: Option<BTreeSet<String>>,
    pub disallowed_requisites: BTreeSet<String>,
    /// Environment variables passed through from the daemon's environment
    /// for fixed-output builds.
    pub impure_env_vars: Vec<String>,
    /// Env entries materialised as files instead of variables.
    pub pass_as_file: BTreeSet<String>,
    pub prefer_local_build: bool,
    pub required_system_features: Vec<String>,
}

impl DerivationOptions {
    pub fn from_derivation(drv: &BasicDerivation) -> Self {
        fn words(s: &str) -> impl Iterator<Item = String> + '_ {
            s.split_whitespace().map(str::to_owned)
        }
        let get = |key: &str| drv.env.get(key).map(String::as_str);
        Self {
            allowed_references: get("allowedReferences").map(|s| words(s).collect()),
            disallowed_references: get("disallowedReferences")
                .map(|s| words(s).collect())
                .unwrap_or_default(),
            allowed_requisites: get("allowedRequisites").map(|s| words(s).collect()),
            disallowed_requisites: get("disallowedRequisites")
                .map(|s| words(s).collect())
                .unwrap_or_default(),
            impure_env_vars: get("impureEnvVars").map(|s| words(s).collect()).unwrap_or_default(),
            pass_as_file: get("passAsFile").map(|s| words(s).collect()).unwrap_or_default(),
            prefer_local_build: get("preferLocalBuild") == Some("1"),
            required_system_features: get("requiredSystemFeatures")
                .map(|s| words(s).collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_drv() -> BasicDerivation {
        let out_path =
            StorePath::from_base_path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-hello-2.10").unwrap();
        BasicDerivation {
            name: StorePathName::new("hello-2.10").unwrap(),
            platform: "x86_64-linux".to_owned(),
            builder: "/bin/sh".to_owned(),
            args: vec!["-c".to_owned(), "echo hi > $out".to_owned()],
            env: BTreeMap::from([("out".to_owned(), "/nix/store/...".to_owned())]),
            input_srcs: BTreeSet::new(),
            input_drvs: BTreeMap::new(),
            outputs: BTreeMap::from([(
                OutputName::out(),
                DerivationOutput::InputAddressed { path: out_path },
            )]),
        }
    }

    #[test]
    fn json_roundtrip() {
        let drv = sample_drv();
        let json = drv.to_json();
        let parsed = BasicDerivation::from_json(&json).unwrap();
        assert_eq!(parsed, drv);
    }

    #[test]
    fn json_is_deterministic() {
        let drv = sample_drv();
        assert_eq!(drv.to_json(), drv.to_json());
    }

    #[test]
    fn fixed_output_detection() {
        let mut drv = sample_drv();
        assert!(!drv.is_fixed_output());

        drv.outputs = BTreeMap::from([(
            OutputName::out(),
            DerivationOutput::CaFixed {
                ca: ContentAddress::parse(
                    "fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s",
                )
                .unwrap(),
            },
        )]);
        assert!(drv.is_fixed_output());
    }

    #[test]
    fn fixed_output_path_is_deterministic() {
        let dir = StoreDir::default();
        let ca = ContentAddress::parse(
            "fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s",
        )
        .unwrap();
        let output = DerivationOutput::CaFixed { ca };
        let name = StorePathName::new("hello").unwrap();
        let a = output.path(&dir, &name, &OutputName::out()).unwrap().unwrap();
        let b = output.path(&dir, &name, &OutputName::out()).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name().as_str(), "hello");
    }

    #[test]
    fn floating_output_has_no_path() {
        let dir = StoreDir::default();
        let output = DerivationOutput::CaFloating {
            method: FileIngestionMethod::Recursive,
            hash_algo: Algorithm::SHA256,
        };
        let name = StorePathName::new("pkg").unwrap();
        assert_eq!(output.path(&dir, &name, &OutputName::out()).unwrap(), None);
    }

    #[test]
    fn derivation_hash_ignores_own_output_paths() {
        let drv_a = sample_drv();
        let mut drv_b = sample_drv();
        // Same derivation with a different (e.g. rewritten) output path
        // hashes identically; anything else must not.
        if let Some(DerivationOutput::InputAddressed { path }) =
            drv_b.outputs.get_mut(&OutputName::out())
        {
            *path = StorePath::from_base_path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-hello-2.10").unwrap();
        }
        assert_eq!(drv_a.derivation_hash(), drv_b.derivation_hash());

        drv_b.builder = "/bin/bash".to_owned();
        assert_ne!(drv_a.derivation_hash(), drv_b.derivation_hash());
    }

    #[test]
    fn options_from_env() {
        let mut drv = sample_drv();
        drv.env.insert(
            "allowedReferences".to_owned(),
            "out /nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep".to_owned(),
        );
        drv.env
            .insert("impureEnvVars".to_owned(), "http_proxy https_proxy".to_owned());
        drv.env.insert("passAsFile".to_owned(), "bigAttr".to_owned());

        let opts = DerivationOptions::from_derivation(&drv);
        assert_eq!(opts.allowed_references.as_ref().map(|s| s.len()), Some(2));
        assert_eq!(opts.impure_env_vars, vec!["http_proxy", "https_proxy"]);
        assert!(opts.pass_as_file.contains("bigAttr"));
        assert!(opts.disallowed_references.is_empty());
    }

    #[test]
    fn output_name_validation() {
        assert!(OutputName::new("out").is_ok());
        assert!(OutputName::new("dev").is_ok());
        assert!(OutputName::new("").is_err());
        assert!(OutputName::new("has space").is_err());
    }
}
