// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Profile manifests and generations.
//!
//! A profile is a symlink chain under `<state>/profiles`: `name` points
//! at `name-<N>-link`, which points at a store path whose
//! `manifest.json` lists the installed elements. Three manifest versions
//! are in the wild; versions 1 and 2 are upgraded on read (the element
//! list becomes a name-keyed map in version 3) and everything is written
//! back as version 3.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The manifest version this implementation writes.
pub const CURRENT_VERSION: u32 = 3;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("manifest is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u64),
    #[error("profile has no current generation")]
    NoCurrentGeneration,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One installed element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestElement {
    pub store_paths: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub priority: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
}

fn default_active() -> bool {
    true
}

/// A version-3 manifest: named elements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileManifest {
    pub elements: BTreeMap<String, ManifestElement>,
}

impl ProfileManifest {
    /// Parse any supported manifest version, upgrading to the current
    /// data model.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProfileError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(1);

        match version {
            // Versions 1 and 2 carry an element *array*; names were
            // implicit. Synthesise names from attrPath or position.
            1 | 2 => {
                let raw: Vec<ManifestElement> = serde_json::from_value(
                    value.get("elements").cloned().unwrap_or_default(),
                )?;
                let mut elements = BTreeMap::new();
                for (index, element) in raw.into_iter().enumerate() {
                    let name = element
                        .attr_path
                        .clone()
                        .unwrap_or_else(|| index.to_string());
                    elements.insert(name, element);
                }
                Ok(Self { elements })
            }
            3 => {
                let elements: BTreeMap<String, ManifestElement> = serde_json::from_value(
                    value.get("elements").cloned().unwrap_or_default(),
                )?;
                Ok(Self { elements })
            }
            other => Err(ProfileError::UnsupportedVersion(other)),
        }
    }

    /// Render as version 3.
    pub fn render(&self) -> Vec<u8> {
        let doc = serde_json::json!({
            "version": CURRENT_VERSION,
            "elements": self.elements,
        });
        serde_json::to_vec(&doc).expect("manifest serialisation cannot fail")
    }
}

/// A profile's symlink chain on disk.
pub struct Profile {
    /// The `name` symlink (e.g. `<state>/profiles/default`).
    pub link: PathBuf,
}

impl Profile {
    pub fn new(link: impl Into<PathBuf>) -> Self {
        Self { link: link.into() }
    }

    fn generation_link(&self, number: u64) -> PathBuf {
        let name = self.link.file_name().unwrap_or_default().to_string_lossy();
        self.link.with_file_name(format!("{name}-{number}-link"))
    }

    /// The current generation number, from the `name-<N>-link` target.
    pub fn current_generation(&self) -> Result<Option<u64>, ProfileError> {
        let target = match std::fs::read_link(&self.link) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let text = target.to_string_lossy();
        let number = text
            .rsplit_once("-link")
            .and_then(|(prefix, _)| prefix.rsplit('-').next())
            .and_then(|n| n.parse().ok());
        Ok(number)
    }

    /// All existing generation numbers, ascending.
    pub fn generations(&self) -> Result<Vec<u64>, ProfileError> {
        let Some(dir) = self.link.parent() else {
            return Ok(Vec::new());
        };
        let prefix = format!(
            "{}-",
            self.link.file_name().unwrap_or_default().to_string_lossy()
        );
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(&prefix)
                && let Some(number) = rest.strip_suffix("-link")
                && let Ok(number) = number.parse()
            {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Create the next generation pointing at `store_path_target`, and
    /// switch the profile to it. Returns the new generation number.
    pub fn create_generation(&self, store_path_target: &Path) -> Result<u64, ProfileError> {
        let next = self.generations()?.last().copied().unwrap_or(0) + 1;
        let generation = self.generation_link(next);
        symlink_replace(store_path_target, &generation)?;
        // The profile link is relative, so moving the profiles directory
        // moves the whole chain.
        let generation_name = generation
            .file_name()
            .expect("generation link has a file name")
            .to_owned();
        symlink_replace(Path::new(&generation_name), &self.link)?;
        Ok(next)
    }

    /// Switch to an existing generation.
    pub fn switch_to(&self, number: u64) -> Result<(), ProfileError> {
        let generation = self.generation_link(number);
        if !generation.exists() {
            return Err(ProfileError::NoCurrentGeneration);
        }
        let name = generation
            .file_name()
            .expect("generation link has a file name")
            .to_owned();
        symlink_replace(Path::new(&name), &self.link)?;
        Ok(())
    }
}

fn symlink_replace(target: &Path, link: &Path) -> std::io::Result<()> {
    // Create-then-rename keeps the link present at every instant.
    let staging = link.with_extension("tmp");
    let _ = std::fs::remove_file(&staging);
    std::os::unix::fs::symlink(target, &staging)?;
    std::fs::rename(&staging, link)
}
