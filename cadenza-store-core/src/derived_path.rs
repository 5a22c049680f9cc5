// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! What a front-end asks the scheduler to realise.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::derivation::{OutputName, ParseDerivationError};
use crate::store_path::{BadStorePath, StoreDir, StorePath};

/// Which outputs of a derivation are wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputSpec {
    /// All outputs the derivation declares.
    All,
    /// A non-empty named subset.
    Names(BTreeSet<OutputName>),
}

impl OutputSpec {
    pub fn just(name: OutputName) -> Self {
        OutputSpec::Names(BTreeSet::from([name]))
    }

    pub fn contains(&self, name: &OutputName) -> bool {
        match self {
            OutputSpec::All => true,
            OutputSpec::Names(names) => names.contains(name),
        }
    }

    /// Widen this spec to also cover `other`. Used when two goals for the
    /// same derivation are merged.
    pub fn union_with(&mut self, other: &OutputSpec) {
        match (&mut *self, other) {
            (OutputSpec::All, _) => {}
            (_, OutputSpec::All) => *self = OutputSpec::All,
            (OutputSpec::Names(a), OutputSpec::Names(b)) => {
                a.extend(b.iter().cloned());
            }
        }
    }
}

impl fmt::Display for OutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSpec::All => f.write_str("*"),
            OutputSpec::Names(names) => {
                let mut first = true;
                for name in names {
                    if !first {
                        f.write_str(",")?;
                    }
                    first = false;
                    write!(f, "{name}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for OutputSpec {
    type Err = ParseDerivationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(OutputSpec::All);
        }
        let names = s
            .split(',')
            .map(OutputName::new)
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(OutputSpec::Names(names))
    }
}

/// A buildable request: either an opaque path to substitute, or outputs of
/// a derivation to realise. The textual form is
/// `/nix/store/…-foo` or `/nix/store/…-foo.drv!out1,out2` / `…!*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivedPath {
    Opaque(StorePath),
    Built {
        drv_path: StorePath,
        outputs: OutputSpec,
    },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ParseDerivedPathError {
    #[error(transparent)]
    BadStorePath(#[from] BadStorePath),
    #[error(transparent)]
    BadOutputs(#[from] ParseDerivationError),
}

impl DerivedPath {
    pub fn parse(store_dir: &StoreDir, s: &str) -> Result<Self, ParseDerivedPathError> {
        match s.split_once('!') {
            None => Ok(DerivedPath::Opaque(store_dir.parse_path(s)?)),
            Some((path, outputs)) => Ok(DerivedPath::Built {
                drv_path: store_dir.parse_path(path)?,
                outputs: outputs.parse()?,
            }),
        }
    }

    pub fn display(&self, store_dir: &StoreDir) -> String {
        match self {
            DerivedPath::Opaque(path) => store_dir.display_path(path),
            DerivedPath::Built { drv_path, outputs } => {
                format!("{}!{}", store_dir.display_path(drv_path), outputs)
            }
        }
    }
}
