// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Row types. Paths are stored as absolute path strings; interpretation
//! into typed store paths happens a layer up, where the store directory is
//! known.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

/// One row of `ValidPaths`, plus its resolved references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfoRow {
    pub id: i64,
    pub path: String,
    /// NAR hash in `sha256:<base16>` form.
    pub hash: String,
    pub registration_time: SystemTime,
    pub deriver: Option<String>,
    pub nar_size: Option<u64>,
    pub ultimate: bool,
    /// Space-separated signatures.
    pub sigs: Option<String>,
    pub ca: Option<String>,
    pub references: BTreeSet<String>,
}

/// One row of `DerivationOutputs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationOutputRow {
    pub drv_id: i64,
    pub output_name: String,
    pub path: String,
}

/// One row of `Realisations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealisationRow {
    pub id: i64,
    pub drv_hash: String,
    pub output_name: String,
    pub output_path_id: i64,
    pub signatures: Option<String>,
}

pub(crate) fn unix_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

pub(crate) fn system_time_to_unix(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_conversion_roundtrip() {
        let now = unix_to_system_time(1_700_000_000);
        assert_eq!(system_time_to_unix(now), 1_700_000_000);
        assert_eq!(system_time_to_unix(SystemTime::UNIX_EPOCH), 0);
    }
}
