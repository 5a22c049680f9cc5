// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Goal results and shared progress accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// How one goal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Failed,
    /// A substitution goal ran out of substituters.
    NoSubstituters,
    /// A dependency could not be realised, so this goal never ran.
    IncompleteClosure,
}

/// The one-shot result every waiter of a goal observes.
#[derive(Debug, Clone)]
pub struct GoalResult {
    pub code: ExitCode,
    /// Human-readable failure description.
    pub error: Option<Arc<String>>,
    pub timed_out: bool,
    pub hash_mismatch: bool,
    pub check_mismatch: bool,
    /// Failure that retrying will not fix (builder exited non-zero).
    pub permanent_failure: bool,
}

impl GoalResult {
    pub fn success() -> Self {
        Self {
            code: ExitCode::Success,
            error: None,
            timed_out: false,
            hash_mismatch: false,
            check_mismatch: false,
            permanent_failure: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: ExitCode::Failed,
            error: Some(Arc::new(message.into())),
            timed_out: false,
            hash_mismatch: false,
            check_mismatch: false,
            permanent_failure: false,
        }
    }

    pub fn with_code(mut self, code: ExitCode) -> Self {
        self.code = code;
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == ExitCode::Success
    }
}

/// Aggregated expected/done counters the front-end logger samples.
///
/// Expected values only ever grow; done values trail them. All counters
/// are monotone so a sampler never sees progress move backwards.
#[derive(Debug, Default)]
pub struct Progress {
    pub builds_expected: AtomicU64,
    pub builds_done: AtomicU64,
    pub substitutions_expected: AtomicU64,
    pub substitutions_done: AtomicU64,
    pub download_bytes_expected: AtomicU64,
    pub download_bytes_done: AtomicU64,
    pub nar_bytes_expected: AtomicU64,
    pub nar_bytes_done: AtomicU64,
}

/// A point-in-time copy of [`Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub builds_expected: u64,
    pub builds_done: u64,
    pub substitutions_expected: u64,
    pub substitutions_done: u64,
    pub download_bytes_expected: u64,
    pub download_bytes_done: u64,
    pub nar_bytes_expected: u64,
    pub nar_bytes_done: u64,
}

impl Progress {
    pub fn add(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            builds_expected: self.builds_expected.load(Ordering::Relaxed),
            builds_done: self.builds_done.load(Ordering::Relaxed),
            substitutions_expected: self.substitutions_expected.load(Ordering::Relaxed),
            substitutions_done: self.substitutions_done.load(Ordering::Relaxed),
            download_bytes_expected: self.download_bytes_expected.load(Ordering::Relaxed),
            download_bytes_done: self.download_bytes_done.load(Ordering::Relaxed),
            nar_bytes_expected: self.nar_bytes_expected.load(Ordering::Relaxed),
            nar_bytes_done: self.nar_bytes_done.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let progress = Progress::default();
        progress.add(&progress.builds_expected, 3);
        progress.add(&progress.builds_done, 1);
        progress.add(&progress.download_bytes_expected, 1024);

        let snap = progress.snapshot();
        assert_eq!(snap.builds_expected, 3);
        assert_eq!(snap.builds_done, 1);
        assert_eq!(snap.download_bytes_expected, 1024);
        assert_eq!(snap.nar_bytes_done, 0);
    }
}
