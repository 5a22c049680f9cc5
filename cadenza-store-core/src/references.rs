// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Streaming discovery of store-path references in output data.
//!
//! After a build we need to know which store paths the outputs mention.
//! Rather than running one search per candidate, the scanner slides a
//! 32-byte window over the data and validates it right-to-left against the
//! nix-base32 alphabet; an invalid byte at offset `j` lets us skip `j + 1`
//! positions at once. On binary data almost every byte is outside the
//! alphabet, so the scan runs in roughly `n / 32` window checks
//! independent of the candidate count. Valid windows are then looked up in
//! a hash set.
//!
//! The scanner is push-based: feed it the same chunks that go into the NAR
//! hash, and one pass over the bytes serves both consumers.

use std::collections::{BTreeSet, HashSet};

use cadenza_utils_base_encoding as base32;

use crate::store_path::{StorePath, StorePathHash};

/// Encoded length of a store path hash part.
const HASH_LEN: usize = StorePathHash::encoded_len();

/// Scans byte chunks for the hash parts of candidate store paths.
pub struct RefScanSink {
    /// Hash strings not yet seen; matches move to `seen`.
    pending: HashSet<[u8; HASH_LEN]>,
    seen: HashSet<[u8; HASH_LEN]>,
    /// Maps hash strings back to candidate paths for the result.
    back_map: Vec<([u8; HASH_LEN], StorePath)>,
    /// Up to `HASH_LEN` bytes carried over from the previous chunk so
    /// matches spanning a chunk boundary are found.
    tail: Vec<u8>,
}

impl RefScanSink {
    /// Scan for `candidates` and, when given, `self_path` (to detect
    /// self-references).
    pub fn new(candidates: &BTreeSet<StorePath>, self_path: Option<&StorePath>) -> Self {
        let mut pending = HashSet::with_capacity(candidates.len() + 1);
        let mut back_map = Vec::with_capacity(candidates.len() + 1);

        for path in candidates.iter().chain(self_path) {
            let hash = hash_window(path);
            if pending.insert(hash) {
                back_map.push((hash, path.clone()));
            }
        }

        Self {
            pending,
            seen: HashSet::new(),
            back_map,
            tail: Vec::with_capacity(HASH_LEN),
        }
    }

    /// Feed the next chunk of data.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let tail_len = data.len().min(HASH_LEN);

        // A match may straddle the boundary: search the old tail glued to
        // the head of the new chunk.
        if !self.tail.is_empty() {
            let mut overlap = self.tail.clone();
            overlap.extend_from_slice(&data[..tail_len]);
            search(&overlap, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        let keep = HASH_LEN - tail_len;
        if keep < self.tail.len() {
            self.tail.drain(..self.tail.len() - keep);
        }
        self.tail.extend_from_slice(&data[data.len() - tail_len..]);
    }

    /// Candidate paths whose hash parts appeared in the data.
    pub fn found_paths(&self) -> BTreeSet<StorePath> {
        self.back_map
            .iter()
            .filter(|(hash, _)| self.seen.contains(hash))
            .map(|(_, path)| path.clone())
            .collect()
    }
}

fn hash_window(path: &StorePath) -> [u8; HASH_LEN] {
    let text = path.hash_part();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(text.as_bytes());
    out
}

fn search(data: &[u8], pending: &mut HashSet<[u8; HASH_LEN]>, seen: &mut HashSet<[u8; HASH_LEN]>) {
    if data.len() < HASH_LEN {
        return;
    }

    let mut i = 0;
    'outer: while i + HASH_LEN <= data.len() {
        // Validate right-to-left so one bad byte skips the whole window.
        for j in (0..HASH_LEN).rev() {
            if !base32::is_valid_char(data[i + j]) {
                i += j + 1;
                continue 'outer;
            }
        }

        let window: [u8; HASH_LEN] = data[i..i + HASH_LEN]
            .try_into()
            .expect("window length equals HASH_LEN");
        if pending.remove(&window) {
            seen.insert(window);
        }
        i += 1;
    }
}
