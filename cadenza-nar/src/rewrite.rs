// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Streaming byte substitution.
//!
//! Rewrites occurrences of the keys of a substitution map to their values
//! in a chunked byte stream, without materialising the stream. The buffer
//! always holds at least twice the longest key before scanning: with less
//! lookahead a key that is a proper infix of another key could win a match
//! that the longer key (starting earlier in the stream) should have taken.
//! While more input may still arrive, the final `max_len` bytes stay
//! buffered so a match spanning the chunk boundary is seen whole.
//!
//! At each position the first matching key in map order wins; scanning
//! resumes after the replacement, so replaced output is never rescanned.

use std::collections::BTreeMap;

/// A streaming rewriter over a fixed substitution map.
pub struct StreamRewriter {
    rewrites: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Longest key length; controls buffering and the boundary reserve.
    max_len: usize,
    buffer: Vec<u8>,
    /// Buffer offset to resume scanning at; positions before it were
    /// already scanned (or written by a replacement) and are final.
    resume: usize,
    /// Total occurrences replaced so far.
    replaced: u64,
}

impl StreamRewriter {
    /// Build a rewriter. Empty keys are ignored.
    pub fn new(rewrites: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        let rewrites: BTreeMap<_, _> =
            rewrites.into_iter().filter(|(k, _)| !k.is_empty()).collect();
        let max_len = rewrites.keys().map(Vec::len).max().unwrap_or(0);
        Self {
            rewrites,
            max_len,
            buffer: Vec::new(),
            resume: 0,
            replaced: 0,
        }
    }

    /// Convenience constructor for a single substitution.
    pub fn single(from: impl Into<Vec<u8>>, to: impl Into<Vec<u8>>) -> Self {
        Self::new(BTreeMap::from([(from.into(), to.into())]))
    }

    /// Feed a chunk; returns the bytes that are safely rewritten and can
    /// be emitted now.
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        if self.rewrites.is_empty() {
            return data.to_vec();
        }
        self.buffer.extend_from_slice(data);
        if self.buffer.len() < 2 * self.max_len {
            return Vec::new();
        }
        self.scan_and_drain(self.max_len.saturating_sub(1))
    }

    /// Flush the remaining buffered bytes, rewriting to the very end.
    pub fn finish(mut self) -> Vec<u8> {
        self.scan_and_drain(0)
    }

    /// Number of replacements performed so far.
    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    /// Scan the buffer, leaving `reserve` bytes unemitted at the tail.
    fn scan_and_drain(&mut self, reserve: usize) -> Vec<u8> {
        let mut i = self.resume;
        loop {
            // While more input may arrive (reserve > 0) only positions
            // where the longest key still fits are final; at the end every
            // position is.
            let limit = if reserve == 0 {
                self.buffer.len()
            } else {
                (self.buffer.len() + 1).saturating_sub(self.max_len)
            };
            if i >= limit {
                break;
            }
            let mut advance = 1;
            for (from, to) in &self.rewrites {
                if self.buffer[i..].starts_with(from) {
                    self.buffer.splice(i..i + from.len(), to.iter().copied());
                    advance = to.len();
                    self.replaced += 1;
                    break;
                }
            }
            i += advance;
        }

        let keep = reserve.min(self.buffer.len());
        let emit_len = self.buffer.len() - keep;
        // A replacement at the last scanned position may have written
        // into the kept tail; never rescan bytes a replacement produced.
        self.resume = i.saturating_sub(emit_len);
        let rest = self.buffer.split_off(emit_len);
        std::mem::replace(&mut self.buffer, rest)
    }
}

/// Rewrite a complete in-memory buffer.
pub fn rewrite_bytes(rewrites: BTreeMap<Vec<u8>, Vec<u8>>, data: &[u8]) -> Vec<u8> {
    let mut rewriter = StreamRewriter::new(rewrites);
    let mut out = rewriter.feed(data);
    out.extend(rewriter.finish());
    out
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Chunked rewriting agrees with whole-buffer rewriting for any
        /// data, key, replacement and chunking.
        #[test]
        fn proptest_chunking_is_transparent(
            data in proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c')], 0..200),
            from in proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b')], 1..6),
            to in proptest::collection::vec(any::<u8>(), 1..6),
            chunk_size in 1usize..32,
        ) {
            let rewrites = BTreeMap::from([(from, to)]);
            let whole = rewrite_bytes(rewrites.clone(), &data);

            let mut rewriter = StreamRewriter::new(rewrites);
            let mut chunked = Vec::new();
            for chunk in data.chunks(chunk_size) {
                chunked.extend(rewriter.feed(chunk));
            }
            chunked.extend(rewriter.finish());
            prop_assert_eq!(chunked, whole);
        }
    }
}
