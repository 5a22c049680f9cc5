// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! NAR hashing, plain and modulo self-references.
//!
//! Content-addressing an object that mentions its own store path is
//! circular: the path depends on the hash, the hash on the bytes, the
//! bytes on the path. The fix is to hash the stream with every occurrence
//! of the self-reference placeholder replaced by zeros ("hash modulo"),
//! derive the final path from that, and then rewrite placeholder to path.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt as _};

use cadenza_utils_hash::{Algorithm, Context, Hash, NarHash};

use crate::rewrite::StreamRewriter;
use crate::{dump, BadArchive};

/// Hash `reader` with all occurrences of `modulus` treated as zero bytes.
/// Returns the hash and the number of bytes consumed (the stream length —
/// replacement is length-preserving).
pub async fn compute_hash_modulo<R: AsyncRead + Unpin>(
    algorithm: Algorithm,
    modulus: &[u8],
    mut reader: R,
) -> Result<(Hash, u64), BadArchive> {
    let zeroes = vec![0u8; modulus.len()];
    let mut rewriter = StreamRewriter::single(modulus.to_vec(), zeroes);
    let mut ctx = Context::new(algorithm);
    let mut length = 0u64;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let got = reader.read(&mut buf).await?;
        if got == 0 {
            break;
        }
        length += got as u64;
        ctx.update(rewriter.feed(&buf[..got]));
    }
    ctx.update(rewriter.finish());

    Ok((ctx.finish(), length))
}

/// SHA-256 NAR hash and size of a filesystem path.
pub async fn nar_hash_and_size(path: impl AsRef<Path>) -> Result<(NarHash, u64), BadArchive> {
    let mut sink = cadenza_utils_hash::HashSink::new(Algorithm::SHA256);
    dump::dump_to_writer(path, &mut sink).await?;
    let (size, hash) = sink.finish();
    let nar_hash = NarHash::try_from(hash).expect("sink algorithm is SHA-256");
    Ok((nar_hash, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn modulo_zeroes_placeholder() {
        let placeholder = b"PLACEHOLDERPLACEHOLDERPLACEHOLDE"; // 32 bytes
        let with = [&b"prefix "[..], placeholder, b" suffix"].concat();
        let zeroed = [&b"prefix "[..], &[0u8; 32], b" suffix"].concat();

        let (hash, len) =
            compute_hash_modulo(Algorithm::SHA256, placeholder, with.as_slice())
                .await
                .unwrap();
        assert_eq!(len, with.len() as u64);
        assert_eq!(hash, Algorithm::SHA256.digest(&zeroed));
    }

    #[tokio::test]
    async fn streams_without_placeholder_hash_plainly() {
        let data = b"no placeholder here";
        let (hash, len) = compute_hash_modulo(Algorithm::SHA256, b"XXXX", data.as_slice())
            .await
            .unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(hash, Algorithm::SHA256.digest(data));
    }

    /// A stream with the placeholder and the same stream with it already
    /// zeroed hash identically; that is the point of hash-modulo.
    #[tokio::test]
    async fn placeholder_and_zeroed_agree() {
        let placeholder = b"0123456789abcdef";
        let a = [&b"x"[..], placeholder, b"y", placeholder].concat();
        let b = [&b"x"[..], &[0u8; 16], b"y", &[0u8; 16]].concat();

        let (hash_a, _) = compute_hash_modulo(Algorithm::SHA256, placeholder, a.as_slice())
            .await
            .unwrap();
        let (hash_b, _) = compute_hash_modulo(Algorithm::SHA256, placeholder, b.as_slice())
            .await
            .unwrap();
        assert_eq!(hash_a, hash_b);
    }
}
