// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Hash values and streaming digest computation.
//!
//! A [`Hash`] pairs an [`Algorithm`] with its digest bytes and compares
//! bytewise, never by textual form. The four textual encodings (base16,
//! nix-base32, base64 and SRI) live in [`fmt`]; every encoding parses back
//! to the identical value.

use std::fmt as sfmt;

use ring::digest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

mod algo;
pub mod fmt;
mod hashing_reader;

pub use algo::{Algorithm, UnknownAlgorithm};
pub use fmt::{Encoding, ParseHashError};
pub use hashing_reader::{HashState, HashingReader};

const LARGEST_ALGORITHM: Algorithm = Algorithm::LARGEST;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("hash has wrong length {length} != {} for hash type '{algorithm}'", algorithm.size())]
pub struct InvalidHashError {
    algorithm: Algorithm,
    length: usize,
}

/// A digest value tagged with its algorithm.
///
/// Stored inline in a buffer sized for the largest algorithm; only the
/// first `algorithm.size()` bytes are significant and participate in
/// comparisons.
#[derive(Clone, Copy)]
pub struct Hash {
    algorithm: Algorithm,
    data: [u8; LARGEST_ALGORITHM.size()],
}

impl Hash {
    /// Construct from exactly `algorithm.size()` digest bytes.
    ///
    /// Panics when the slice has the wrong length; use [`Hash::from_slice`]
    /// for untrusted input.
    pub const fn new(algorithm: Algorithm, digest: &[u8]) -> Hash {
        let mut data = [0u8; LARGEST_ALGORITHM.size()];
        let (prefix, _rest) = data.split_at_mut(algorithm.size());
        prefix.copy_from_slice(digest);
        Hash { algorithm, data }
    }

    pub fn from_slice(algorithm: Algorithm, digest: &[u8]) -> Result<Hash, InvalidHashError> {
        if digest.len() != algorithm.size() {
            return Err(InvalidHashError {
                algorithm,
                length: digest.len(),
            });
        }
        Ok(Hash::new(algorithm, digest))
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.data[0..self.algorithm.size()]
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.digest_bytes() == other.digest_bytes()
    }
}

impl Eq for Hash {}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.algorithm
            .cmp(&other.algorithm)
            .then_with(|| self.digest_bytes().cmp(other.digest_bytes()))
    }
}

impl std::hash::Hash for Hash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.algorithm.hash(state);
        self.digest_bytes().hash(state);
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl TryFrom<digest::Digest> for Hash {
    type Error = UnknownAlgorithm;
    fn try_from(digest: digest::Digest) -> Result<Self, Self::Error> {
        let algorithm = if digest.algorithm() == &digest::SHA1_FOR_LEGACY_USE_ONLY {
            Algorithm::SHA1
        } else if digest.algorithm() == &digest::SHA256 {
            Algorithm::SHA256
        } else if digest.algorithm() == &digest::SHA512 {
            Algorithm::SHA512
        } else {
            return Err(UnknownAlgorithm(format!("{:?}", digest.algorithm())));
        };
        Ok(Hash::new(algorithm, digest.as_ref()))
    }
}

impl sfmt::Debug for Hash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "Hash({self})")
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_sri())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash::parse_any(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 digest of a NAR stream, the canonical content identity of a
/// store object.
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct NarHash(Sha256);

impl NarHash {
    pub const fn new(digest: &[u8]) -> NarHash {
        NarHash(Sha256::new(digest))
    }

    pub fn from_slice(digest: &[u8]) -> Result<NarHash, InvalidHashError> {
        Sha256::from_slice(digest).map(NarHash)
    }

    pub fn digest<D: AsRef<[u8]>>(data: D) -> Self {
        NarHash::new(Algorithm::SHA256.digest(data).digest_bytes())
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        self.0.digest_bytes()
    }

    /// Bare nix-base32 form, as used in narinfo `URL` fields and the like.
    pub fn to_base32(&self) -> String {
        Hash::from(*self).to_base32()
    }
}

impl From<NarHash> for Hash {
    fn from(value: NarHash) -> Self {
        value.0.into()
    }
}

impl TryFrom<Hash> for NarHash {
    type Error = ParseHashError;

    fn try_from(value: Hash) -> Result<Self, Self::Error> {
        Ok(NarHash(value.try_into()?))
    }
}

impl sfmt::Display for NarHash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        Hash::from(*self).fmt(f)
    }
}

impl sfmt::Debug for NarHash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "NarHash({self})")
    }
}

impl Serialize for NarHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Hash::from(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NarHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hash = Hash::deserialize(deserializer)?;
        NarHash::try_from(hash).map_err(serde::de::Error::custom)
    }
}

/// A bare SHA-256 digest.
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Sha256([u8; Algorithm::SHA256.size()]);

impl Sha256 {
    pub const fn new(digest: &[u8]) -> Self {
        let mut data = [0u8; Algorithm::SHA256.size()];
        data.copy_from_slice(digest);
        Self(data)
    }

    pub fn from_slice(digest: &[u8]) -> Result<Self, InvalidHashError> {
        if digest.len() != Algorithm::SHA256.size() {
            return Err(InvalidHashError {
                algorithm: Algorithm::SHA256,
                length: digest.len(),
            });
        }
        Ok(Self::new(digest))
    }

    pub fn digest<B: AsRef<[u8]>>(data: B) -> Self {
        Self::new(Algorithm::SHA256.digest(data).digest_bytes())
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl From<Sha256> for Hash {
    fn from(value: Sha256) -> Self {
        Hash::new(Algorithm::SHA256, value.as_ref())
    }
}

impl TryFrom<Hash> for Sha256 {
    type Error = ParseHashError;

    fn try_from(value: Hash) -> Result<Self, Self::Error> {
        if value.algorithm() != Algorithm::SHA256 {
            return Err(ParseHashError::TypeMismatch {
                expected: Algorithm::SHA256,
                actual: value.algorithm(),
            });
        }
        Ok(Self::new(value.digest_bytes()))
    }
}

#[derive(Clone)]
enum InnerContext {
    MD5(md5::Context),
    Ring(digest::Context),
}

/// A context for multi-step (init-update-finish) digest calculation.
///
/// # Examples
///
/// ```
/// use cadenza_utils_hash as hash;
///
/// let one_shot = hash::Algorithm::SHA256.digest("hello, world");
///
/// let mut ctx = hash::Context::new(hash::Algorithm::SHA256);
/// ctx.update("hello");
/// ctx.update(", ");
/// ctx.update("world");
/// let multi_step = ctx.finish();
///
/// assert_eq!(one_shot, multi_step);
/// ```
#[derive(Clone)]
pub struct Context(Algorithm, InnerContext);

impl Context {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::MD5 => Context(algorithm, InnerContext::MD5(md5::Context::new())),
            _ => Context(
                algorithm,
                InnerContext::Ring(digest::Context::new(algorithm.ring_algorithm())),
            ),
        }
    }

    /// Update the digest with all of `data`. May be called zero or more
    /// times before `finish`.
    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        let data = data.as_ref();
        match &mut self.1 {
            InnerContext::MD5(ctx) => ctx.consume(data),
            InnerContext::Ring(ctx) => ctx.update(data),
        }
    }

    /// Finalize and return the [`Hash`]. Consumes the context to prevent
    /// reuse.
    pub fn finish(self) -> Hash {
        match self.1 {
            InnerContext::MD5(ctx) => Hash::new(self.0, ctx.finalize().as_ref()),
            InnerContext::Ring(ctx) => Hash::new(self.0, ctx.finish().as_ref()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.0
    }
}

impl sfmt::Debug for Context {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.debug_tuple("Context").field(&self.0).finish()
    }
}

/// A hash sink that implements [`AsyncWrite`].
///
/// # Examples
///
/// ```
/// use tokio::io;
/// use cadenza_utils_hash as hash;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// let mut reader: &[u8] = b"hello, world";
/// let mut sink = hash::HashSink::new(hash::Algorithm::SHA256);
///
/// io::copy(&mut reader, &mut sink).await?;
/// let (size, hash) = sink.finish();
///
/// assert_eq!(hash, hash::Algorithm::SHA256.digest("hello, world"));
/// assert_eq!(size, 12);
/// # Ok(())
/// # }
/// ```
///
/// [`AsyncWrite`]: tokio::io::AsyncWrite
#[derive(Debug)]
pub struct HashSink(Option<(u64, Context)>);

impl HashSink {
    pub fn new(algorithm: Algorithm) -> HashSink {
        HashSink(Some((0, Context::new(algorithm))))
    }

    /// Feed a chunk without going through the `AsyncWrite` machinery.
    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        let data = data.as_ref();
        if let Some((written, ctx)) = self.0.as_mut() {
            *written += data.len() as u64;
            ctx.update(data);
        }
    }

    /// Finalize the sink, returning the number of bytes written and the hash.
    pub fn finish(self) -> (u64, Hash) {
        let (written, ctx) = self.0.expect("HashSink already finished");
        (written, ctx.finish())
    }
}

impl tokio::io::AsyncWrite for HashSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.0.as_mut() {
            None => std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "cannot write to HashSink after calling finish()",
            ))),
            Some((written, ctx)) => {
                *written += buf.len() as u64;
                ctx.update(buf);
                std::task::Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}
