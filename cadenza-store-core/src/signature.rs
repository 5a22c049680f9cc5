// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Path signatures in the `key-name:base64` text form.

use std::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose};
use ed25519_dalek::Signature as Ed25519Signature;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("invalid signature length: expected 64 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid signature format: {0}")]
    InvalidFormat(String),

    #[error("failed to parse ed25519 signature: {0}")]
    Ed25519(#[from] ed25519_dalek::SignatureError),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// A raw Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Ed25519Signature);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() != 64 {
            return Err(SignatureError::InvalidLength(bytes.len()));
        }
        Ok(Signature(Ed25519Signature::from_slice(bytes)?))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, SignatureError> {
        let bytes = general_purpose::STANDARD.decode(s)?;
        Self::from_bytes(&bytes)
    }

    pub fn inner(&self) -> &Ed25519Signature {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl std::hash::Hash for Signature {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl PartialOrd for Signature {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Signature {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

/// A named signature as it appears in narinfo `Sig:` lines and the store
/// database: `<key-name>:<base64>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NarSignature {
    /// Name of the key pair that produced the signature, e.g.
    /// `cache.example.org-1`.
    pub key_name: String,
    pub sig: Signature,
}

impl NarSignature {
    pub fn new(key_name: impl Into<String>, sig: Signature) -> Self {
        Self {
            key_name: key_name.into(),
            sig,
        }
    }

    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let (key_name, sig_str) = s
            .split_once(':')
            .ok_or_else(|| SignatureError::InvalidFormat("missing ':' separator".to_owned()))?;
        if key_name.is_empty() {
            return Err(SignatureError::InvalidFormat("empty key name".to_owned()));
        }
        Ok(Self::new(key_name, Signature::from_base64(sig_str)?))
    }
}

impl fmt::Display for NarSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_name, self.sig)
    }
}

impl FromStr for NarSignature {
    type Err = SignatureError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for NarSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for NarSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NarSignature::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_sig() -> NarSignature {
        let key = crate::signing::SecretKey::generate("test-1");
        key.sign("payload")
    }

    #[test]
    fn text_roundtrip() {
        let sig = some_sig();
        let text = sig.to_string();
        assert!(text.starts_with("test-1:"));
        assert_eq!(NarSignature::parse(&text).unwrap(), sig);
    }

    #[test]
    fn rejects_malformed() {
        assert!(NarSignature::parse("no-colon").is_err());
        assert!(NarSignature::parse(":c2ln").is_err());
        assert!(NarSignature::parse("key:!!!not-base64!!!").is_err());
        assert!(NarSignature::parse("key:c2hvcnQ=").is_err());
    }
}
