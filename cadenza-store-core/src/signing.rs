// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Ed25519 key pairs for signing and verifying path fingerprints.
//!
//! Keys use the same text format as every other store implementation:
//! `<name>:<base64>`, where a secret key carries the 64-byte
//! seed-plus-public expansion and a public key the 32-byte point.

use std::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};

use crate::signature::{NarSignature, Signature, SignatureError};

/// A named Ed25519 verifying key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub name: String,
    key: VerifyingKey,
}

impl PublicKey {
    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let (name, b64) = s
            .split_once(':')
            .ok_or_else(|| SignatureError::InvalidKey(format!("missing ':' in '{s}'")))?;
        if name.is_empty() {
            return Err(SignatureError::InvalidKey("empty key name".to_owned()));
        }
        let bytes = general_purpose::STANDARD.decode(b64)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidKey(format!("wrong length {}", bytes.len())))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self {
            name: name.to_owned(),
            key,
        })
    }

    /// Verify `sig` over `payload`, requiring a matching key name.
    pub fn verify(&self, payload: impl AsRef<[u8]>, sig: &NarSignature) -> bool {
        sig.key_name == self.name
            && self.key.verify(payload.as_ref(), sig.sig.inner()).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.name,
            general_purpose::STANDARD.encode(self.key.as_bytes())
        )
    }
}

impl FromStr for PublicKey {
    type Err = SignatureError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A named Ed25519 signing key.
pub struct SecretKey {
    pub name: String,
    key: SigningKey,
}

impl SecretKey {
    /// Generate a fresh key pair.
    pub fn generate(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let (name, b64) = s
            .split_once(':')
            .ok_or_else(|| SignatureError::InvalidKey("missing ':' in key".to_owned()))?;
        if name.is_empty() {
            return Err(SignatureError::InvalidKey("empty key name".to_owned()));
        }
        let bytes = general_purpose::STANDARD.decode(b64)?;
        let bytes: [u8; 64] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidKey(format!("wrong length {}", bytes.len())))?;
        let key = SigningKey::from_keypair_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self {
            name: name.to_owned(),
            key,
        })
    }

    /// Sign `payload`, producing a named signature.
    pub fn sign(&self, payload: impl AsRef<[u8]>) -> NarSignature {
        let sig = self.key.sign(payload.as_ref());
        NarSignature::new(
            self.name.clone(),
            Signature::from_bytes(&sig.to_bytes()).expect("ed25519 signature is 64 bytes"),
        )
    }

    /// The corresponding public key.
    pub fn to_public(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            key: self.key.verifying_key(),
        }
    }

    /// Render in the on-disk secret key format.
    pub fn to_key_string(&self) -> String {
        format!(
            "{}:{}",
            self.name,
            general_purpose::STANDARD.encode(self.key.to_keypair_bytes())
        )
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the key material.
        f.debug_struct("SecretKey").field("name", &self.name).finish_non_exhaustive()
    }
}

impl FromStr for SecretKey {
    type Err = SignatureError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// True when at least one signature verifies under one of `keys`.
pub fn verify_any(keys: &[PublicKey], payload: impl AsRef<[u8]>, sigs: &[NarSignature]) -> bool {
    let payload = payload.as_ref();
    sigs.iter()
        .any(|sig| keys.iter().any(|key| key.verify(payload, sig)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let secret = SecretKey::generate("cache.example.org-1");
        let public = secret.to_public();
        let sig = secret.sign("1;/nix/store/x;sha256:abc;123;");
        assert!(public.verify("1;/nix/store/x;sha256:abc;123;", &sig));
        assert!(!public.verify("1;/nix/store/x;sha256:abc;124;", &sig));
    }

    #[test]
    fn verify_requires_matching_key_name() {
        let secret = SecretKey::generate("one");
        let other = SecretKey::generate("two");
        let sig = secret.sign("payload");
        assert!(!other.to_public().verify("payload", &sig));
    }

    #[test]
    fn key_text_roundtrip() {
        let secret = SecretKey::generate("k-1");
        let reparsed = SecretKey::parse(&secret.to_key_string()).unwrap();
        let sig = reparsed.sign("data");
        assert!(secret.to_public().verify("data", &sig));

        let public = secret.to_public();
        let reparsed = PublicKey::parse(&public.to_string()).unwrap();
        assert_eq!(public, reparsed);
    }

    #[test]
    fn verify_any_finds_matching_key() {
        let a = SecretKey::generate("a-1");
        let b = SecretKey::generate("b-1");
        let sig = b.sign("payload");
        let keys = vec![a.to_public(), b.to_public()];
        assert!(verify_any(&keys, "payload", std::slice::from_ref(&sig)));
        assert!(!verify_any(&keys[..1], "payload", &[sig]));
    }
}
