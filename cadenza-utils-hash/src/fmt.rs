// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Textual hash encodings.
//!
//! Four forms are understood everywhere a hash is parsed:
//!
//! - base16: `sha256:ba7816bf…`
//! - nix-base32: `sha256:1b8m03r6…` (the store-path form)
//! - base64: `sha256:ungWv48B…`
//! - SRI: `sha256-ungWv48B…=`
//!
//! Bare digests (no algorithm prefix) can be parsed when the algorithm is
//! known from context; the encoding is then determined by length, which is
//! unambiguous for all supported algorithms.

use std::fmt;
use std::str::FromStr;

use data_encoding::{BASE64, HEXLOWER, HEXLOWER_PERMISSIVE};
use derive_more::Display;
use thiserror::Error;

use cadenza_utils_base_encoding as base32;

use crate::{Algorithm, Hash};

/// A textual encoding for hash digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Encoding {
    #[display("base16")]
    Base16,
    #[display("base32")]
    Base32,
    #[display("base64")]
    Base64,
    #[display("sri")]
    Sri,
}

impl Encoding {
    /// Length of the encoded digest for `algorithm` (excluding any prefix).
    pub const fn encoded_len(&self, algorithm: Algorithm) -> usize {
        let size = algorithm.size();
        match self {
            Encoding::Base16 => size * 2,
            Encoding::Base32 => base32::encoded_len(size),
            Encoding::Base64 | Encoding::Sri => size.div_ceil(3) * 4,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum ParseHashError {
    #[error("hash '{0}' has no algorithm prefix")]
    MissingPrefix(String),
    #[error(transparent)]
    UnknownAlgorithm(#[from] crate::UnknownAlgorithm),
    #[error("hash '{input}' has wrong length for hash type '{algorithm}'")]
    WrongLength { algorithm: Algorithm, input: String },
    #[error("hash '{input}' is not valid {encoding}")]
    BadEncoding { encoding: Encoding, input: String },
    #[error("hash type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: Algorithm,
        actual: Algorithm,
    },
}

impl Hash {
    /// Bare lowercase base16.
    pub fn to_base16(&self) -> String {
        HEXLOWER.encode(self.digest_bytes())
    }

    /// Bare nix-base32.
    pub fn to_base32(&self) -> String {
        base32::encode(self.digest_bytes())
    }

    /// Bare standard base64.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.digest_bytes())
    }

    /// SRI form, `<algo>-<base64>`.
    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algorithm(), self.to_base64())
    }

    /// Prefixed form: `<algo>:<digest>` for base16/32/64, SRI for
    /// [`Encoding::Sri`].
    pub fn format(&self, encoding: Encoding) -> String {
        match encoding {
            Encoding::Base16 => format!("{}:{}", self.algorithm(), self.to_base16()),
            Encoding::Base32 => format!("{}:{}", self.algorithm(), self.to_base32()),
            Encoding::Base64 => format!("{}:{}", self.algorithm(), self.to_base64()),
            Encoding::Sri => self.to_sri(),
        }
    }

    /// Parse a bare digest whose algorithm is known from context. The
    /// encoding is inferred from the input length.
    pub fn parse_bare(algorithm: Algorithm, input: &str) -> Result<Hash, ParseHashError> {
        let bad = |encoding| ParseHashError::BadEncoding {
            encoding,
            input: input.to_owned(),
        };
        let digest = if input.len() == Encoding::Base16.encoded_len(algorithm) {
            HEXLOWER_PERMISSIVE
                .decode(input.as_bytes())
                .map_err(|_| bad(Encoding::Base16))?
        } else if input.len() == Encoding::Base32.encoded_len(algorithm) {
            base32::decode(input.as_bytes()).map_err(|_| bad(Encoding::Base32))?
        } else if input.len() == Encoding::Base64.encoded_len(algorithm) {
            BASE64
                .decode(input.as_bytes())
                .map_err(|_| bad(Encoding::Base64))?
        } else {
            return Err(ParseHashError::WrongLength {
                algorithm,
                input: input.to_owned(),
            });
        };
        Hash::from_slice(algorithm, &digest).map_err(|_| ParseHashError::WrongLength {
            algorithm,
            input: input.to_owned(),
        })
    }

    /// Parse any prefixed form: `<algo>:<digest>` or SRI `<algo>-<base64>`.
    pub fn parse_any(input: &str) -> Result<Hash, ParseHashError> {
        if let Some((algo, rest)) = input.split_once(':') {
            let algorithm: Algorithm = algo.parse()?;
            return Hash::parse_bare(algorithm, rest);
        }
        // SRI: the separator is '-', which requires the base64 digest, and
        // base64 may itself not contain '-', so the first one wins.
        if let Some((algo, rest)) = input.split_once('-') {
            let algorithm: Algorithm = algo.parse()?;
            if rest.len() != Encoding::Base64.encoded_len(algorithm) {
                return Err(ParseHashError::WrongLength {
                    algorithm,
                    input: input.to_owned(),
                });
            }
            let digest = BASE64
                .decode(rest.as_bytes())
                .map_err(|_| ParseHashError::BadEncoding {
                    encoding: Encoding::Sri,
                    input: input.to_owned(),
                })?;
            return Hash::from_slice(algorithm, &digest).map_err(|_| {
                ParseHashError::WrongLength {
                    algorithm,
                    input: input.to_owned(),
                }
            });
        }
        Err(ParseHashError::MissingPrefix(input.to_owned()))
    }

    /// Like [`Hash::parse_any`], but also accepts a bare digest when
    /// `assumed` is given.
    pub fn parse_any_with(
        assumed: Option<Algorithm>,
        input: &str,
    ) -> Result<Hash, ParseHashError> {
        match Hash::parse_any(input) {
            Err(ParseHashError::MissingPrefix(_)) if assumed.is_some() => {
                Hash::parse_bare(assumed.unwrap(), input)
            }
            other => other,
        }
    }
}

/// The canonical display form is `<algo>:<base32>`, matching what every
/// other tool in the ecosystem prints by default.
impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self.to_base32())
    }
}

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::parse_any(s)
    }
}

#[cfg(test)]
mod unittests {
    use rstest::rstest;

    use super::*;

    fn abc() -> Hash {
        Algorithm::SHA256.digest("abc")
    }

    #[rstest]
    #[case::base16(Encoding::Base16)]
    #[case::base32(Encoding::Base32)]
    #[case::base64(Encoding::Base64)]
    #[case::sri(Encoding::Sri)]
    fn format_parse_roundtrip(#[case] encoding: Encoding) {
        let hash = abc();
        let text = hash.format(encoding);
        assert_eq!(Hash::parse_any(&text).unwrap(), hash);
    }

    #[rstest]
    #[case::base16(Encoding::Base16)]
    #[case::base32(Encoding::Base32)]
    #[case::base64(Encoding::Base64)]
    fn bare_roundtrip(#[case] encoding: Encoding) {
        let hash = abc();
        let bare = match encoding {
            Encoding::Base16 => hash.to_base16(),
            Encoding::Base32 => hash.to_base32(),
            Encoding::Base64 => hash.to_base64(),
            Encoding::Sri => unreachable!(),
        };
        assert_eq!(Hash::parse_bare(Algorithm::SHA256, &bare).unwrap(), hash);
    }

    #[test]
    fn display_is_prefixed_base32() {
        assert_eq!(
            abc().to_string(),
            "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
        );
    }

    #[test]
    fn known_forms() {
        let hash = abc();
        assert_eq!(
            hash.to_base16(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash.to_sri(), "sha256-ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(matches!(
            Hash::parse_any("sha256:abcd"),
            Err(ParseHashError::WrongLength { .. })
        ));
    }

    #[test]
    fn parse_rejects_unknown_algorithm() {
        assert!(matches!(
            Hash::parse_any("sha384:0000"),
            Err(ParseHashError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        assert!(matches!(
            Hash::parse_any("1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"),
            Err(ParseHashError::MissingPrefix(_))
        ));
    }

    #[test]
    fn parse_bare_with_assumed_algorithm() {
        let hash = abc();
        let parsed = Hash::parse_any_with(Some(Algorithm::SHA256), &hash.to_base32()).unwrap();
        assert_eq!(parsed, hash);
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn arb_hash() -> impl Strategy<Value = Hash> {
        (
            prop_oneof![
                Just(Algorithm::MD5),
                Just(Algorithm::SHA1),
                Just(Algorithm::SHA256),
                Just(Algorithm::SHA512),
            ],
            any::<Vec<u8>>(),
        )
            .prop_map(|(algorithm, data)| algorithm.digest(data))
    }

    proptest! {
        #[test]
        fn proptest_all_encodings_roundtrip(hash in arb_hash()) {
            for encoding in [Encoding::Base16, Encoding::Base32, Encoding::Base64, Encoding::Sri] {
                let text = hash.format(encoding);
                prop_assert_eq!(Hash::parse_any(&text).unwrap(), hash);
            }
        }
    }
}
