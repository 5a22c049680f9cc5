// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Content-address descriptors.
//!
//! A content address records *how* a store object's path was derived from
//! its contents, so that validity can be re-checked from the bytes alone.
//! The textual forms are the ones used in narinfo `CA:` fields and the
//! store database:
//!
//! - `text:sha256:<base32>` — text objects (`.drv` files)
//! - `fixed:r:<algo>:<base32>` — recursive (NAR) ingestion
//! - `fixed:<algo>:<base32>` — flat file ingestion

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadenza_utils_hash::{Algorithm, Hash, ParseHashError};

/// How file contents are turned into a hashable byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileIngestionMethod {
    /// Hash the file contents as-is. Only valid for a single regular file.
    Flat,
    /// Hash the NAR serialisation of the path.
    Recursive,
}

impl FileIngestionMethod {
    /// Prefix used inside path fingerprints and CA renderings.
    pub fn prefix(&self) -> &'static str {
        match self {
            FileIngestionMethod::Flat => "",
            FileIngestionMethod::Recursive => "r:",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseContentAddressError {
    #[error("content address '{0}' lacks a method prefix")]
    MissingMethod(String),
    #[error("unknown content address method '{0}'")]
    UnknownMethod(String),
    #[error("invalid hash in content address: {0}")]
    BadHash(#[from] ParseHashError),
    #[error("text content address must use sha256, not {0}")]
    TextNotSha256(Algorithm),
}

/// A parsed content-address descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddress {
    /// `text:sha256:…` — hash of the literal contents.
    Text(Hash),
    /// `fixed:[r:]<algo>:…` — hash under a file ingestion method.
    Fixed(FileIngestionMethod, Hash),
}

impl ContentAddress {
    pub fn hash(&self) -> &Hash {
        match self {
            ContentAddress::Text(hash) => hash,
            ContentAddress::Fixed(_, hash) => hash,
        }
    }

    /// The ingestion method, treating text as flat content.
    pub fn ingestion_method(&self) -> FileIngestionMethod {
        match self {
            ContentAddress::Text(_) => FileIngestionMethod::Flat,
            ContentAddress::Fixed(method, _) => *method,
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseContentAddressError> {
        let (method, rest) = s
            .split_once(':')
            .ok_or_else(|| ParseContentAddressError::MissingMethod(s.to_owned()))?;
        match method {
            "text" => {
                let hash = Hash::parse_any(rest)?;
                if hash.algorithm() != Algorithm::SHA256 {
                    return Err(ParseContentAddressError::TextNotSha256(hash.algorithm()));
                }
                Ok(ContentAddress::Text(hash))
            }
            "fixed" => {
                let (method, rest) = match rest.strip_prefix("r:") {
                    Some(rest) => (FileIngestionMethod::Recursive, rest),
                    None => (FileIngestionMethod::Flat, rest),
                };
                Ok(ContentAddress::Fixed(method, Hash::parse_any(rest)?))
            }
            other => Err(ParseContentAddressError::UnknownMethod(other.to_owned())),
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Text(hash) => write!(f, "text:{hash}"),
            ContentAddress::Fixed(method, hash) => {
                write!(f, "fixed:{}{hash}", method.prefix())
            }
        }
    }
}

impl FromStr for ContentAddress {
    type Err = ParseContentAddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentAddress::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod unittests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::text("text:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::fixed_flat("fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::fixed_recursive("fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::fixed_sha1("fixed:r:sha1:x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88")]
    fn parse_render_roundtrip(#[case] s: &str) {
        let ca = ContentAddress::parse(s).unwrap();
        assert_eq!(ca.to_string(), s);
    }

    #[test]
    fn parse_classifies_methods() {
        let text =
            ContentAddress::parse("text:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")
                .unwrap();
        assert!(matches!(text, ContentAddress::Text(_)));
        let fixed =
            ContentAddress::parse("fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")
                .unwrap();
        assert_eq!(fixed.ingestion_method(), FileIngestionMethod::Recursive);
    }

    #[rstest]
    #[case::no_method("sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::unknown_method("git:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::text_md5("text:md5:c3fcd3d76192e4007dfb496cca67e13b")]
    fn parse_rejects(#[case] s: &str) {
        assert!(ContentAddress::parse(s).is_err());
    }
}
