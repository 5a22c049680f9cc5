// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! The `.narinfo` text format.
//!
//! Line-oriented `Key: value` pairs describing one store path in a binary
//! cache. The format is an interoperability surface: parsing a narinfo
//! and re-rendering it must be semantically identical, and field order on
//! output follows what every other implementation emits.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use cadenza_store_core::content_address::ContentAddress;
use cadenza_store_core::signature::NarSignature;
use cadenza_store_core::store_path::{StoreDir, StorePath};
use cadenza_store_core::ValidPathInfo;
use cadenza_utils_hash::{Encoding, Hash, NarHash};

/// NAR compression codecs a cache may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Xz,
    Bzip2,
    Gzip,
    Zstd,
    Brotli,
}

impl Compression {
    /// File extension appended to `nar/<hash>.nar`.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Xz => ".xz",
            Compression::Bzip2 => ".bz2",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
            Compression::Brotli => ".br",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Xz => "xz",
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Brotli => "br",
        })
    }
}

impl FromStr for Compression {
    type Err = NarInfoError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "xz" => Ok(Compression::Xz),
            "bzip2" => Ok(Compression::Bzip2),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            "br" => Ok(Compression::Brotli),
            other => Err(NarInfoError::BadField(
                "Compression",
                other.to_owned(),
            )),
        }
    }
}

#[derive(Error, Debug)]
pub enum NarInfoError {
    #[error("narinfo line '{0}' is not 'Key: value'")]
    BadLine(String),
    #[error("narinfo field {0} has invalid value '{1}'")]
    BadField(&'static str, String),
    #[error("narinfo is missing required field {0}")]
    MissingField(&'static str),
    #[error("narinfo describes '{0}', expected '{1}'")]
    WrongPath(String, String),
}

/// A parsed narinfo document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    /// Absolute store path described.
    pub store_path: String,
    /// Cache-relative location of the NAR file.
    pub url: String,
    pub compression: Compression,
    /// Hash/size of the (possibly compressed) file at `url`.
    pub file_hash: Option<Hash>,
    pub file_size: Option<u64>,
    /// Hash/size of the uncompressed NAR.
    pub nar_hash: Hash,
    pub nar_size: u64,
    /// Base names of referenced store paths.
    pub references: Vec<String>,
    /// Base name of the producing derivation.
    pub deriver: Option<String>,
    pub sigs: Vec<NarSignature>,
    pub ca: Option<ContentAddress>,
}

impl NarInfo {
    pub fn parse(text: &str) -> Result<Self, NarInfoError> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = Compression::None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = Vec::new();
        let mut deriver = None;
        let mut sigs = Vec::new();
        let mut ca = None;

        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| NarInfoError::BadLine(line.to_owned()))?;
            match key {
                "StorePath" => store_path = Some(value.to_owned()),
                "URL" => url = Some(value.to_owned()),
                "Compression" => compression = value.parse()?,
                "FileHash" => {
                    file_hash = Some(
                        Hash::parse_any(value)
                            .map_err(|_| NarInfoError::BadField("FileHash", value.to_owned()))?,
                    )
                }
                "FileSize" => {
                    file_size = Some(
                        value
                            .parse()
                            .map_err(|_| NarInfoError::BadField("FileSize", value.to_owned()))?,
                    )
                }
                "NarHash" => {
                    nar_hash = Some(
                        Hash::parse_any(value)
                            .map_err(|_| NarInfoError::BadField("NarHash", value.to_owned()))?,
                    )
                }
                "NarSize" => {
                    nar_size = Some(
                        value
                            .parse()
                            .map_err(|_| NarInfoError::BadField("NarSize", value.to_owned()))?,
                    )
                }
                "References" => {
                    references = value.split(' ').filter(|s| !s.is_empty()).map(str::to_owned).collect()
                }
                "Deriver" => {
                    if value != "unknown-deriver" {
                        deriver = Some(value.to_owned())
                    }
                }
                "Sig" => sigs.push(
                    value
                        .parse()
                        .map_err(|_| NarInfoError::BadField("Sig", value.to_owned()))?,
                ),
                "CA" => {
                    ca = Some(
                        value
                            .parse()
                            .map_err(|_| NarInfoError::BadField("CA", value.to_owned()))?,
                    )
                }
                // Unknown keys are forward compatibility, not errors.
                _ => {}
            }
        }

        Ok(NarInfo {
            store_path: store_path.ok_or(NarInfoError::MissingField("StorePath"))?,
            url: url.ok_or(NarInfoError::MissingField("URL"))?,
            compression,
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or(NarInfoError::MissingField("NarHash"))?,
            nar_size: nar_size.ok_or(NarInfoError::MissingField("NarSize"))?,
            references,
            deriver,
            sigs,
            ca,
        })
    }

    /// Render in canonical field order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("StorePath: {}\n", self.store_path));
        out.push_str(&format!("URL: {}\n", self.url));
        out.push_str(&format!("Compression: {}\n", self.compression));
        if let Some(file_hash) = &self.file_hash {
            out.push_str(&format!("FileHash: {}\n", file_hash.format(Encoding::Base32)));
        }
        if let Some(file_size) = self.file_size {
            out.push_str(&format!("FileSize: {file_size}\n"));
        }
        out.push_str(&format!("NarHash: {}\n", self.nar_hash.format(Encoding::Base32)));
        out.push_str(&format!("NarSize: {}\n", self.nar_size));
        out.push_str(&format!("References: {}\n", self.references.join(" ")));
        if let Some(deriver) = &self.deriver {
            out.push_str(&format!("Deriver: {deriver}\n"));
        }
        for sig in &self.sigs {
            out.push_str(&format!("Sig: {sig}\n"));
        }
        if let Some(ca) = &self.ca {
            out.push_str(&format!("CA: {ca}\n"));
        }
        out
    }

    /// Convert into the store-internal path metadata.
    pub fn to_path_info(&self, store_dir: &StoreDir) -> Result<ValidPathInfo, NarInfoError> {
        let path = store_dir
            .parse_path(&self.store_path)
            .map_err(|_| NarInfoError::BadField("StorePath", self.store_path.clone()))?;
        let nar_hash = NarHash::try_from(self.nar_hash)
            .map_err(|_| NarInfoError::BadField("NarHash", self.nar_hash.to_string()))?;

        let mut info = ValidPathInfo::new(path, nar_hash, self.nar_size);
        for basename in &self.references {
            info.references.insert(
                StorePath::from_base_path(basename)
                    .map_err(|_| NarInfoError::BadField("References", basename.clone()))?,
            );
        }
        if let Some(deriver) = &self.deriver {
            info.deriver = Some(
                StorePath::from_base_path(deriver)
                    .map_err(|_| NarInfoError::BadField("Deriver", deriver.clone()))?,
            );
        }
        info.signatures = self.sigs.iter().cloned().collect();
        info.ca = self.ca;
        Ok(info)
    }

    /// Build a narinfo skeleton from path metadata; the `URL`,
    /// `Compression` and file fields are filled by the uploader.
    pub fn from_path_info(store_dir: &StoreDir, info: &ValidPathInfo) -> Self {
        NarInfo {
            store_path: store_dir.display_path(&info.path),
            url: format!("nar/{}.nar", info.nar_hash.to_base32()),
            compression: Compression::None,
            file_hash: None,
            file_size: None,
            nar_hash: Hash::from(info.nar_hash),
            nar_size: info.nar_size,
            references: info.references.iter().map(ToString::to_string).collect(),
            deriver: info.deriver.as_ref().map(ToString::to_string),
            sigs: info.signatures.iter().cloned().collect(),
            ca: info.ca,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
StorePath: /nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3
URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz
Compression: xz
FileHash: sha256:1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3
FileSize: 114980
NarHash: sha256:0lxjvvpr59c2mdram7ympy5ay741f180kv3349hvfc3f8nrmbqf6
NarSize: 464152
References: 7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-glibc-2.28
Deriver: bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-konsole-18.12.3.drv
Sig: cache.example.org-1:eJ4Tkc8uNrGLsU2bJwQQyUrHRCzMdaDgAKKLZ2YnnlNdGgp5jHnBMCZQoGnROl2+1LnXBB9d2Rn2SBgQbVBDBw==
";

    #[test]
    fn parse_then_render_roundtrips() {
        let info = NarInfo::parse(SAMPLE).unwrap();
        assert_eq!(info.render(), SAMPLE);
    }

    #[test]
    fn parsed_fields() {
        let info = NarInfo::parse(SAMPLE).unwrap();
        assert_eq!(
            info.store_path,
            "/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3"
        );
        assert_eq!(info.compression, Compression::Xz);
        assert_eq!(info.file_size, Some(114_980));
        assert_eq!(info.nar_size, 464_152);
        assert_eq!(info.references.len(), 2);
        assert_eq!(info.sigs.len(), 1);
        assert_eq!(info.sigs[0].key_name, "cache.example.org-1");
        assert!(info.deriver.is_some());
        assert!(info.ca.is_none());
    }

    #[test]
    fn missing_required_fields_rejected() {
        assert!(matches!(
            NarInfo::parse("URL: nar/x.nar\nNarHash: sha256:0lxjvvpr59c2mdram7ympy5ay741f180kv3349hvfc3f8nrmbqf6\nNarSize: 1\n"),
            Err(NarInfoError::MissingField("StorePath"))
        ));
        assert!(matches!(
            NarInfo::parse("StorePath: /nix/store/x\nURL: nar/x.nar\nNarSize: 1\n"),
            Err(NarInfoError::MissingField("NarHash"))
        ));
    }

    #[test]
    fn empty_references_parse_and_render() {
        let text = SAMPLE.replace(
            "References: 7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-glibc-2.28",
            "References: ",
        );
        let info = NarInfo::parse(&text).unwrap();
        assert!(info.references.is_empty());
        assert!(info.render().contains("References: \n"));
    }

    #[test]
    fn to_path_info_conversion() {
        let info = NarInfo::parse(SAMPLE).unwrap();
        let path_info = info.to_path_info(&StoreDir::default()).unwrap();
        assert_eq!(path_info.nar_size, 464_152);
        assert_eq!(path_info.references.len(), 2);
        assert_eq!(path_info.signatures.len(), 1);
        assert!(path_info.deriver.is_some());
    }

    #[test]
    fn unknown_keys_ignored() {
        let text = format!("{SAMPLE}SomeFutureKey: whatever\n");
        assert!(NarInfo::parse(&text).is_ok());
    }
}
