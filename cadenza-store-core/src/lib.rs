// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Pure store semantics shared by every store implementation.
//!
//! Nothing in this crate touches the filesystem or the network: it is the
//! algebra of store paths, content addresses, derivations, signatures and
//! the metadata describing valid paths. The concrete engines
//! (`cadenza-store`, `cadenza-cache`) and the scheduler
//! (`cadenza-daemon`) build on these types.

pub mod content_address;
pub mod derivation;
pub mod derived_path;
pub mod fingerprint;
pub mod path_info;
pub mod placeholder;
pub mod realisation;
pub mod references;
pub mod signature;
pub mod signing;
pub mod store_path;

pub use content_address::{ContentAddress, FileIngestionMethod};
pub use derivation::{BasicDerivation, DerivationOptions, DerivationOutput, OutputName};
pub use derived_path::{DerivedPath, OutputSpec};
pub use fingerprint::fingerprint_path;
pub use path_info::ValidPathInfo;
pub use realisation::{DrvOutput, Realisation};
pub use references::RefScanSink;
pub use signature::{NarSignature, Signature};
pub use signing::{PublicKey, SecretKey};
pub use store_path::{BadStorePath, StoreDir, StorePath, StorePathHash, StorePathName, StoreReferences};
