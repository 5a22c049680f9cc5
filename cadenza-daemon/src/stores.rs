// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Opening stores from URIs.

use std::sync::Arc;

use cadenza_cache::{BinaryCacheConfig, BinaryCacheStore, FileTransport, HttpTransport};
use cadenza_store::{LocalStore, LocalStoreConfig, Store, StoreError, StoreUri, StoreUriKind};
use cadenza_store_core::signing::PublicKey;
use cadenza_store_core::store_path::StoreDir;

use crate::config::DaemonConfig;
use crate::error::DaemonError;

/// Open the daemon's own (local) store.
pub async fn open_local_store(config: &DaemonConfig) -> Result<Arc<LocalStore>, DaemonError> {
    let store_dir = StoreDir::new(config.store_dir.to_string_lossy().into_owned())
        .map_err(|e| DaemonError::config(format!("bad store dir: {e}")))?;
    let local_config = LocalStoreConfig {
        store_dir,
        state_dir: config.state_dir.clone(),
        require_sigs: config.require_sigs,
        trusted_public_keys: parse_keys(&config.trusted_public_keys)?,
        min_free: config.min_free,
        max_free: config.max_free,
    };
    Ok(Arc::new(LocalStore::open(local_config).await?))
}

/// Open one substituter from its URI.
pub async fn open_substituter(
    config: &DaemonConfig,
    uri: &str,
) -> Result<Arc<dyn Store>, DaemonError> {
    let parsed = StoreUri::parse(uri)?;
    let store_dir = StoreDir::new(config.store_dir.to_string_lossy().into_owned())
        .map_err(|e| DaemonError::config(format!("bad store dir: {e}")))?;

    let cache_config = |priority: u32| BinaryCacheConfig {
        store_dir: store_dir.clone(),
        require_sigs: config.require_sigs,
        trusted_public_keys: parse_keys(&config.trusted_public_keys).unwrap_or_default(),
        priority: parsed.param_u32("priority").unwrap_or(priority),
        ..Default::default()
    };

    match &parsed.kind {
        StoreUriKind::File { path } => {
            let store =
                BinaryCacheStore::new(cache_config(50), Box::new(FileTransport::new(path)));
            store.init().await?;
            Ok(Arc::new(store))
        }
        StoreUriKind::Http { url } => {
            let transport = HttpTransport::new(url.clone(), config.try_fallback);
            let store = BinaryCacheStore::new(cache_config(50), Box::new(transport));
            store.init().await?;
            Ok(Arc::new(store))
        }
        StoreUriKind::Auto | StoreUriKind::Local => Err(DaemonError::config(format!(
            "'{uri}' is not usable as a substituter for itself"
        ))),
        StoreUriKind::Unsupported { scheme } => Err(DaemonError::Store(
            StoreError::UnsupportedUri(format!("{scheme} ({uri})")),
        )),
    }
}

/// Open every configured substituter, skipping (with a log line) the
/// ones that fail to initialise.
pub async fn open_substituters(config: &DaemonConfig) -> Vec<Arc<dyn Store>> {
    let mut out = Vec::new();
    for uri in &config.substituters {
        match open_substituter(config, uri).await {
            Ok(store) => out.push(store),
            Err(e) => tracing::warn!("ignoring substituter '{uri}': {e}"),
        }
    }
    out
}

fn parse_keys(keys: &[String]) -> Result<Vec<PublicKey>, DaemonError> {
    keys.iter()
        .map(|k| {
            PublicKey::parse(k)
                .map_err(|e| DaemonError::config(format!("bad trusted public key: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_substituter_opens() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            store_dir: dir.path().join("store"),
            require_sigs: false,
            ..Default::default()
        };
        let uri = format!("file://{}", dir.path().join("cache").display());
        let store = open_substituter(&config, &uri).await.unwrap();
        assert!(store.uri().starts_with("file://"));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_reported() {
        let config = DaemonConfig::default();
        let result = open_substituter(&config, "s3://bucket").await;
        assert!(matches!(
            result,
            Err(DaemonError::Store(StoreError::UnsupportedUri(_)))
        ));
    }

    #[tokio::test]
    async fn priority_parameter_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            store_dir: dir.path().join("store"),
            require_sigs: false,
            ..Default::default()
        };
        let uri = format!("file://{}?priority=7", dir.path().join("cache").display());
        let store = open_substituter(&config, &uri).await.unwrap();
        assert_eq!(store.priority(), 7);
    }
}
