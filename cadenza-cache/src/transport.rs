// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Byte-level access to a cache: local directories and HTTP endpoints.
//!
//! The HTTP transport carries the adaptive-disable behaviour: after a
//! transport-level failure the cache turns itself off for a cool-down
//! (60 s) when fallback to other substituters is allowed, so one dead
//! mirror does not stall every lookup. Missing files (404, and 403 as
//! S3-compatible endpoints spell it) are a normal condition and never
//! disable the cache.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use cadenza_store::{Result, StoreError};

/// How long a failing HTTP cache stays disabled.
const DISABLE_COOLDOWN: Duration = Duration::from_secs(60);

/// A readable byte stream from the cache.
pub type FileStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait CacheTransport: Send + Sync {
    /// Base URL, for diagnostics and error attribution.
    fn url(&self) -> String;

    async fn file_exists(&self, path: &str) -> Result<bool>;

    /// Open `path` for reading. Missing files are
    /// [`StoreError::NoSuchBinaryCacheFile`].
    async fn get_file(&self, path: &str) -> Result<FileStream>;

    /// Read `path` fully into memory.
    async fn get_file_contents(&self, path: &str) -> Result<Vec<u8>> {
        let mut stream = self.get_file(path).await?;
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut out).await?;
        Ok(out)
    }

    /// Create or replace `path`.
    async fn upsert_file(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<()>;
}

/// A cache rooted in a local directory (`file://`).
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl CacheTransport for FileTransport {
    fn url(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn get_file(&self, path: &str) -> Result<FileStream> {
        match tokio::fs::File::open(self.resolve(path)).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                StoreError::NoSuchBinaryCacheFile(path.to_owned(), self.url()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_file(&self, path: &str, data: Vec<u8>, _content_type: &str) -> Result<()> {
        let dest = self.resolve(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a reader never sees a half-written file.
        let temp = dest.with_extension("tmp");
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, &dest).await?;
        Ok(())
    }
}

struct HttpState {
    enabled: bool,
    disabled_until: Instant,
}

/// A cache behind `http://` or `https://`.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    /// Self-disable applies only when the caller can fall back.
    try_fallback: bool,
    state: Mutex<HttpState>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, try_fallback: bool) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            try_fallback,
            state: Mutex::new(HttpState {
                enabled: true,
                disabled_until: Instant::now(),
            }),
        }
    }

    fn make_uri(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Raise [`StoreError::SubstituterDisabled`] while cooling down;
    /// re-enable once the cool-down has passed.
    fn check_enabled(&self) -> Result<()> {
        let mut state = self.state.lock().expect("http state lock poisoned");
        if state.enabled {
            return Ok(());
        }
        if Instant::now() > state.disabled_until {
            state.enabled = true;
            debug!(cache = %self.base_url, "re-enabling binary cache");
            return Ok(());
        }
        Err(StoreError::SubstituterDisabled(self.base_url.clone()))
    }

    fn maybe_disable(&self) {
        if !self.try_fallback {
            return;
        }
        let mut state = self.state.lock().expect("http state lock poisoned");
        if state.enabled {
            warn!(
                cache = %self.base_url,
                "disabling binary cache for {} seconds",
                DISABLE_COOLDOWN.as_secs()
            );
            state.enabled = false;
            state.disabled_until = Instant::now() + DISABLE_COOLDOWN;
        }
    }

    fn transfer_error(&self, path: &str, reason: impl ToString) -> StoreError {
        StoreError::FileTransferError {
            url: self.make_uri(path),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl CacheTransport for HttpTransport {
    fn url(&self) -> String {
        self.base_url.clone()
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        self.check_enabled()?;
        let response = self
            .client
            .head(self.make_uri(path))
            .send()
            .await
            .map_err(|e| {
                self.maybe_disable();
                self.transfer_error(path, e)
            })?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 | 403 => Ok(false),
            status => {
                self.maybe_disable();
                Err(self.transfer_error(path, format!("unexpected status {status}")))
            }
        }
    }

    async fn get_file(&self, path: &str) -> Result<FileStream> {
        self.check_enabled()?;
        let response = self
            .client
            .get(self.make_uri(path))
            .send()
            .await
            .map_err(|e| {
                self.maybe_disable();
                self.transfer_error(path, e)
            })?;
        match response.status().as_u16() {
            200 => {
                let stream = futures::TryStreamExt::map_err(
                    response.bytes_stream(),
                    std::io::Error::other,
                );
                Ok(Box::pin(tokio_util::io::StreamReader::new(stream)))
            }
            404 | 403 => Err(StoreError::NoSuchBinaryCacheFile(
                path.to_owned(),
                self.url(),
            )),
            status => {
                self.maybe_disable();
                Err(self.transfer_error(path, format!("unexpected status {status}")))
            }
        }
    }

    async fn upsert_file(&self, path: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.check_enabled()?;
        let response = self
            .client
            .put(self.make_uri(path))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| self.transfer_error(path, e))?;
        if !response.status().is_success() {
            return Err(self.transfer_error(
                path,
                format!("upload failed with status {}", response.status()),
            ));
        }
        Ok(())
    }
}
