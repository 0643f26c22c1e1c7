// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Artifact and manifest transport

use crate::error::{Result, UpdateError};
use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Delays between attempts (seconds)
pub const RETRY_DELAYS: [u64; 3] = [1, 5, 30];

const USER_AGENT: &str = concat!("ota-updater/", env!("CARGO_PKG_VERSION"));

/// `(bytes received, total bytes if known)`
pub type ProgressFn<'a> = dyn Fn(u64, Option<u64>) + Send + Sync + 'a;

#[async_trait]
pub trait Downloader: Send + Sync + fmt::Debug {
    /// Fetch `url` into `dest`. When `expected_sha256` is given the transfer
    /// fails unless the received bytes hash to it, and `dest` is not created.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
        on_progress: Option<&ProgressFn<'_>>,
    ) -> Result<()>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    retry_delays: Vec<Duration>,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| UpdateError::DownloadFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            retry_delays: RETRY_DELAYS.iter().copied().map(Duration::from_secs).collect(),
        })
    }

    #[must_use]
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    async fn with_retries<T, F, Fut>(&self, url: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retry_delays.len() + 1;
        let mut n = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if n < attempts => {
                    let delay = self.retry_delays[n - 1];
                    tracing::warn!(
                        "Fetching {url} failed: {e}; retrying in {delay:?} (attempt {}/{attempts})",
                        n + 1
                    );
                    tokio::time::sleep(delay).await;
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::DownloadFailed(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed(format!(
                "Download of {url} failed with status: {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn fetch_once(
        &self,
        url: &str,
        part: &Path,
        expected_sha256: Option<&str>,
        on_progress: Option<&ProgressFn<'_>>,
    ) -> Result<()> {
        let response = self.get(url).await?;
        let total = response.content_length();

        let mut file = tokio::fs::File::create(part).await?;
        let mut hasher = Sha256::new();
        let mut received = 0u64;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| UpdateError::DownloadFailed(format!("Failed to read body: {e}")))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(progress) = on_progress {
                progress(received, total);
            }
        }
        file.flush().await?;
        file.sync_all().await?;

        let actual = format!("{:x}", hasher.finalize());
        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(UpdateError::DownloadFailed(format!(
                    "Checksum mismatch for {url}: expected {expected}, got {actual}"
                )));
            }
        }

        tracing::debug!("Downloaded {received} bytes from {url}");
        Ok(())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
        on_progress: Option<&ProgressFn<'_>>,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_buf = part_path(dest);
        let part = part_buf.as_path();

        let result = self
            .with_retries(url, || async move {
                let fetched = self.fetch_once(url, part, expected_sha256, on_progress).await;
                if fetched.is_err() {
                    let _ = tokio::fs::remove_file(part).await;
                }
                fetched
            })
            .await;
        result?;

        tokio::fs::rename(part, dest).await?;
        tracing::info!("Fetched {url} to {}", dest.display());
        Ok(())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.with_retries(url, || async move {
            let response = self.get(url).await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| UpdateError::DownloadFailed(format!("Failed to read response: {e}")))?;
            Ok(bytes.to_vec())
        })
        .await
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Read a manifest from the local filesystem
pub async fn file_source(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        UpdateError::DownloadFailed(format!("Failed to read {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    fn no_delay() -> HttpDownloader {
        HttpDownloader::new()
            .unwrap()
            .with_retry_delays(vec![Duration::ZERO])
    }

    fn sha256(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_fetch_verifies_and_renames() {
        let mut server = Server::new_async().await;
        let body = vec![7u8; 10_000];
        let mock = server
            .mock("GET", "/models/yolov8.rknn")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("batch").join("yolov8.rknn");
        let seen = AtomicU64::new(0);
        let progress: &ProgressFn<'_> = &|received, _total| {
            seen.store(received, Ordering::SeqCst);
        };

        no_delay()
            .fetch(
                &format!("{}/models/yolov8.rknn", server.url()),
                &dest,
                Some(&sha256(&body).to_uppercase()),
                Some(progress),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!part_path(&dest).exists());
        assert_eq!(seen.load(Ordering::SeqCst), 10_000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/fw.bin")
            .with_status(200)
            .with_body("firmware")
            .expect(2)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("fw.bin");
        let result = no_delay()
            .fetch(&format!("{}/fw.bin", server.url()), &dest, Some(&"0".repeat(64)), None)
            .await;

        assert!(matches!(result, Err(UpdateError::DownloadFailed(_))));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing.bin")
            .with_status(404)
            .expect(2)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("missing.bin");
        let err = no_delay()
            .fetch(&format!("{}/missing.bin", server.url()), &dest, None, None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"));
        assert!(!dest.exists());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_bytes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/manifest.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"version": "1.2.0"}"#)
            .create_async()
            .await;

        let bytes = no_delay()
            .fetch_bytes(&format!("{}/manifest.json", server.url()))
            .await
            .unwrap();

        assert_eq!(bytes, br#"{"version": "1.2.0"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, b"{}").unwrap();

        assert_eq!(file_source(&path).await.unwrap(), b"{}");
        assert!(file_source(&dir.path().join("nope.json")).await.is_err());
    }
}
