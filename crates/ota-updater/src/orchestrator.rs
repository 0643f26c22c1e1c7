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

//! End-to-end update flow: check, download, apply, rollback
//!
//! The orchestrator owns the persisted [`UpdateState`]. Every mutation is
//! written to disk before the operation returns, and [`UpdateOrchestrator::get_status`]
//! only ever reads the in-memory copy, so it never waits on an apply.

use crate::backup::BackupStore;
use crate::cancel::Cancellation;
use crate::config::EngineConfig;
use crate::downloader::{Downloader, file_source};
use crate::error::{Result, Severity, UpdateError};
use crate::executor::{AppliedArtifact, ApplyRequest, PendingCommit, UpdateExecutor};
use crate::manifest::{UpdateItem, UpdateManifest};
use crate::state::{UpdateState, load_state, save_state};
use crate::telemetry::{UpdateEvent, report_event};
use crate::verifier::ArtifactVerifier;
use crate::version::Version;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where a release manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Url(String),
    File(PathBuf),
}

impl ManifestSource {
    /// `http(s)://` locations are URLs, anything else a local path
    pub fn parse(location: &str) -> Self {
        if location.starts_with("https://") || location.starts_with("http://") {
            Self::Url(location.to_string())
        } else {
            Self::File(PathBuf::from(location))
        }
    }
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateCheck {
    /// Newer than the running release and not skipped
    pub available: bool,
    pub manifest: UpdateManifest,
    /// Release asks to be applied right away
    pub critical: bool,
    /// Running release satisfies `min_version`; advisory only
    pub meets_min_version: bool,
    /// Newer, but failed too many times in a row to retry
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct DownloadedItem {
    pub item: UpdateItem,
    pub path: PathBuf,
}

/// Every artifact of one manifest, fetched and checksum-verified
#[derive(Debug, Clone)]
pub struct DownloadedBatch {
    pub manifest: UpdateManifest,
    pub items: Vec<DownloadedItem>,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub version: String,
    pub from_version: String,
    pub applied: Vec<AppliedArtifact>,
    /// Release was not newer than the running one, nothing was touched
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub from_version: String,
    pub restored_version: String,
    /// `(artifact id, artifact version)`
    pub artifacts: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct UpdateOrchestrator {
    config: EngineConfig,
    downloader: Arc<dyn Downloader>,
    executor: Arc<UpdateExecutor>,
    state: RwLock<UpdateState>,
    /// Orders state writes without blocking readers
    persist: Mutex<()>,
    /// One check/download/apply pipeline at a time
    pipeline: tokio::sync::Mutex<()>,
}

impl UpdateOrchestrator {
    pub fn new(config: EngineConfig, downloader: Arc<dyn Downloader>) -> Result<Self> {
        config.validate()?;
        let state = load_state(&config.state_path, &config.initial_version)?;

        let executor = UpdateExecutor::new(
            &config.install_dir,
            config.manifest_path(),
            BackupStore::new(&config.backup_dir),
            ArtifactVerifier::new(config.limits()),
            config.keep_backups,
        );
        if let Err(e) = executor.cleanup_stale_staging() {
            warn!("Failed to clean up stale staging files: {e}");
        }

        info!(
            "Update engine ready: running {} from {}",
            state.current_version,
            config.install_dir.display()
        );
        Ok(Self {
            config,
            downloader,
            executor: Arc::new(executor),
            state: RwLock::new(state),
            persist: Mutex::new(()),
            pipeline: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn executor(&self) -> &UpdateExecutor {
        &self.executor
    }

    /// Last persisted state
    pub fn get_status(&self) -> UpdateState {
        self.state.read().clone()
    }

    /// Run executor work (file copies, hashing, lock waits) off the async
    /// worker threads
    async fn on_executor<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&UpdateExecutor) -> T + Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || work(&executor))
            .await
            .map_err(|e| UpdateError::Task(e.to_string()))
    }

    fn mutate_state<T>(&self, f: impl FnOnce(&mut UpdateState) -> T) -> Result<T> {
        let _persist = self.persist.lock();
        let (out, snapshot) = {
            let mut state = self.state.write();
            let out = f(&mut state);
            (out, state.clone())
        };
        save_state(&self.config.state_path, &snapshot)?;
        Ok(out)
    }

    /// Like `mutate_state`, for paths that are already returning another error
    fn mutate_state_or_log(&self, f: impl FnOnce(&mut UpdateState)) {
        if let Err(e) = self.mutate_state(f) {
            error!("Failed to persist update state: {e}");
        }
    }

    async fn fetch_manifest(&self, source: &ManifestSource) -> Result<Vec<u8>> {
        match source {
            ManifestSource::Url(url) => {
                let timeout = self.config.manifest_timeout();
                tokio::time::timeout(timeout, self.downloader.fetch_bytes(url))
                    .await
                    .map_err(|_| UpdateError::Timeout {
                        what: format!("manifest fetch from {url}"),
                        secs: timeout.as_secs(),
                    })?
            }
            ManifestSource::File(path) => file_source(path).await,
        }
    }

    /// Fetch and parse the manifest and compare it with the running release.
    /// The check time is recorded even when the check fails.
    pub async fn check_for_updates(&self, source: &ManifestSource) -> Result<UpdateCheck> {
        self.check(source, &Cancellation::new()).await
    }

    async fn check(&self, source: &ManifestSource, cancel: &Cancellation) -> Result<UpdateCheck> {
        debug!("Checking {source} for updates");
        let outcome = async {
            let raw = cancel.run(self.fetch_manifest(source)).await??;
            let manifest = UpdateManifest::parse(&raw)?;
            self.evaluate(manifest)
        }
        .await;

        let check_error = outcome.as_ref().err().map(ToString::to_string);
        if let Some(e) = &check_error {
            warn!("Update check against {source} failed: {e}");
        }
        self.mutate_state_or_log(|s| s.record_check(check_error));
        outcome
    }

    fn evaluate(&self, manifest: UpdateManifest) -> Result<UpdateCheck> {
        for item in &manifest.updates {
            self.executor.checked_destination(item.file_name())?;
        }

        let state = self.state.read();
        let current = Version::parse(&state.current_version)?;
        let target = manifest.version.to_string();

        let newer = manifest.version > current;
        let skipped =
            newer && state.should_skip_version(&target, self.config.max_consecutive_failures);
        let meets_min_version = manifest.min_version.as_ref().is_none_or(|min| current >= *min);

        if let Some(min) = manifest.min_version.as_ref().filter(|_| !meets_min_version) {
            warn!("Release {target} declares min_version {min}, running {current}");
        }
        if skipped {
            warn!(
                "Skipping {target}: failed {} times in a row",
                state.consecutive_failures
            );
        } else if newer {
            info!(
                "Update available: {current} -> {target}{}",
                if manifest.critical { " (critical)" } else { "" }
            );
        } else {
            debug!("Running {current}, manifest offers {target}: up to date");
        }

        Ok(UpdateCheck {
            available: newer && !skipped,
            critical: manifest.critical,
            meets_min_version,
            skipped,
            manifest,
        })
    }

    /// Fetch every artifact of `manifest` with bounded parallelism. The first
    /// failure aborts the batch and removes whatever was fetched.
    pub async fn download_updates(
        &self,
        manifest: &UpdateManifest,
        cancel: &Cancellation,
    ) -> Result<DownloadedBatch> {
        cancel.check()?;
        let dir = self.config.download_dir.join(manifest.version.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let timeout = self.config.download_timeout();
        let downloads = manifest.updates.iter().enumerate().map(|(index, item)| {
            let dest = dir.join(item.file_name());
            async move {
                let url = item.url.as_str();
                let fetch = self.downloader.fetch(url, &dest, Some(item.checksum.as_str()), None);
                let fetched = tokio::time::timeout(timeout, cancel.run(fetch))
                    .await
                    .map_err(|_| UpdateError::Timeout {
                        what: format!("download of {url}"),
                        secs: timeout.as_secs(),
                    })?;
                fetched??;

                debug!("Downloaded {} to {}", item.artifact_id(), dest.display());
                Ok::<_, UpdateError>((
                    index,
                    DownloadedItem {
                        item: item.clone(),
                        path: dest,
                    },
                ))
            }
        });

        let fetched: Result<Vec<_>> = futures_util::stream::iter(downloads)
            .buffer_unordered(self.config.download_concurrency)
            .try_collect()
            .await;

        match fetched {
            Ok(mut items) => {
                items.sort_by_key(|(index, _)| *index);
                info!(
                    "Downloaded {} artifact(s) of release {}",
                    items.len(),
                    manifest.version
                );
                Ok(DownloadedBatch {
                    manifest: manifest.clone(),
                    items: items.into_iter().map(|(_, item)| item).collect(),
                    dir,
                })
            }
            Err(e) => {
                warn!("Download of release {} failed: {e}", manifest.version);
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    warn!("Failed to remove {}: {cleanup}", dir.display());
                }
                Err(e)
            }
        }
    }

    /// Apply a downloaded batch. All items are committed before any is
    /// finalized, so with `auto_rollback` a failure reverts the whole batch.
    pub async fn apply_updates(
        &self,
        batch: &DownloadedBatch,
        auto_rollback: bool,
    ) -> Result<ApplyReport> {
        let _running = self.pipeline.lock().await;
        self.apply_batch(batch, auto_rollback, None).await
    }

    async fn apply_batch(
        &self,
        batch: &DownloadedBatch,
        auto_rollback: bool,
        cancel: Option<&Cancellation>,
    ) -> Result<ApplyReport> {
        let manifest = &batch.manifest;
        let target = manifest.version.to_string();
        let from_version = self.state.read().current_version.clone();

        if manifest.version <= Version::parse(&from_version)? {
            info!("Release {target} is not newer than {from_version}, nothing to apply");
            return Ok(ApplyReport {
                version: target,
                from_version,
                applied: Vec::new(),
                skipped: true,
            });
        }

        report_event(&UpdateEvent::UpdateStarted {
            from_version: from_version.clone(),
            to_version: target.clone(),
            artifacts: batch.items.len(),
        });
        let started = Instant::now();

        let mut pending = Vec::with_capacity(batch.items.len());
        let mut failure = None;
        for downloaded in &batch.items {
            if let Some(Err(e)) = cancel.map(Cancellation::check) {
                failure = Some(e);
                break;
            }
            let request = ApplyRequest::for_item(
                &downloaded.item,
                manifest,
                downloaded.path.clone(),
                &from_version,
            );
            let committed = self
                .on_executor(move |executor| executor.commit(&request))
                .await
                .and_then(|committed| committed);
            match committed {
                Ok(committed) => pending.push(committed),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(cause) = failure else {
            let applied = self
                .on_executor(move |executor| {
                    pending
                        .into_iter()
                        .map(|committed| executor.finalize(committed))
                        .collect::<Vec<_>>()
                })
                .await?;
            let limit = self.config.history_limit;
            self.mutate_state(|s| s.record_success(&target, limit))?;
            self.remove_batch_dir(batch);

            let duration_secs = started.elapsed().as_secs();
            report_event(&UpdateEvent::UpdateCompleted {
                from_version: from_version.clone(),
                to_version: target.clone(),
                duration_secs,
            });
            info!("Updated {from_version} -> {target} ({} artifact(s))", applied.len());
            return Ok(ApplyReport {
                version: target,
                from_version,
                applied,
                skipped: false,
            });
        };

        let cancelled = matches!(cause, UpdateError::Cancelled);
        let error = if auto_rollback || cancelled {
            self.revert_all(pending, cause).await
        } else {
            if !pending.is_empty() {
                warn!(
                    "Auto rollback disabled, leaving {} committed artifact(s) of {target} in place",
                    pending.len()
                );
            }
            let finalized = self
                .on_executor(move |executor| {
                    for committed in pending {
                        executor.finalize(committed);
                    }
                })
                .await;
            if let Err(e) = finalized {
                error!("Failed to finalize committed artifacts of {target}: {e}");
            }
            cause
        };
        self.remove_batch_dir(batch);

        if cancelled {
            info!("Update to {target} cancelled before commit");
            return Err(error);
        }

        let unrecoverable = error.severity() == Severity::Unrecoverable;
        let reason = error.reason();
        let limit = self.config.history_limit;
        self.mutate_state_or_log(|s| s.record_failure(&target, &reason, unrecoverable, limit));
        report_event(&UpdateEvent::UpdateFailed {
            from_version,
            to_version: target.clone(),
            error: reason.clone(),
            unrecoverable,
        });

        if unrecoverable {
            error!("Update to {target} failed and could not be rolled back: {reason}");
        } else {
            error!("Update to {target} failed: {reason}");
        }
        Err(error)
    }

    /// Revert committed items newest first. The failing item was already
    /// rolled back by the executor.
    async fn revert_all(&self, pending: Vec<PendingCommit>, cause: UpdateError) -> UpdateError {
        if pending.is_empty() {
            return cause;
        }

        report_event(&UpdateEvent::RollbackStarted {
            from_version: self.state.read().current_version.clone(),
            to_version: None,
        });

        let reverted = self
            .on_executor(move |executor| {
                let mut failures = Vec::new();
                for committed in pending.into_iter().rev() {
                    let id = committed.artifact().artifact_id.clone();
                    if let Err(reason) = executor.revert(committed) {
                        error!("Failed to revert {id}: {reason}");
                        failures.push(reason);
                    }
                }
                failures
            })
            .await;
        let failures = reverted.unwrap_or_else(|e| vec![e.to_string()]);

        if failures.is_empty() {
            report_event(&UpdateEvent::RollbackCompleted {
                restored_version: self.state.read().current_version.clone(),
            });
            return cause;
        }

        let reason = failures.join("; ");
        report_event(&UpdateEvent::RollbackFailed {
            error: reason.clone(),
        });
        match cause {
            UpdateError::RollbackFailed {
                cause: inner,
                reason: first,
            } => UpdateError::RollbackFailed {
                cause: inner,
                reason: format!("{first}; {reason}"),
            },
            cause => UpdateError::RollbackFailed {
                cause: Some(Box::new(cause)),
                reason,
            },
        }
    }

    fn remove_batch_dir(&self, batch: &DownloadedBatch) {
        if !batch.dir.starts_with(&self.config.download_dir) {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&batch.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {e}", batch.dir.display());
            }
        }
    }

    /// Restore the artifacts of an earlier release from backups: the one
    /// live before the last update, or `to_version`
    pub async fn rollback(&self, to_version: Option<&str>) -> Result<RollbackReport> {
        let _running = self.pipeline.lock().await;

        let target = to_version.map(Version::parse).transpose()?;
        let from_version = self.state.read().current_version.clone();
        report_event(&UpdateEvent::RollbackStarted {
            from_version: from_version.clone(),
            to_version: target.as_ref().map(ToString::to_string),
        });

        let wanted = target.clone();
        let restored = self
            .on_executor(move |executor| executor.restore_release(wanted.as_ref()))
            .await
            .and_then(|restored| restored);
        match restored {
            Ok(restored) => {
                let limit = self.config.history_limit;
                self.mutate_state(|s| s.record_rollback(&restored.version, limit))?;
                report_event(&UpdateEvent::RollbackCompleted {
                    restored_version: restored.version.clone(),
                });
                info!("Rolled back {from_version} -> {}", restored.version);
                Ok(RollbackReport {
                    from_version,
                    restored_version: restored.version,
                    artifacts: restored.artifacts,
                })
            }
            Err(e) => {
                report_event(&UpdateEvent::RollbackFailed {
                    error: e.reason(),
                });
                if e.severity() == Severity::Unrecoverable {
                    let version = target.map_or_else(|| "previous".to_string(), |v| v.to_string());
                    let limit = self.config.history_limit;
                    let reason = e.reason();
                    self.mutate_state_or_log(|s| s.record_failure(&version, &reason, true, limit));
                }
                error!("Rollback from {from_version} failed: {e}");
                Err(e)
            }
        }
    }

    /// Check, download and apply in one go. Returns `None` when there is
    /// nothing to do.
    pub async fn run_update(
        &self,
        source: &ManifestSource,
        cancel: &Cancellation,
    ) -> Result<Option<ApplyReport>> {
        let _running = self.pipeline.lock().await;

        let check = self.check(source, cancel).await?;
        if !check.available {
            return Ok(None);
        }
        if check.critical {
            info!("Release {} is critical, applying now", check.manifest.version);
        }

        let batch = match self.download_updates(&check.manifest, cancel).await {
            Ok(batch) => batch,
            Err(e) => {
                if !matches!(e, UpdateError::Cancelled) {
                    let target = check.manifest.version.to_string();
                    let reason = e.reason();
                    let limit = self.config.history_limit;
                    self.mutate_state_or_log(|s| s.record_failure(&target, &reason, false, limit));
                }
                return Err(e);
            }
        };

        self.apply_batch(&batch, self.config.auto_rollback, Some(cancel))
            .await
            .map(Some)
    }

    /// Drop backups older than `backup_max_age_hours`
    pub fn cleanup_backups(&self) -> Result<usize> {
        let removed = self
            .executor
            .backups()
            .prune_expired(self.config.backup_max_age())?;
        if removed > 0 {
            info!("Removed {removed} expired backup(s)");
        }
        Ok(removed)
    }
}
