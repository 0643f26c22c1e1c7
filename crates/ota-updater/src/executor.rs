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

//! Atomic apply state machine
//!
//! ```text
//! Idle -> Staging -> Verifying -> Committing -> Finalized
//!                        |             |
//!                        +-> Idle      +-> RollingBack -> Idle
//! ```
//!
//! The candidate is copied into a temp file inside the install directory,
//! verified there, and made live with a single rename. A backup of the live
//! artifact and manifest is taken before the rename; any failure after that
//! point restores it. The executor is the only writer of the install
//! directory and its manifest.

use crate::atomic::{self, remove_stale_temps};
use crate::backup::{BackupRecord, BackupStore};
use crate::error::{Result, UpdateError};
use crate::installed::{ArtifactUpdate, InstalledManifest};
use crate::manifest::{UpdateItem, UpdateManifest};
use crate::verifier::{ArtifactVerifier, FormatProfile};
use crate::version::Version;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Backup version of an artifact that was not installed yet
const NO_VERSION: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Idle,
    Staging,
    Verifying,
    Committing,
    Finalized,
    RollingBack,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyMetadata {
    pub name: String,
    /// Version the artifact is being updated to
    pub version: String,
    /// Release that is live before this apply
    pub release_version: Option<String>,
    pub source_url: Option<String>,
    pub quantization: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub candidate: PathBuf,
    pub artifact_id: String,
    pub file_name: String,
    pub expected_checksum: Option<String>,
    pub declared_size: Option<u64>,
    pub profile: FormatProfile,
    pub metadata: ApplyMetadata,
}

impl ApplyRequest {
    pub fn for_item(
        item: &UpdateItem,
        manifest: &UpdateManifest,
        candidate: PathBuf,
        current_release: &str,
    ) -> Self {
        let name = Path::new(item.file_name())
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(item.file_name())
            .to_string();

        Self {
            candidate,
            artifact_id: item.artifact_id(),
            file_name: item.file_name().to_string(),
            expected_checksum: Some(item.checksum.clone()),
            declared_size: item.size,
            profile: item.profile,
            metadata: ApplyMetadata {
                name,
                version: manifest.version.to_string(),
                release_version: Some(current_release.to_string()),
                source_url: Some(item.url.clone()),
                quantization: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedArtifact {
    pub artifact_id: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub previous_version: Option<String>,
}

/// A committed artifact whose backup is still held. Must be finalized or
/// reverted; the per-artifact commit lock is held until then.
#[derive(Debug)]
#[must_use = "a pending commit must be finalized or reverted"]
pub struct PendingCommit {
    applied: AppliedArtifact,
    backup: BackupRecord,
    _guard: CommitGuard,
}

impl PendingCommit {
    pub fn artifact(&self) -> &AppliedArtifact {
        &self.applied
    }

    pub fn backup(&self) -> &BackupRecord {
        &self.backup
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredRelease {
    pub version: String,
    /// `(artifact id, restored artifact version)`, most recent backup first
    pub artifacts: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct CommitLocks {
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

impl CommitLocks {
    fn acquire(self: &Arc<Self>, artifact_id: &str) -> CommitGuard {
        let mut busy = self.busy.lock();
        while busy.contains(artifact_id) {
            debug!("Waiting for in-flight commit of {artifact_id}");
            self.released.wait(&mut busy);
        }
        busy.insert(artifact_id.to_string());
        CommitGuard {
            locks: Arc::clone(self),
            artifact_id: artifact_id.to_string(),
        }
    }
}

#[derive(Debug)]
struct CommitGuard {
    locks: Arc<CommitLocks>,
    artifact_id: String,
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        self.locks.busy.lock().remove(&self.artifact_id);
        self.locks.released.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailPoint {
    BeforeRename,
    AfterRename,
    /// Fail after the rename with the backup store wiped
    #[cfg(test)]
    BackupLost,
}

#[derive(Debug)]
pub struct UpdateExecutor {
    install_dir: PathBuf,
    manifest_path: PathBuf,
    backups: BackupStore,
    verifier: ArtifactVerifier,
    keep_backups: usize,
    locks: Arc<CommitLocks>,
    #[cfg(test)]
    fail_point: Mutex<Option<FailPoint>>,
}

impl UpdateExecutor {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        backups: BackupStore,
        verifier: ArtifactVerifier,
        keep_backups: usize,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            manifest_path: manifest_path.into(),
            backups,
            verifier,
            keep_backups,
            locks: Arc::default(),
            #[cfg(test)]
            fail_point: Mutex::new(None),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn destination(&self, file_name: &str) -> PathBuf {
        self.install_dir.join(file_name)
    }

    /// Destination of an artifact file, refusing names that would land on
    /// the installed manifest or in the staging namespace
    pub fn checked_destination(&self, file_name: &str) -> Result<PathBuf> {
        let path = self.destination(file_name);
        if path == self.manifest_path || file_name.starts_with(atomic::TEMP_PREFIX) {
            return Err(UpdateError::InvalidManifest(format!(
                "file name {file_name:?} is reserved in {}",
                self.install_dir.display()
            )));
        }
        Ok(path)
    }

    /// Remove staging files left by a previous process that died mid-apply
    pub fn cleanup_stale_staging(&self) -> Result<usize> {
        let mut removed = remove_stale_temps(&self.install_dir)?;
        let manifest_dir = atomic::parent_dir(&self.manifest_path);
        if manifest_dir != self.install_dir {
            removed += remove_stale_temps(manifest_dir)?;
        }
        if removed > 0 {
            warn!("Removed {removed} stale staging file(s)");
        }
        Ok(removed)
    }

    fn transition(artifact_id: &str, phase: ApplyPhase) {
        debug!("{artifact_id}: {phase:?}");
    }

    /// Stage, verify and commit. The backup is kept until [`Self::finalize`]
    /// or [`Self::revert`].
    pub fn commit(&self, request: &ApplyRequest) -> Result<PendingCommit> {
        let id = request.artifact_id.as_str();
        let destination = self.checked_destination(&request.file_name)?;
        let guard = self.locks.acquire(id);

        Self::transition(id, ApplyPhase::Staging);
        let staged = self.stage(request)?;

        Self::transition(id, ApplyPhase::Verifying);
        let verification = self.verifier.verify(
            staged.path(),
            request.profile,
            request.declared_size,
            request.expected_checksum.as_deref(),
        )?;
        if !verification.valid {
            Self::transition(id, ApplyPhase::Idle);
            return Err(verification.into_error(id));
        }

        Self::transition(id, ApplyPhase::Committing);
        let commit_failed = |source: io::Error| UpdateError::CommitFailed {
            artifact_id: id.to_string(),
            source,
        };

        let installed = InstalledManifest::load(&self.manifest_path).map_err(commit_failed)?;
        let previous_version = installed.version_of(id).map(str::to_string);

        let backup = self
            .backups
            .snapshot(
                &destination,
                &self.manifest_path,
                id,
                previous_version.as_deref().unwrap_or(NO_VERSION),
                request.metadata.release_version.as_deref(),
            )
            .map_err(|e| match e {
                UpdateError::State(source) => commit_failed(source),
                other => other,
            })?;

        let applied = AppliedArtifact {
            artifact_id: id.to_string(),
            path: destination,
            sha256: verification.observed_checksum,
            size: verification.observed_size,
            previous_version,
        };

        if let Err(source) = self.swap_in(staged, installed, request, &applied) {
            return Err(self.roll_back(&backup, commit_failed(source)));
        }

        info!(
            "Committed {id}: {} -> {}",
            applied.previous_version.as_deref().unwrap_or(NO_VERSION),
            request.metadata.version
        );
        Ok(PendingCommit {
            applied,
            backup,
            _guard: guard,
        })
    }

    /// Drop the backup (or keep it within retention) and release the lock
    pub fn finalize(&self, pending: PendingCommit) -> AppliedArtifact {
        let PendingCommit {
            applied,
            backup,
            _guard,
        } = pending;
        let id = applied.artifact_id.as_str();

        let cleanup = if self.keep_backups == 0 {
            self.backups.remove(&backup)
        } else {
            self.backups.prune(id, self.keep_backups).map(|_| ())
        };
        if let Err(e) = cleanup {
            warn!("Failed to clean up backups of {id}: {e}");
        }

        Self::transition(id, ApplyPhase::Finalized);
        applied
    }

    /// Undo a commit that was never finalized
    pub fn revert(&self, pending: PendingCommit) -> std::result::Result<(), String> {
        let PendingCommit { backup, _guard, .. } = pending;
        Self::transition(&backup.label, ApplyPhase::RollingBack);
        self.restore_backup(&backup)
    }

    /// Commit and finalize in one step
    pub fn apply(&self, request: &ApplyRequest) -> Result<AppliedArtifact> {
        let pending = self.commit(request)?;
        Ok(self.finalize(pending))
    }

    fn stage(&self, request: &ApplyRequest) -> Result<NamedTempFile> {
        if !request.candidate.is_file() {
            return Err(UpdateError::ArtifactNotFound(request.candidate.clone()));
        }

        let staging_failed = |source: io::Error| UpdateError::StagingFailed {
            artifact_id: request.artifact_id.clone(),
            source,
        };

        fs::create_dir_all(&self.install_dir).map_err(staging_failed)?;
        let mut staged = atomic::temp_in(&self.install_dir, "staging").map_err(staging_failed)?;
        copy_into(&request.candidate, &mut staged).map_err(staging_failed)?;

        debug!(
            "Staged {} at {}",
            request.candidate.display(),
            staged.path().display()
        );
        Ok(staged)
    }

    fn swap_in(
        &self,
        staged: NamedTempFile,
        mut installed: InstalledManifest,
        request: &ApplyRequest,
        applied: &AppliedArtifact,
    ) -> io::Result<()> {
        self.fail_at(FailPoint::BeforeRename)?;
        staged.persist(&applied.path).map_err(|e| e.error)?;
        self.fail_at(FailPoint::AfterRename)?;

        installed.record_update(
            &request.artifact_id,
            &ArtifactUpdate {
                name: &request.metadata.name,
                version: &request.metadata.version,
                format: request.profile.name(),
                filename: &request.file_name,
                size: applied.size,
                sha256: &applied.sha256,
                url: request.metadata.source_url.as_deref(),
                quantization: request.metadata.quantization.as_deref(),
            },
        );
        installed.save(&self.manifest_path)
    }

    fn roll_back(&self, backup: &BackupRecord, cause: UpdateError) -> UpdateError {
        Self::transition(&backup.label, ApplyPhase::RollingBack);
        warn!("Rolling back {} after: {cause}", backup.label);

        match self.restore_backup(backup) {
            Ok(()) => cause,
            Err(reason) => UpdateError::RollbackFailed {
                cause: Some(Box::new(cause)),
                reason,
            },
        }
    }

    fn restore_backup(&self, backup: &BackupRecord) -> std::result::Result<(), String> {
        if let Err(e) = self.backups.restore(backup) {
            error!(
                "Rollback of {} failed, backup {} kept for manual recovery: {e}",
                backup.label, backup.id
            );
            return Err(format!(
                "restoring {} from backup {}: {e}",
                backup.label, backup.id
            ));
        }

        if let Err(e) = self.backups.remove(backup) {
            warn!("Restored {} but could not remove backup {}: {e}", backup.label, backup.id);
        }
        Self::transition(&backup.label, ApplyPhase::Idle);
        info!("Rollback of {} completed", backup.label);
        Ok(())
    }

    /// Bring back the artifacts that were live while `target` was the
    /// running release (the newest backed-up release when `None`).
    ///
    /// For each artifact the oldest backup taken at or after `target` holds
    /// its bytes from that release, or records that it did not exist yet.
    /// Artifacts whose only backups predate `target` were not touched since
    /// and stay as they are.
    pub fn restore_release(&self, target: Option<&Version>) -> Result<RestoredRelease> {
        let records = self.backups.list(None)?;
        let release_of = |r: &BackupRecord| {
            r.release_version
                .as_deref()
                .and_then(|v| Version::parse(v).ok())
        };

        let release = match target {
            Some(v) => v.clone(),
            None => records
                .iter()
                .find_map(release_of)
                .ok_or_else(|| UpdateError::NoBackup("no backups recorded".to_string()))?,
        };
        if !records.iter().any(|r| release_of(r).as_ref() == Some(&release)) {
            return Err(UpdateError::NoBackup(format!(
                "no backup of release {release}"
            )));
        }

        // Oldest first, so the first hit per label is the earliest one
        let mut chosen: Vec<&BackupRecord> = Vec::new();
        let mut labels = HashSet::new();
        for record in records.iter().rev() {
            if release_of(record).is_some_and(|v| v >= release)
                && labels.insert(record.label.as_str())
            {
                chosen.push(record);
            }
        }

        // A pruned history can leave only backups of bytes newer than the
        // target, which cannot reproduce it
        for record in &chosen {
            let from_target = record.version == NO_VERSION
                || Version::parse(&record.version).is_ok_and(|v| v <= release);
            if !from_target {
                return Err(UpdateError::NoBackup(format!(
                    "{} has no backup from release {release} (oldest holds {})",
                    record.label, record.version
                )));
            }
        }

        // Newest first: each restore also writes the manifest snapshot, and
        // the oldest one describes the target release
        chosen.reverse();
        let mut artifacts = Vec::with_capacity(chosen.len());
        for record in &chosen {
            let _guard = self.locks.acquire(&record.label);
            self.backups
                .restore(record)
                .map_err(|e| UpdateError::RollbackFailed {
                    cause: None,
                    reason: format!("restoring {} from backup {}: {e}", record.label, record.id),
                })?;
            artifacts.push((record.label.clone(), record.version.clone()));
        }

        // Backups at or after the restored ones describe states that are gone
        let mut passed = HashSet::new();
        for record in &records {
            let Some(restored) = chosen.iter().find(|c| c.label == record.label) else {
                continue;
            };
            if passed.contains(record.label.as_str()) {
                continue;
            }
            if record.id == restored.id {
                passed.insert(record.label.as_str());
            }
            if let Err(e) = self.backups.remove(record) {
                warn!("Failed to remove superseded backup {}: {e}", record.id);
            }
        }

        info!("Restored release {release} ({} artifact(s))", artifacts.len());
        Ok(RestoredRelease {
            version: release.to_string(),
            artifacts,
        })
    }

    #[cfg(test)]
    fn fail_at(&self, point: FailPoint) -> io::Result<()> {
        let armed = *self.fail_point.lock();
        if armed == Some(FailPoint::BackupLost) && point == FailPoint::AfterRename {
            fs::remove_dir_all(self.backups.root())?;
            return Err(io::Error::other("injected failure with backups lost"));
        }
        if armed == Some(point) {
            return Err(io::Error::other(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[expect(clippy::unused_self, clippy::unnecessary_wraps)]
    fn fail_at(&self, _point: FailPoint) -> io::Result<()> {
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_fail_point(&self, point: Option<FailPoint>) {
        *self.fail_point.lock() = point;
    }
}

fn copy_into(src: &Path, staged: &mut NamedTempFile) -> io::Result<()> {
    io::copy(&mut fs::File::open(src)?, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    fs::set_permissions(staged.path(), fs::metadata(src)?.permissions())
}
