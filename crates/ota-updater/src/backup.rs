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

//! Backup module for pre-update snapshots
//!
//! Layout: `<root>/<label>/<backup id>/{artifact, manifest.json, record.json}`.
//! A record remembers whether the artifact and manifest existed at snapshot
//! time, so restoring reproduces absence as well as content.

use crate::atomic::{copy_atomic, write_atomic};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const RECORD_FILE: &str = "record.json";
const ARTIFACT_FILE: &str = "artifact";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    /// Logical artifact the backup belongs to (the artifact id)
    pub label: String,
    /// Version of the artifact being replaced
    pub version: String,
    /// Release that was current when the snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_version: Option<String>,
    pub artifact_path: PathBuf,
    pub manifest_path: PathBuf,
    pub artifact_backup_path: Option<PathBuf>,
    pub manifest_backup_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn dir(&self) -> Option<&Path> {
        self.artifact_backup_path
            .as_deref()
            .or(self.manifest_backup_path.as_deref())
            .and_then(Path::parent)
    }
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn label_dir(&self, label: &str) -> PathBuf {
        let safe: String = label
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if safe.chars().all(|c| c == '.') {
            return self.root.join(format!("_{safe}"));
        }
        self.root.join(safe)
    }

    /// Copy the live artifact and manifest aside before anything destructive
    pub fn snapshot(
        &self,
        artifact_path: &Path,
        manifest_path: &Path,
        label: &str,
        version: &str,
        release_version: Option<&str>,
    ) -> Result<BackupRecord> {
        let created_at = Utc::now();
        let label_dir = self.label_dir(label);
        fs::create_dir_all(&label_dir)?;

        let stamp = created_at.format("%Y%m%dT%H%M%S%.9fZ").to_string();
        let mut id = stamp.clone();
        let mut n = 1;
        while label_dir.join(&id).exists() {
            id = format!("{stamp}-{n}");
            n += 1;
        }
        let dir = label_dir.join(&id);
        fs::create_dir(&dir)?;

        let record = match Self::fill(&dir, artifact_path, manifest_path) {
            Ok((artifact_backup_path, manifest_backup_path)) => BackupRecord {
                id,
                label: label.to_string(),
                version: version.to_string(),
                release_version: release_version.map(str::to_string),
                artifact_path: artifact_path.to_path_buf(),
                manifest_path: manifest_path.to_path_buf(),
                artifact_backup_path,
                manifest_backup_path,
                created_at,
            },
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e.into());
            }
        };

        if let Err(e) = write_atomic(&dir.join(RECORD_FILE), &serde_json::to_vec_pretty(&record)?) {
            let _ = fs::remove_dir_all(&dir);
            return Err(e.into());
        }

        tracing::info!(
            "Created backup {} of {label} (version {version}) at {}",
            record.id,
            dir.display()
        );
        Ok(record)
    }

    fn fill(
        dir: &Path,
        artifact_path: &Path,
        manifest_path: &Path,
    ) -> io::Result<(Option<PathBuf>, Option<PathBuf>)> {
        let artifact = if artifact_path.is_file() {
            let dst = dir.join(ARTIFACT_FILE);
            fs::copy(artifact_path, &dst)?;
            Some(dst)
        } else {
            None
        };

        let manifest = if manifest_path.is_file() {
            let dst = dir.join(MANIFEST_FILE);
            fs::copy(manifest_path, &dst)?;
            Some(dst)
        } else {
            None
        };

        fs::File::open(dir)?.sync_all()?;
        Ok((artifact, manifest))
    }

    /// Put the artifact and manifest back exactly as they were at snapshot time
    pub fn restore(&self, record: &BackupRecord) -> io::Result<()> {
        restore_file(record.artifact_backup_path.as_deref(), &record.artifact_path)?;
        restore_file(record.manifest_backup_path.as_deref(), &record.manifest_path)?;
        tracing::info!("Restored {} from backup {}", record.label, record.id);
        Ok(())
    }

    /// Backups newest first, optionally for one label only
    pub fn list(&self, label: Option<&str>) -> Result<Vec<BackupRecord>> {
        let label_dirs = match label {
            Some(label) => vec![self.label_dir(label)],
            None => {
                if !self.root.exists() {
                    return Ok(Vec::new());
                }
                let mut dirs = Vec::new();
                for entry in fs::read_dir(&self.root)? {
                    let entry = entry?;
                    if entry.file_type()?.is_dir() {
                        dirs.push(entry.path());
                    }
                }
                dirs
            }
        };

        let mut records = Vec::new();
        for label_dir in label_dirs {
            if !label_dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&label_dir)? {
                let record_path = entry?.path().join(RECORD_FILE);
                if !record_path.is_file() {
                    continue;
                }
                match serde_json::from_slice::<BackupRecord>(&fs::read(&record_path)?) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping unreadable backup {}: {e}", record_path.display()),
                }
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    pub fn remove(&self, record: &BackupRecord) -> Result<()> {
        let dir = self.label_dir(&record.label).join(&record.id);
        if dir.exists() {
            tracing::info!("Removing backup at {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Keep the `keep` newest backups of `label`, returns how many were removed
    pub fn prune(&self, label: &str, keep: usize) -> Result<usize> {
        let records = self.list(Some(label))?;
        let mut removed = 0;
        for record in records.iter().skip(keep) {
            self.remove(record)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove every backup older than `max_age`
    pub fn prune_expired(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        for record in self.list(None)? {
            if is_backup_expired(&record, max_age) {
                self.remove(&record)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn is_backup_expired(record: &BackupRecord, max_age: Duration) -> bool {
    Utc::now().signed_duration_since(record.created_at) >= max_age
}

fn restore_file(backup: Option<&Path>, target: &Path) -> io::Result<()> {
    match backup {
        Some(src) => copy_atomic(src, target),
        None => match fs::remove_file(target) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: BackupStore,
        artifact: PathBuf,
        manifest: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        fs::create_dir_all(&live).unwrap();
        Fixture {
            store: BackupStore::new(dir.path().join("backups")),
            artifact: live.join("yolov8.rknn"),
            manifest: live.join("manifest.json"),
            _dir: dir,
        }
    }

    #[test]
    fn test_snapshot_and_restore() {
        let f = fixture();
        fs::write(&f.artifact, b"old model").unwrap();
        fs::write(&f.manifest, b"{\"old\":true}").unwrap();

        let record = f
            .store
            .snapshot(&f.artifact, &f.manifest, "model-yolov8", "1.0.0", Some("1.0.0"))
            .unwrap();
        assert!(record.artifact_backup_path.is_some());
        assert!(record.manifest_backup_path.is_some());

        fs::write(&f.artifact, b"new model").unwrap();
        fs::write(&f.manifest, b"{\"new\":true}").unwrap();

        f.store.restore(&record).unwrap();
        assert_eq!(fs::read(&f.artifact).unwrap(), b"old model");
        assert_eq!(fs::read(&f.manifest).unwrap(), b"{\"old\":true}");
    }

    #[test]
    fn test_restore_reproduces_absence() {
        let f = fixture();
        let record = f
            .store
            .snapshot(&f.artifact, &f.manifest, "model-yolov8", "none", None)
            .unwrap();
        assert!(record.artifact_backup_path.is_none());

        fs::write(&f.artifact, b"first install").unwrap();
        fs::write(&f.manifest, b"{}").unwrap();

        f.store.restore(&record).unwrap();
        assert!(!f.artifact.exists());
        assert!(!f.manifest.exists());
    }

    #[test]
    fn test_list_newest_first_and_prune() {
        let f = fixture();
        fs::write(&f.artifact, b"v").unwrap();

        let versions = ["1.0.0", "1.1.0", "1.2.0"];
        for version in versions {
            f.store
                .snapshot(&f.artifact, &f.manifest, "model-yolov8", version, None)
                .unwrap();
        }
        f.store
            .snapshot(&f.artifact, &f.manifest, "kernel-npu", "0.1.0", None)
            .unwrap();

        let listed: Vec<String> = f
            .store
            .list(Some("model-yolov8"))
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(listed, vec!["1.2.0", "1.1.0", "1.0.0"]);
        assert_eq!(f.store.list(None).unwrap().len(), 4);

        assert_eq!(f.store.prune("model-yolov8", 1).unwrap(), 2);
        let remaining = f.store.list(Some("model-yolov8")).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version, "1.2.0");
        assert_eq!(f.store.list(Some("kernel-npu")).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_expired() {
        let f = fixture();
        fs::write(&f.artifact, b"v").unwrap();
        let record = f
            .store
            .snapshot(&f.artifact, &f.manifest, "model-yolov8", "1.0.0", None)
            .unwrap();

        assert!(!is_backup_expired(&record, Duration::hours(24)));
        assert_eq!(f.store.prune_expired(Duration::hours(24)).unwrap(), 0);
        assert_eq!(f.store.prune_expired(Duration::zero()).unwrap(), 1);
        assert!(f.store.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_is_backup_expired() {
        let now = Utc::now();
        let mut record = BackupRecord {
            id: "x".to_string(),
            label: "model-yolov8".to_string(),
            version: "0.2.38".to_string(),
            release_version: None,
            artifact_path: PathBuf::from("/tmp/a"),
            manifest_path: PathBuf::from("/tmp/m"),
            artifact_backup_path: None,
            manifest_backup_path: None,
            created_at: now - Duration::hours(12),
        };
        assert!(!is_backup_expired(&record, Duration::hours(24)));

        record.created_at = now - Duration::hours(25);
        assert!(is_backup_expired(&record, Duration::hours(24)));
    }

    #[test]
    fn test_label_is_sanitized() {
        let f = fixture();
        fs::write(&f.artifact, b"v").unwrap();
        let record = f
            .store
            .snapshot(&f.artifact, &f.manifest, "../escape", "1.0.0", None)
            .unwrap();
        assert!(record.dir().unwrap().starts_with(f.store.root()));
    }
}
