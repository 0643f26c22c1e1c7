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

//! Engine configuration

use crate::atomic::write_atomic;
use crate::error::{Result, UpdateError};
use crate::verifier::ArtifactLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/data/ota/updater_config.json";

fn default_install_dir() -> PathBuf {
    PathBuf::from("/data/ota/artifacts")
}

fn default_manifest_file() -> String {
    "manifest.json".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/data/ota/backups")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/data/ota/downloads")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/data/ota/update_state.json")
}

fn default_min_artifact_bytes() -> u64 {
    4096
}

fn default_max_artifact_bytes() -> u64 {
    32 * 1024 * 1024 * 1024
}

fn default_download_concurrency() -> usize {
    4
}

fn default_1800() -> u64 {
    1800
}

fn default_30() -> u64 {
    30
}

fn default_keep_backups() -> usize {
    2
}

fn default_168() -> u64 {
    168
}

fn default_history_limit() -> usize {
    50
}

fn default_3() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_3600() -> u64 {
    3600
}

fn default_initial_version() -> String {
    "0.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the live artifacts
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Installed-artifact manifest, relative to `install_dir`
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Where the daemon and `check` fetch the release manifest from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,

    #[serde(default = "default_min_artifact_bytes")]
    pub min_artifact_bytes: u64,

    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Parallel artifact downloads per manifest
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,

    /// Per artifact download timeout (seconds)
    #[serde(default = "default_1800")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_30")]
    pub manifest_timeout_secs: u64,

    /// Backups kept per artifact after a successful update
    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,

    #[serde(default = "default_168")]
    pub backup_max_age_hours: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Skip a release after this many failures in a row
    #[serde(default = "default_3")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_true")]
    pub auto_rollback: bool,

    /// Let the daemon apply updates it finds
    #[serde(default)]
    pub auto_update: bool,

    #[serde(default = "default_3600")]
    pub check_interval_secs: u64,

    /// Version assumed when no state file exists yet
    #[serde(default = "default_initial_version")]
    pub initial_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            manifest_file: default_manifest_file(),
            backup_dir: default_backup_dir(),
            download_dir: default_download_dir(),
            state_path: default_state_path(),
            manifest_url: None,
            min_artifact_bytes: default_min_artifact_bytes(),
            max_artifact_bytes: default_max_artifact_bytes(),
            download_concurrency: default_download_concurrency(),
            download_timeout_secs: 1800,
            manifest_timeout_secs: 30,
            keep_backups: default_keep_backups(),
            backup_max_age_hours: 168,
            history_limit: default_history_limit(),
            max_consecutive_failures: 3,
            auto_rollback: true,
            auto_update: false,
            check_interval_secs: 3600,
            initial_version: default_initial_version(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at `root`, handy for tests and local runs
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            install_dir: root.join("artifacts"),
            backup_dir: root.join("backups"),
            download_dir: root.join("downloads"),
            state_path: root.join("update_state.json"),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_artifact_bytes > self.max_artifact_bytes {
            return Err(UpdateError::Config(format!(
                "min_artifact_bytes ({}) exceeds max_artifact_bytes ({})",
                self.min_artifact_bytes, self.max_artifact_bytes
            )));
        }
        if self.download_concurrency == 0 {
            return Err(UpdateError::Config(
                "download_concurrency must be at least 1".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(UpdateError::Config(
                "history_limit must be at least 1".to_string(),
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(UpdateError::Config(
                "check_interval_secs must be at least 1".to_string(),
            ));
        }
        crate::version::Version::parse(&self.initial_version)
            .map_err(|e| UpdateError::Config(format!("initial_version: {e}")))?;
        Ok(())
    }

    pub fn limits(&self) -> ArtifactLimits {
        ArtifactLimits {
            min_bytes: self.min_artifact_bytes,
            max_bytes: self.max_artifact_bytes,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.install_dir.join(&self.manifest_file)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    pub fn backup_max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.backup_max_age_hours).unwrap_or(i64::MAX / 3600))
    }
}

/// Load the config file, writing defaults to it if it does not exist yet
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| UpdateError::Config(format!("Failed to parse config: {e}")))
    } else {
        let config = EngineConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &EngineConfig) -> Result<()> {
    let content = serde_json::to_vec_pretty(config)?;
    write_atomic(path, &content)?;
    Ok(())
}
