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

//! Persisted update state

use crate::atomic::write_atomic;
use crate::error::{Result, UpdateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub from_version: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub from_version: String,
    pub error: String,

    /// Rollback itself failed; needs an operator
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unrecoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    /// Release currently live on this host
    pub current_version: String,

    /// Last time we checked for updates, successful or not
    pub last_check_time: Option<DateTime<Utc>>,

    /// Last successful update or rollback
    pub last_update_time: Option<DateTime<Utc>>,

    pub last_update_version: Option<String>,

    #[serde(default)]
    pub update_history: Vec<HistoryEntry>,

    #[serde(default)]
    pub failed_updates: Vec<FailureEntry>,

    /// Number of consecutive failures of `failed_version`
    #[serde(default)]
    pub consecutive_failures: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_version: Option<String>,

    /// Why the last check failed, cleared by the next successful one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_error: Option<String>,
}

impl UpdateState {
    pub fn new(initial_version: impl Into<String>) -> Self {
        Self {
            current_version: initial_version.into(),
            last_check_time: None,
            last_update_time: None,
            last_update_version: None,
            update_history: Vec::new(),
            failed_updates: Vec::new(),
            consecutive_failures: 0,
            failed_version: None,
            last_check_error: None,
        }
    }

    pub fn record_check(&mut self, error: Option<String>) {
        self.last_check_time = Some(Utc::now());
        self.last_check_error = error;
    }

    pub fn record_success(&mut self, version: &str, limit: usize) {
        let now = Utc::now();
        let from_version = std::mem::replace(&mut self.current_version, version.to_string());
        self.last_update_time = Some(now);
        self.last_update_version = Some(version.to_string());
        self.consecutive_failures = 0;
        self.failed_version = None;

        push_bounded(
            &mut self.update_history,
            HistoryEntry {
                version: version.to_string(),
                timestamp: now,
                from_version,
                success: true,
            },
            limit,
        );
    }

    pub fn record_failure(&mut self, version: &str, error: &str, unrecoverable: bool, limit: usize) {
        if self.failed_version.as_deref() == Some(version) {
            self.consecutive_failures += 1;
        } else {
            self.failed_version = Some(version.to_string());
            self.consecutive_failures = 1;
        }

        push_bounded(
            &mut self.failed_updates,
            FailureEntry {
                version: version.to_string(),
                timestamp: Utc::now(),
                from_version: self.current_version.clone(),
                error: error.to_string(),
                unrecoverable,
            },
            limit,
        );
    }

    /// Manual rollback to `version`; kept in the history as a non-forward step
    pub fn record_rollback(&mut self, version: &str, limit: usize) {
        let now = Utc::now();
        let from_version = std::mem::replace(&mut self.current_version, version.to_string());
        self.last_update_time = Some(now);
        self.last_update_version = Some(version.to_string());

        push_bounded(
            &mut self.update_history,
            HistoryEntry {
                version: version.to_string(),
                timestamp: now,
                from_version,
                success: false,
            },
            limit,
        );
    }

    /// A version that failed `max_failures` times in a row is not retried
    pub fn should_skip_version(&self, version: &str, max_failures: u32) -> bool {
        max_failures > 0
            && self.failed_version.as_deref() == Some(version)
            && self.consecutive_failures >= max_failures
    }
}

fn push_bounded<T>(list: &mut Vec<T>, entry: T, limit: usize) {
    list.push(entry);
    if list.len() > limit {
        let excess = list.len() - limit;
        list.drain(..excess);
    }
}

/// Load the state file, creating it with `initial_version` if missing
pub fn load_state(path: &Path, initial_version: &str) -> Result<UpdateState> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            UpdateError::State(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse state: {e}"),
            ))
        })
    } else {
        let state = UpdateState::new(initial_version);
        save_state(path, &state)?;
        Ok(state)
    }
}

pub fn save_state(path: &Path, state: &UpdateState) -> Result<()> {
    let content = serde_json::to_vec_pretty(state)?;
    write_atomic(path, &content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_state() {
        let state = UpdateState::new("1.0.0");
        assert_eq!(state.current_version, "1.0.0");
        assert!(state.last_check_time.is_none());
        assert!(state.update_history.is_empty());
        assert!(state.failed_updates.is_empty());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_load_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("update_state.json");

        let state = load_state(&path, "0.0.0").unwrap();
        assert_eq!(state.current_version, "0.0.0");
        assert!(path.exists());

        let mut state = state;
        state.record_success("1.2.0", 10);
        save_state(&path, &state).unwrap();
        assert_eq!(load_state(&path, "0.0.0").unwrap(), state);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("update_state.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(load_state(&path, "0.0.0"), Err(UpdateError::State(_))));
    }

    #[test]
    fn test_wire_format() {
        let mut state = UpdateState::new("1.0.0");
        state.record_check(None);
        state.record_success("1.1.0", 10);
        state.record_failure("1.2.0", "checksum mismatch", false, 10);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["current_version"], "1.1.0");
        assert_eq!(json["update_history"][0]["from_version"], "1.0.0");
        assert_eq!(json["update_history"][0]["success"], true);
        assert_eq!(json["failed_updates"][0]["error"], "checksum mismatch");
        assert!(json["failed_updates"][0].get("unrecoverable").is_none());
        assert!(json["last_check_time"].is_string());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = UpdateState::new("1.0.0");
        for minor in 1..=5 {
            state.record_success(&format!("1.{minor}.0"), 3);
        }
        let versions: Vec<_> = state.update_history.iter().map(|h| h.version.as_str()).collect();
        assert_eq!(versions, vec!["1.3.0", "1.4.0", "1.5.0"]);
    }

    #[test]
    fn test_skip_after_consecutive_failures() {
        let mut state = UpdateState::new("1.0.0");
        for _ in 0..3 {
            assert!(!state.should_skip_version("1.1.0", 3));
            state.record_failure("1.1.0", "boom", false, 10);
        }
        assert!(state.should_skip_version("1.1.0", 3));
        assert!(!state.should_skip_version("1.2.0", 3));

        // A different failing version restarts the count
        state.record_failure("1.2.0", "boom", false, 10);
        assert_eq!(state.consecutive_failures, 1);
        assert!(!state.should_skip_version("1.1.0", 3));

        state.record_success("1.2.0", 10);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.failed_version.is_none());
    }

    #[test]
    fn test_record_rollback() {
        let mut state = UpdateState::new("1.0.0");
        state.record_success("1.1.0", 10);
        state.record_rollback("1.0.0", 10);

        assert_eq!(state.current_version, "1.0.0");
        let last = state.update_history.last().unwrap();
        assert_eq!(last.from_version, "1.1.0");
        assert!(!last.success);
    }
}
