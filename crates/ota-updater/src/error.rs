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

//! Error types for the updater crate

use crate::verifier::VerificationErrorCode;
use std::path::PathBuf;
use thiserror::Error;

/// Step of the apply state machine an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStep {
    Staging,
    Verifying,
    Committing,
}

/// How bad a failed operation left the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Nothing was left half-applied; the previous artifact is live.
    Recoverable,
    /// Restoring the previous artifact failed; an operator has to step in.
    Unrecoverable,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error(
        "verification failed for {artifact_id} (format={format_valid}, size={size_valid}, checksum={checksum_valid}): {errors:?}"
    )]
    VerificationFailed {
        artifact_id: String,
        format_valid: bool,
        size_valid: bool,
        checksum_valid: bool,
        errors: Vec<VerificationErrorCode>,
    },

    #[error("staging failed for {artifact_id}: {source}")]
    StagingFailed {
        artifact_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("commit failed for {artifact_id}: {source}")]
    CommitFailed {
        artifact_id: String,
        #[source]
        source: std::io::Error,
    },

    /// Restoring the previous artifact failed. `cause` is the error that
    /// triggered the rollback, if any (manual rollbacks have none).
    #[error("rollback failed: {reason}")]
    RollbackFailed {
        #[source]
        cause: Option<Box<UpdateError>>,
        reason: String,
    },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("no backup available: {0}")]
    NoBackup(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {secs}s: {what}")]
    Timeout { what: String, secs: u64 },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("state persistence error: {0}")]
    State(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpdateError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::RollbackFailed { .. } => Severity::Unrecoverable,
            _ => Severity::Recoverable,
        }
    }

    /// Which apply step produced this error, if it came from the executor
    pub fn failed_step(&self) -> Option<ApplyStep> {
        match self {
            Self::StagingFailed { .. } | Self::ArtifactNotFound(_) => Some(ApplyStep::Staging),
            Self::VerificationFailed { .. } => Some(ApplyStep::Verifying),
            Self::CommitFailed { .. } => Some(ApplyStep::Committing),
            Self::RollbackFailed { cause, .. } => cause.as_ref().and_then(|c| c.failed_step()),
            _ => None,
        }
    }

    /// Short reason string recorded in `failed_updates`
    pub fn reason(&self) -> String {
        match self {
            Self::RollbackFailed {
                cause: Some(cause), ..
            } => format!("{self} (triggered by: {cause})"),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_failed_is_unrecoverable() {
        let err = UpdateError::RollbackFailed {
            cause: Some(Box::new(UpdateError::CommitFailed {
                artifact_id: "model-yolo".to_string(),
                source: std::io::Error::other("disk full"),
            })),
            reason: "backup missing".to_string(),
        };
        assert_eq!(err.severity(), Severity::Unrecoverable);
        assert_eq!(err.failed_step(), Some(ApplyStep::Committing));
        assert!(err.to_string().contains("backup missing"));
        assert!(err.reason().contains("disk full"));
    }

    #[test]
    fn test_verification_failure_is_recoverable() {
        let err = UpdateError::VerificationFailed {
            artifact_id: "model-yolo".to_string(),
            format_valid: true,
            size_valid: true,
            checksum_valid: false,
            errors: vec![VerificationErrorCode::ChecksumMismatch],
        };
        assert_eq!(err.severity(), Severity::Recoverable);
        assert_eq!(err.failed_step(), Some(ApplyStep::Verifying));
    }

    #[test]
    fn test_non_executor_errors_have_no_step() {
        assert_eq!(UpdateError::Cancelled.failed_step(), None);
        assert_eq!(
            UpdateError::DownloadFailed("503".to_string()).failed_step(),
            None
        );
    }
}
