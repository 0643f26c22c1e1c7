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

//! Telemetry module for reporting update events

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum UpdateEvent {
    UpdateStarted {
        from_version: String,
        to_version: String,
        artifacts: usize,
    },
    UpdateCompleted {
        from_version: String,
        to_version: String,
        duration_secs: u64,
    },
    UpdateFailed {
        from_version: String,
        to_version: String,
        error: String,
        unrecoverable: bool,
    },
    RollbackStarted {
        from_version: String,
        to_version: Option<String>,
    },
    RollbackCompleted {
        restored_version: String,
    },
    RollbackFailed {
        error: String,
    },
}

/// Report an update event. Fire-and-forget: never fails the update flow.
pub fn report_event(event: &UpdateEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!("Telemetry event: {json}"),
        Err(e) => tracing::warn!("Failed to serialize telemetry event: {e}"),
    }
}
