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

//! OTA updater - verified, atomic replacement of on-device artifacts
//!
//! A release manifest lists the artifacts (models, firmware, kernels,
//! runtimes) of a release. The [`orchestrator`] fetches it, downloads every
//! artifact, and hands each to the [`executor`], which stages, verifies and
//! renames it into place with a backup to fall back on.

mod atomic;

pub mod backup;
pub mod cancel;
pub mod config;
pub mod downloader;
pub mod error;
pub mod executor;
pub mod installed;
pub mod manifest;
pub mod orchestrator;
pub mod state;
pub mod telemetry;
pub mod verifier;
pub mod version;

pub use cancel::Cancellation;
pub use config::{EngineConfig, load_config};
pub use downloader::{Downloader, HttpDownloader};
pub use error::{ApplyStep, Result, Severity, UpdateError};
pub use manifest::{ArtifactKind, UpdateItem, UpdateManifest};
pub use orchestrator::{ManifestSource, UpdateCheck, UpdateOrchestrator};
pub use state::UpdateState;
pub use verifier::{ArtifactVerifier, VerificationResult};
pub use version::{Version, compare, is_newer};
