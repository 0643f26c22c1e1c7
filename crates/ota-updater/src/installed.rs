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

//! On-disk record of installed artifacts
//!
//! One JSON object keyed by artifact id. Updates are read-modify-write with
//! an atomic replace; fields this crate does not know about are preserved.

use crate::atomic::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

pub const UPDATE_SOURCE_OTA: &str = "OTA";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledFile {
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub files: BTreeMap<String, InstalledFile>,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identity of a freshly committed artifact
#[derive(Debug, Clone)]
pub struct ArtifactUpdate<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub format: &'a str,
    pub filename: &'a str,
    pub size: u64,
    pub sha256: &'a str,
    pub url: Option<&'a str>,
    pub quantization: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstalledManifest(pub BTreeMap<String, InstalledArtifact>);

impl InstalledManifest {
    /// Missing file reads as an empty manifest
    pub fn load(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read(path)?;
        serde_json::from_slice(&content).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse {}: {e}", path.display()),
            )
        })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let content = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        write_atomic(path, &content)
    }

    pub fn get(&self, artifact_id: &str) -> Option<&InstalledArtifact> {
        self.0.get(artifact_id)
    }

    pub fn version_of(&self, artifact_id: &str) -> Option<&str> {
        self.get(artifact_id)
            .map(|a| a.version.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn record_update(&mut self, artifact_id: &str, update: &ArtifactUpdate<'_>) {
        let now = Utc::now();
        let entry = self.0.entry(artifact_id.to_string()).or_default();

        let previous = std::mem::take(&mut entry.version);
        entry.previous_version = (!previous.is_empty()).then_some(previous);
        entry.name = update.name.to_string();
        entry.version = update.version.to_string();
        entry.files.insert(
            update.format.to_string(),
            InstalledFile {
                filename: update.filename.to_string(),
                size: update.size,
                sha256: update.sha256.to_string(),
                url: update.url.map(str::to_string),
            },
        );
        if let Some(url) = update.url {
            entry.source = url.to_string();
        }
        if let Some(q) = update.quantization {
            entry.quantization = Some(q.to_string());
        }
        entry.last_updated = Some(now);
        entry.update_source = Some(UPDATE_SOURCE_OTA.to_string());
        entry.last_update_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn update<'a>(version: &'a str, sha: &'a str) -> ArtifactUpdate<'a> {
        ArtifactUpdate {
            name: "yolov8",
            version,
            format: "rknn",
            filename: "yolov8.rknn",
            size: 4096,
            sha256: sha,
            url: Some("https://cdn.example.com/yolov8.rknn"),
            quantization: Some("int8"),
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let manifest = InstalledManifest::load(&dir.path().join("manifest.json")).unwrap();
        assert!(manifest.0.is_empty());
    }

    #[test]
    fn test_record_update_tracks_previous_version() {
        let mut manifest = InstalledManifest::default();
        manifest.record_update("model-yolov8", &update("1.0.0", "aa"));
        assert_eq!(manifest.get("model-yolov8").unwrap().previous_version, None);

        manifest.record_update("model-yolov8", &update("1.1.0", "bb"));
        let entry = manifest.get("model-yolov8").unwrap();
        assert_eq!(entry.version, "1.1.0");
        assert_eq!(entry.previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(entry.files["rknn"].sha256, "bb");
        assert_eq!(entry.update_source.as_deref(), Some("OTA"));
        assert_eq!(entry.quantization.as_deref(), Some("int8"));
    }

    #[test]
    fn test_unknown_fields_survive_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            json!({
                "model-yolov8": {
                    "name": "yolov8",
                    "version": "1.0.0",
                    "files": {},
                    "source": "factory",
                    "input_shape": [1, 3, 640, 640]
                }
            })
            .to_string(),
        )
        .unwrap();

        let mut manifest = InstalledManifest::load(&path).unwrap();
        manifest.record_update("model-yolov8", &update("1.1.0", "cc"));
        manifest.save(&path).unwrap();

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["model-yolov8"]["input_shape"], json!([1, 3, 640, 640]));
        assert_eq!(raw["model-yolov8"]["previous_version"], "1.0.0");
        assert_eq!(raw["model-yolov8"]["update_source"], "OTA");
    }

    #[test]
    fn test_corrupt_manifest_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, b"{ broken").unwrap();

        let err = InstalledManifest::load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
