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

//! Update manifest parsing and validation
//!
//! A manifest is rejected as a whole if any field or item is invalid; there
//! is no such thing as a partially valid manifest.

use crate::atomic::TEMP_PREFIX;
use crate::error::{Result, UpdateError};
use crate::verifier::FormatProfile;
use crate::version::Version;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Kernel,
    Model,
    Runtime,
    Firmware,
}

impl ArtifactKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "kernel" => Some(Self::Kernel),
            "model" => Some(Self::Model),
            "runtime" => Some(Self::Runtime),
            "firmware" => Some(Self::Firmware),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::Model => "model",
            Self::Runtime => "runtime",
            Self::Firmware => "firmware",
        }
    }

    pub fn profile(self) -> FormatProfile {
        match self {
            Self::Model => FormatProfile::MODEL,
            Self::Firmware => FormatProfile::FIRMWARE,
            Self::Kernel | Self::Runtime => FormatProfile::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateItem {
    pub kind: ArtifactKind,
    pub url: String,
    /// Lowercase hex SHA256
    pub checksum: String,
    pub size: Option<u64>,
    pub profile: FormatProfile,
    file_name: String,
}

impl UpdateItem {
    /// Last path segment of the source URL
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Stable identifier of the installed artifact, e.g. `model-yolov8`
    pub fn artifact_id(&self) -> String {
        let stem = Path::new(&self.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.file_name);
        format!("{}-{stem}", self.kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    pub version: Version,
    pub release_date: Option<DateTime<FixedOffset>>,
    pub description: Option<String>,
    pub changelog: Option<String>,
    /// Advisory only; never enforced
    pub min_version: Option<Version>,
    pub critical: bool,
    pub updates: Vec<UpdateItem>,
}

#[derive(Serialize)]
struct WireItem<'a> {
    #[serde(rename = "type")]
    kind: ArtifactKind,
    url: &'a str,
    checksum: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

#[derive(Serialize)]
struct WireManifest<'a> {
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    release_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    changelog: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_version: Option<String>,
    critical: bool,
    updates: Vec<WireItem<'a>>,
}

fn invalid(reason: impl Into<String>) -> UpdateError {
    UpdateError::InvalidManifest(reason.into())
}

impl UpdateManifest {
    /// Parse and validate a raw manifest payload
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| invalid(format!("not valid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| invalid("top-level value must be an object"))?;

        let version = match obj.get("version") {
            Some(Value::String(s)) => {
                Version::parse(s).map_err(|e| invalid(format!("field `version`: {e}")))?
            }
            Some(_) => return Err(invalid("field `version`: must be a string")),
            None => return Err(invalid("field `version`: missing")),
        };

        let raw_updates = match obj.get("updates") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(invalid("field `updates`: must be a list")),
            None => return Err(invalid("field `updates`: missing")),
        };
        if raw_updates.is_empty() {
            return Err(invalid("field `updates`: must not be empty"));
        }

        // Items share one install directory, so ids and file names must both be unique
        let mut seen_ids = HashSet::new();
        let mut seen_files = HashSet::new();
        let mut updates = Vec::with_capacity(raw_updates.len());
        for (index, raw_item) in raw_updates.iter().enumerate() {
            let item = parse_item(index, raw_item)?;
            if !seen_ids.insert(item.artifact_id()) || !seen_files.insert(item.file_name.clone()) {
                return Err(invalid(format!(
                    "updates[{index}].url: duplicate artifact {:?}",
                    item.artifact_id()
                )));
            }
            updates.push(item);
        }

        let release_date = match optional_str(obj, "release_date")? {
            Some(s) => Some(parse_timestamp(s).ok_or_else(|| {
                invalid(format!("field `release_date`: not an ISO-8601 timestamp: {s:?}"))
            })?),
            None => None,
        };

        let min_version = optional_str(obj, "min_version")?
            .map(|s| Version::parse(s).map_err(|e| invalid(format!("field `min_version`: {e}"))))
            .transpose()?;

        let critical = match obj.get("critical") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(invalid("field `critical`: must be a boolean")),
        };

        Ok(Self {
            version,
            release_date,
            description: optional_str(obj, "description")?.map(str::to_string),
            changelog: optional_str(obj, "changelog")?.map(str::to_string),
            min_version,
            critical,
            updates,
        })
    }

    /// Serialize back to the wire format
    pub fn to_json(&self) -> Value {
        let wire = WireManifest {
            version: self.version.to_string(),
            release_date: self.release_date.map(|d| d.to_rfc3339()),
            description: self.description.as_deref(),
            changelog: self.changelog.as_deref(),
            min_version: self.min_version.as_ref().map(ToString::to_string),
            critical: self.critical,
            updates: self
                .updates
                .iter()
                .map(|item| WireItem {
                    kind: item.kind,
                    url: &item.url,
                    checksum: &item.checksum,
                    size: item.size,
                })
                .collect(),
        };
        // Plain structs of strings and numbers always serialize
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }
}

fn optional_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<Option<&'a str>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(format!("field `{field}`: must be a string"))),
    }
}

fn parse_item(index: usize, value: &Value) -> Result<UpdateItem> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid(format!("updates[{index}]: must be an object")))?;

    let tag = item_str(obj, index, "type")?;
    let kind = ArtifactKind::from_tag(tag)
        .ok_or_else(|| invalid(format!("updates[{index}].type: unknown artifact type {tag:?}")))?;

    let url = item_str(obj, index, "url")?;
    let file_name = file_name_from_url(url)
        .ok_or_else(|| invalid(format!("updates[{index}].url: expected https://host/path/file, got {url:?}")))?;

    let checksum = item_str(obj, index, "checksum")?;
    if checksum.len() != 64 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid(format!(
            "updates[{index}].checksum: expected 64 hex characters (SHA256)"
        )));
    }

    let size = match obj.get("size") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            invalid(format!("updates[{index}].size: must be a non-negative integer"))
        })?),
    };

    Ok(UpdateItem {
        kind,
        url: url.to_string(),
        checksum: checksum.to_ascii_lowercase(),
        size,
        profile: kind.profile(),
        file_name,
    })
}

fn item_str<'a>(obj: &'a Map<String, Value>, index: usize, name: &str) -> Result<&'a str> {
    match obj.get(name) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(invalid(format!("updates[{index}].{name}: must be a string"))),
        None => Err(invalid(format!("updates[{index}].{name}: missing"))),
    }
}

/// Secure transport only; returns the last path segment. Names in the
/// staging namespace are refused, startup cleanup would delete them.
fn file_name_from_url(url: &str) -> Option<String> {
    let scheme_len = "https://".len();
    if url.len() <= scheme_len || !url.get(..scheme_len)?.eq_ignore_ascii_case("https://") {
        return None;
    }
    let rest = url.get(scheme_len..)?;
    let path_and_more = rest.split(['?', '#']).next()?;
    let (host, path) = path_and_more.split_once('/')?;
    if host.is_empty() {
        return None;
    }
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." || name.starts_with(TEMP_PREFIX) {
        return None;
    }
    Some(name.to_string())
}

/// RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` (UTC) or a bare date
fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc().fixed_offset());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}
