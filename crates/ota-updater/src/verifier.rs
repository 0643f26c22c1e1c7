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

//! Artifact verification: container format, size bounds and SHA256
//!
//! All three checks always run so callers get the complete error list. The
//! verifier only ever reads the file.

use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Magic (4 bytes) followed by a little-endian u32 container version
pub const HEADER_LEN: usize = 8;

const CHUNK_SIZE: usize = 64 * 1024;

/// Expected on-disk format for an artifact kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatProfile {
    /// No header check
    Binary,
    Container {
        name: &'static str,
        magic: [u8; 4],
        versions: &'static [u32],
    },
}

impl FormatProfile {
    pub const MODEL: Self = Self::Container {
        name: "rknn",
        magic: *b"RKNN",
        versions: &[1, 2, 3],
    };

    pub const FIRMWARE: Self = Self::Container {
        name: "otfw",
        magic: *b"OTFW",
        versions: &[1, 2],
    };

    /// Key used for this format in the installed manifest `files` map
    pub fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Container { name, .. } => *name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLimits {
    pub min_bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationErrorCode {
    InvalidMagic,
    UnsupportedFormatVersion,
    Truncated,
    TooSmall,
    TooLarge,
    SizeMismatch,
    ChecksumMismatch,
    Unreadable,
}

impl fmt::Display for VerificationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidMagic => "invalid_magic",
            Self::UnsupportedFormatVersion => "unsupported_format_version",
            Self::Truncated => "truncated",
            Self::TooSmall => "too_small",
            Self::TooLarge => "too_large",
            Self::SizeMismatch => "size_mismatch",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Unreadable => "unreadable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatCheck {
    pub valid: bool,
    pub format: String,
    pub error: Option<VerificationErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeCheck {
    pub valid: bool,
    pub size: u64,
    pub error: Option<VerificationErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub format_valid: bool,
    pub size_valid: bool,
    pub checksum_valid: bool,
    pub detected_format: String,
    pub observed_size: u64,
    pub observed_checksum: String,
    pub errors: Vec<VerificationErrorCode>,
}

impl VerificationResult {
    pub fn into_error(self, artifact_id: &str) -> UpdateError {
        UpdateError::VerificationFailed {
            artifact_id: artifact_id.to_string(),
            format_valid: self.format_valid,
            size_valid: self.size_valid,
            checksum_valid: self.checksum_valid,
            errors: self.errors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactVerifier {
    limits: ArtifactLimits,
}

impl ArtifactVerifier {
    pub fn new(limits: ArtifactLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ArtifactLimits {
        self.limits
    }

    pub fn check_format(&self, path: &Path, profile: FormatProfile) -> io::Result<FormatCheck> {
        let FormatProfile::Container {
            name,
            magic,
            versions,
        } = profile
        else {
            return Ok(FormatCheck {
                valid: true,
                format: profile.name().to_string(),
                error: None,
            });
        };

        let mut header = Vec::with_capacity(HEADER_LEN);
        File::open(path)?
            .take(HEADER_LEN as u64)
            .read_to_end(&mut header)?;

        if header.len() < HEADER_LEN {
            return Ok(FormatCheck {
                valid: false,
                format: "unknown".to_string(),
                error: Some(VerificationErrorCode::Truncated),
            });
        }
        if header[..4] != magic {
            return Ok(FormatCheck {
                valid: false,
                format: "unknown".to_string(),
                error: Some(VerificationErrorCode::InvalidMagic),
            });
        }

        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let format = format!("{name}-v{version}");
        if versions.contains(&version) {
            Ok(FormatCheck {
                valid: true,
                format,
                error: None,
            })
        } else {
            Ok(FormatCheck {
                valid: false,
                format,
                error: Some(VerificationErrorCode::UnsupportedFormatVersion),
            })
        }
    }

    /// Check size bounds, and the exact size when the manifest declared one
    pub fn check_size(&self, path: &Path, declared: Option<u64>) -> io::Result<SizeCheck> {
        let size = std::fs::metadata(path)?.len();
        let error = if size < self.limits.min_bytes {
            Some(VerificationErrorCode::TooSmall)
        } else if size > self.limits.max_bytes {
            Some(VerificationErrorCode::TooLarge)
        } else if declared.is_some_and(|d| d != size) {
            Some(VerificationErrorCode::SizeMismatch)
        } else {
            None
        };

        Ok(SizeCheck {
            valid: error.is_none(),
            size,
            error,
        })
    }

    /// Returns the observed digest and whether it matches. No expected digest
    /// means the check passes vacuously.
    pub fn check_checksum(&self, path: &Path, expected: Option<&str>) -> io::Result<(bool, String)> {
        let observed = sha256_file(path)?;
        let valid = expected.is_none_or(|e| e.eq_ignore_ascii_case(&observed));
        Ok((valid, observed))
    }

    pub fn verify(
        &self,
        path: &Path,
        profile: FormatProfile,
        declared_size: Option<u64>,
        expected_checksum: Option<&str>,
    ) -> Result<VerificationResult> {
        if !path.is_file() {
            return Err(UpdateError::ArtifactNotFound(path.to_path_buf()));
        }

        let mut errors = Vec::new();

        let format = self.check_format(path, profile).unwrap_or_else(|e| {
            tracing::warn!("Failed to read header of {}: {e}", path.display());
            FormatCheck {
                valid: false,
                format: "unknown".to_string(),
                error: Some(VerificationErrorCode::Unreadable),
            }
        });
        errors.extend(format.error);

        let size = self.check_size(path, declared_size).unwrap_or_else(|e| {
            tracing::warn!("Failed to stat {}: {e}", path.display());
            SizeCheck {
                valid: false,
                size: 0,
                error: Some(VerificationErrorCode::Unreadable),
            }
        });
        errors.extend(size.error);

        let (checksum_valid, observed_checksum) = match self.check_checksum(path, expected_checksum)
        {
            Ok(checked) => checked,
            Err(e) => {
                tracing::warn!("Failed to hash {}: {e}", path.display());
                (false, String::new())
            }
        };
        if !checksum_valid {
            errors.push(if observed_checksum.is_empty() {
                VerificationErrorCode::Unreadable
            } else {
                VerificationErrorCode::ChecksumMismatch
            });
        }
        errors.dedup();

        let result = VerificationResult {
            valid: format.valid && size.valid && checksum_valid,
            format_valid: format.valid,
            size_valid: size.valid,
            checksum_valid,
            detected_format: format.format,
            observed_size: size.size,
            observed_checksum,
            errors,
        };

        if result.valid {
            tracing::debug!(
                "Verified {} ({}, {} bytes)",
                path.display(),
                result.detected_format,
                result.observed_size
            );
        } else {
            tracing::warn!("Verification of {} failed: {:?}", path.display(), result.errors);
        }

        Ok(result)
    }
}

/// Streaming SHA256 of a file, lowercase hex
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const LIMITS: ArtifactLimits = ArtifactLimits {
        min_bytes: 16,
        max_bytes: 1024,
    };

    fn model_bytes(version: u32, len: usize) -> Vec<u8> {
        let mut data = b"RKNN".to_vec();
        data.extend_from_slice(&version.to_le_bytes());
        data.resize(len, 0xab);
        data
    }

    fn write(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn digest(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    #[test]
    fn test_valid_model_passes_all_checks() {
        let dir = TempDir::new().unwrap();
        let data = model_bytes(2, 256);
        let path = write(&dir, "model.rknn", &data);

        let verifier = ArtifactVerifier::new(LIMITS);
        let result = verifier
            .verify(&path, FormatProfile::MODEL, Some(256), Some(&digest(&data)))
            .unwrap();

        assert!(result.valid);
        assert_eq!(result.detected_format, "rknn-v2");
        assert_eq!(result.observed_size, 256);
        assert_eq!(result.observed_checksum, digest(&data));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_checksum_compare_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let data = model_bytes(1, 64);
        let path = write(&dir, "m", &data);

        let verifier = ArtifactVerifier::new(LIMITS);
        let (valid, _) = verifier
            .check_checksum(&path, Some(&digest(&data).to_uppercase()))
            .unwrap();
        assert!(valid);
    }

    #[test]
    fn test_missing_checksum_is_vacuously_valid() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "m", &model_bytes(1, 64));

        let verifier = ArtifactVerifier::new(LIMITS);
        let result = verifier.verify(&path, FormatProfile::MODEL, None, None).unwrap();
        assert!(result.checksum_valid);
        assert!(result.valid);
        assert_eq!(result.observed_checksum.len(), 64);
    }

    #[test]
    fn test_all_failures_are_reported() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad", b"GGUF\x01\x00\x00\x00");

        let verifier = ArtifactVerifier::new(LIMITS);
        let result = verifier
            .verify(&path, FormatProfile::MODEL, None, Some(&"0".repeat(64)))
            .unwrap();

        assert!(!result.valid);
        assert!(!result.format_valid);
        assert!(!result.size_valid);
        assert!(!result.checksum_valid);
        assert_eq!(
            result.errors,
            vec![
                VerificationErrorCode::InvalidMagic,
                VerificationErrorCode::TooSmall,
                VerificationErrorCode::ChecksumMismatch,
            ]
        );
    }

    #[test]
    fn test_truncated_header() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "short", b"RKN");

        let verifier = ArtifactVerifier::new(LIMITS);
        let check = verifier.check_format(&path, FormatProfile::MODEL).unwrap();
        assert!(!check.valid);
        assert_eq!(check.error, Some(VerificationErrorCode::Truncated));
    }

    #[test]
    fn test_unsupported_container_version() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "v9", &model_bytes(9, 64));

        let verifier = ArtifactVerifier::new(LIMITS);
        let check = verifier.check_format(&path, FormatProfile::MODEL).unwrap();
        assert!(!check.valid);
        assert_eq!(check.format, "rknn-v9");
        assert_eq!(
            check.error,
            Some(VerificationErrorCode::UnsupportedFormatVersion)
        );
    }

    #[test]
    fn test_binary_profile_skips_header() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "kernel", b"\x7fELF plus some payload bytes");

        let verifier = ArtifactVerifier::new(LIMITS);
        let check = verifier.check_format(&path, FormatProfile::Binary).unwrap();
        assert!(check.valid);
        assert_eq!(check.format, "binary");
    }

    #[test]
    fn test_size_bounds_and_declared_size() {
        let dir = TempDir::new().unwrap();
        let verifier = ArtifactVerifier::new(LIMITS);

        let big = write(&dir, "big", &vec![0u8; 2048]);
        assert_eq!(
            verifier.check_size(&big, None).unwrap().error,
            Some(VerificationErrorCode::TooLarge)
        );

        let ok = write(&dir, "ok", &vec![0u8; 100]);
        assert!(verifier.check_size(&ok, Some(100)).unwrap().valid);
        assert_eq!(
            verifier.check_size(&ok, Some(101)).unwrap().error,
            Some(VerificationErrorCode::SizeMismatch)
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let verifier = ArtifactVerifier::new(LIMITS);
        let result = verifier.verify(
            &dir.path().join("absent"),
            FormatProfile::Binary,
            None,
            None,
        );
        assert!(matches!(result, Err(UpdateError::ArtifactNotFound(_))));
    }

    #[test]
    fn test_sha256_spans_multiple_chunks() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let path = write(&dir, "large", &data);
        assert_eq!(sha256_file(&path).unwrap(), digest(&data));
    }

    #[test]
    fn test_verify_does_not_modify_file() {
        let dir = TempDir::new().unwrap();
        let data = model_bytes(3, 128);
        let path = write(&dir, "m", &data);

        let verifier = ArtifactVerifier::new(LIMITS);
        let _ = verifier
            .verify(&path, FormatProfile::MODEL, None, Some(&"f".repeat(64)))
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    proptest! {
        #[test]
        fn prop_checksum_deterministic_and_byte_sensitive(
            data in proptest::collection::vec(any::<u8>(), 1..4096),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let dir = TempDir::new().unwrap();
            let path = write(&dir, "a", &data);
            let first = sha256_file(&path).unwrap();
            prop_assert_eq!(&first, &sha256_file(&path).unwrap());

            let mut mutated = data.clone();
            let i = index.index(mutated.len());
            mutated[i] ^= flip;
            let other = write(&dir, "b", &mutated);
            prop_assert_ne!(first, sha256_file(&other).unwrap());
        }
    }
}
