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

//! Version parsing and comparison module
//!
//! Versions are dotted numeric tuples (`1.2.0`). A leading `v` from release
//! tags and anything from the first `-` onward are stripped before parsing;
//! the suffix is kept for display but never affects ordering.

use crate::error::{Result, UpdateError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Version {
    parts: Vec<u64>,
    suffix: Option<String>,
}

impl Version {
    /// Parse a version string such as `1.2.0`, `v1.2.0` or `1.2.0-rc1`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_prefix(['v', 'V']).unwrap_or(s);
        let (core, suffix) = match s.split_once('-') {
            Some((core, suffix)) => (core, Some(suffix.to_string())),
            None => (s, None),
        };

        if core.is_empty() {
            return Err(UpdateError::InvalidVersion(format!(
                "empty version string: {s:?}"
            )));
        }

        let parts = core
            .split('.')
            .map(|segment| {
                if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(UpdateError::InvalidVersion(format!(
                        "non-numeric segment {segment:?} in {s:?}"
                    )));
                }
                segment.parse::<u64>().map_err(|_| {
                    UpdateError::InvalidVersion(format!("segment {segment:?} out of range in {s:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { parts, suffix })
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }
}

impl Ord for Version {
    // Mixed arity compares as if the shorter tuple were zero-padded: 1.2 == 1.2.0
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.parts {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        if let Some(ref suffix) = self.suffix {
            write!(f, "-{suffix}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Three-way comparison of two parsed versions
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// Returns true if `remote` is newer than `local`
pub fn is_newer(local: &str, remote: &str) -> Result<bool> {
    Ok(Version::parse(remote)? > Version::parse(local)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(v("0.2.38").parts(), &[0, 2, 38]);
        assert_eq!(v("v0.2.38").parts(), &[0, 2, 38]);
        assert_eq!(v("V0.2.38").parts(), &[0, 2, 38]);
        assert_eq!(v("10.20.30").parts(), &[10, 20, 30]);
    }

    #[test]
    fn test_parse_strips_suffix() {
        let version = v("1.2.0-beta.3");
        assert_eq!(version.parts(), &[1, 2, 0]);
        assert_eq!(version.suffix(), Some("beta.3"));
        assert_eq!(version, v("1.2.0"));
        assert_eq!(version.to_string(), "1.2.0-beta.3");
    }

    #[test]
    fn test_parse_version_invalid() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("-rc1").is_err());
        assert!(Version::parse("invalid").is_err());
        assert!(Version::parse("a.b.c").is_err());
        assert!(Version::parse("1..2").is_err());
        assert!(Version::parse("1.+2.3").is_err());
        assert!(Version::parse("1.2.3 ").is_err());
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("0.2.38", "0.2.39").unwrap());
        assert!(!is_newer("0.2.38", "0.2.38").unwrap());
        assert!(!is_newer("0.2.39", "0.2.38").unwrap());
        assert!(is_newer("0.2.38", "0.3.0").unwrap());
        assert!(is_newer("0.2.38", "1.0.0").unwrap());
        assert!(!is_newer("1.0.0", "0.9.99").unwrap());
        assert!(!is_newer("2.0.0", "1.9.0").unwrap());
        assert!(is_newer("1.9.0", "1.10.0").unwrap());
    }

    #[test]
    fn test_mixed_arity_is_zero_padded() {
        assert_eq!(compare(&v("1.2"), &v("1.2.0")), Ordering::Equal);
        assert_eq!(compare(&v("1.2"), &v("1.2.1")), Ordering::Less);
        assert_eq!(compare(&v("1.3"), &v("1.2.9")), Ordering::Greater);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("1.2.0")).unwrap();
        assert_eq!(json, "\"1.2.0\"");
        let parsed: Version = serde_json::from_str("\"v3.1.4\"").unwrap();
        assert_eq!(parsed, v("3.1.4"));
        assert!(serde_json::from_str::<Version>("\"x.y\"").is_err());
    }

    fn version_string() -> impl Strategy<Value = String> {
        (0u64..20, 0u64..20, 0u64..20).prop_map(|(a, b, c)| format!("{a}.{b}.{c}"))
    }

    proptest! {
        #[test]
        fn prop_compare_reflexive(a in version_string()) {
            let a = v(&a);
            prop_assert_eq!(compare(&a, &a), Ordering::Equal);
        }

        #[test]
        fn prop_compare_antisymmetric(a in version_string(), b in version_string()) {
            let (a, b) = (v(&a), v(&b));
            prop_assert_eq!(compare(&a, &b), compare(&b, &a).reverse());
        }

        #[test]
        fn prop_compare_transitive(
            a in version_string(),
            b in version_string(),
            c in version_string(),
        ) {
            let (a, b, c) = (v(&a), v(&b), v(&c));
            if compare(&a, &b) != Ordering::Greater && compare(&b, &c) != Ordering::Greater {
                prop_assert_ne!(compare(&a, &c), Ordering::Greater);
            }
        }

        #[test]
        fn prop_display_roundtrip(a in version_string()) {
            prop_assert_eq!(v(&a).to_string(), a);
        }
    }
}
