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

//! Temp-file-then-rename helpers
//!
//! Temp files are created next to their target so the final rename never
//! crosses a filesystem boundary. A temp file that is never persisted is
//! removed when dropped.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Prefix shared by every temp file this crate creates next to live files
pub(crate) const TEMP_PREFIX: &str = ".ota-";

pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

pub(crate) fn temp_in(dir: &Path, purpose: &str) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(&format!("{TEMP_PREFIX}{purpose}-"))
        .tempfile_in(dir)
}

pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let mut tmp = temp_in(dir, "write")?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Copy `src` over `dst` so readers of `dst` see either the old or the new
/// content, never a mix
pub(crate) fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let dir = parent_dir(dst);
    fs::create_dir_all(dir)?;

    let mut tmp = temp_in(dir, "copy")?;
    io::copy(&mut fs::File::open(src)?, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), fs::metadata(src)?.permissions())?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}

/// Remove temp files left behind by a process that died mid-write
pub(crate) fn remove_stale_temps(dir: &Path) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_temp = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(TEMP_PREFIX));
        if is_temp && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
