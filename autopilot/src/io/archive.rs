//! Archival of the source document once every feature is completed.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

const ARCHIVE_SUFFIX: &str = ".completed";

/// Archived location of `source`: same directory, `.completed` appended.
pub fn archived_path(source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(ARCHIVE_SUFFIX);
    source.with_file_name(name)
}

/// Rename `source` to its archived name.
///
/// Returns the new path, or `None` when there was nothing to do: the source is
/// missing, or it has already been archived.
pub fn archive_source(source: &Path) -> Result<Option<PathBuf>> {
    let already = source
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(ARCHIVE_SUFFIX));
    if already {
        debug!(source = %source.display(), "source already archived");
        return Ok(None);
    }
    if !source.is_file() {
        debug!(source = %source.display(), "source missing, nothing to archive");
        return Ok(None);
    }
    let target = archived_path(source);
    fs::rename(source, &target).with_context(|| {
        format!("archive {} -> {}", source.display(), target.display())
    })?;
    info!(target = %target.display(), "source archived");
    Ok(Some(target))
}
