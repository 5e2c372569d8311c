//! Catalog sync: discover images on disk and register unseen ones.
//!
//! Additive and idempotent. Existing rows are never touched; a file name
//! already in the table is never inserted twice. The `UNIQUE` constraint on
//! `filename` is what guarantees that, the pre-check only avoids opening a
//! write transaction when nothing is new.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::error::{Error, Result};
use crate::storage::{self, Storage};
use crate::telemetry::metrics;

/// What one sync pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Eligible files found in the source directory.
    pub scanned: usize,
    /// Rows actually inserted by this pass.
    pub registered: usize,
}

/// List eligible image file names in `dir`, sorted lexicographically.
///
/// A file is eligible when it is a regular file (symlinks followed) directly
/// inside `dir` whose extension matches one of `extensions` case-insensitively.
/// Names that are not valid UTF-8 are skipped with a warning.
pub fn scan_source(dir: &Path, extensions: &[String]) -> Result<Vec<String>> {
    let unavailable = |source| Error::SourceUnavailable {
        path: dir.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(unavailable)? {
        let entry = entry.map_err(unavailable)?;
        let path = entry.path();
        if !path.is_file() || !has_extension(&path, extensions) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => {
                tracing::warn!(file = ?raw, "skipping image with non-UTF-8 file name");
            }
        }
    }
    names.sort();
    Ok(names)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

/// Register every eligible file in `dir` not yet known to the store.
///
/// No writes happen when nothing is new. A concurrent sync inserting the
/// same name first is tolerated: the duplicate insert is ignored.
pub fn sync(
    storage: &Storage,
    dir: &Path,
    extensions: &[String],
    now: DateTime<Utc>,
) -> Result<SyncReport> {
    let files = scan_source(dir, extensions)?;
    let scanned = files.len();
    if files.is_empty() {
        return Ok(SyncReport::default());
    }

    let known = storage.read(storage::known_source_refs)?;
    let new_files: Vec<&String> = files.iter().filter(|name| !known.contains(*name)).collect();
    if new_files.is_empty() {
        tracing::debug!(scanned, "catalog unchanged");
        return Ok(SyncReport {
            scanned,
            registered: 0,
        });
    }

    let stamp = storage::encode_ts(now);
    let registered = storage.write(|tx| {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO images (filename, status, labels_json, skipped, updated_at)
             VALUES (?1, 'pending', NULL, 0, ?2)",
        )?;
        let mut inserted = 0;
        for name in &new_files {
            inserted += stmt.execute(params![name, stamp])?;
        }
        Ok(inserted)
    })?;

    if registered > 0 {
        metrics::items_registered().add(registered as u64, &[]);
        tracing::info!(scanned, registered, "registered new images");
    }

    Ok(SyncReport {
        scanned,
        registered,
    })
}
