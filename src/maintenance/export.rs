//! Export finished labels as sidecar JSON files next to their images.
//!
//! `photos/cat.jpg` gets `photos/cat.json`. Label objects are written
//! pretty-printed with sorted keys; payloads that are not JSON are written
//! verbatim.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    /// Replace sidecar files that already exist.
    pub overwrite: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub exported: usize,
    /// Rows left alone because their sidecar already existed.
    pub skipped: usize,
}

/// Write one sidecar file per finished item into `image_dir`.
pub fn export_labels(
    storage: &Storage,
    image_dir: &Path,
    options: ExportOptions,
) -> Result<ExportReport> {
    let rows: Vec<(String, String)> = storage.read(|conn| {
        let mut stmt = conn.prepare(
            "SELECT filename, labels_json
             FROM images
             WHERE status = 'done' AND labels_json IS NOT NULL AND labels_json != ''
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut report = ExportReport::default();
    for (filename, raw) in rows {
        let target = sidecar_path(image_dir, &filename);
        if !options.overwrite && target.exists() {
            report.skipped += 1;
            continue;
        }
        write_sidecar(&target, &render(&raw)?)?;
        report.exported += 1;
    }

    tracing::info!(
        exported = report.exported,
        skipped = report.skipped,
        dir = %image_dir.display(),
        "label export finished"
    );
    Ok(report)
}

pub fn sidecar_path(image_dir: &Path, filename: &str) -> PathBuf {
    image_dir.join(Path::new(filename).with_extension("json"))
}

fn render(raw: &str) -> Result<String> {
    let mut text = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            serde_json::to_string_pretty(&value)?
        }
        _ => raw.to_string(),
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(text)
}

fn write_sidecar(target: &Path, contents: &str) -> Result<()> {
    let io_err = |source| Error::Io {
        path: target.to_path_buf(),
        source,
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(target, contents).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_replaces_extension() {
        let path = sidecar_path(Path::new("/imgs"), "batch1/cat.final.jpg");
        assert_eq!(path, PathBuf::from("/imgs/batch1/cat.final.json"));
    }

    #[test]
    fn render_pretty_prints_objects_with_sorted_keys() {
        let text = render(r#"{"b":["x"],"a":[]}"#).unwrap();
        assert_eq!(text, "{\n  \"a\": [],\n  \"b\": [\n    \"x\"\n  ]\n}\n");
    }

    #[test]
    fn render_keeps_non_json_verbatim() {
        assert_eq!(render("cat, dog").unwrap(), "cat, dog\n");
        assert_eq!(render("already\n").unwrap(), "already\n");
    }
}
