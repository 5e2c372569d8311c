//! Bulk rename of one label value across every stored payload.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;

use crate::error::Result;
use crate::storage::{self, Storage};

/// Replace `old` with `new` in every category list of every payload.
///
/// Runs in one write transaction. Rows whose payload is not a JSON object are
/// left untouched. Returns the number of rows changed.
pub fn rename_label(storage: &Storage, old: &str, new: &str, now: DateTime<Utc>) -> Result<usize> {
    let stamp = storage::encode_ts(now);
    let changed = storage.write(|tx| {
        // Every payload is parsed: values are stored JSON-escaped, so a text
        // match on the raw column would miss names containing quotes.
        let candidates: Vec<(i64, String)> = {
            let mut stmt =
                tx.prepare("SELECT id, labels_json FROM images WHERE labels_json IS NOT NULL")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut changed = 0;
        for (id, raw) in candidates {
            let Ok(mut payload) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            if !replace_value(&mut payload, old, new) {
                continue;
            }
            tx.execute(
                "UPDATE images SET labels_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&payload)?, stamp, id],
            )?;
            changed += 1;
        }
        Ok(changed)
    })?;

    tracing::info!(old, new, changed, "label rename finished");
    Ok(changed)
}

/// Swap exact matches of `old` for `new` inside each list of a payload object.
fn replace_value(payload: &mut Value, old: &str, new: &str) -> bool {
    let Value::Object(categories) = payload else {
        return false;
    };
    let mut changed = false;
    for values in categories.values_mut() {
        let Value::Array(values) = values else {
            continue;
        };
        for value in values.iter_mut() {
            if value.as_str() == Some(old) {
                *value = Value::String(new.to_string());
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replaces_only_exact_list_entries() {
        let mut payload = json!({
            "quality": ["blurry image", "dark"],
            "notes": "blurry image",
            "extra": ["very blurry image"]
        });
        assert!(replace_value(&mut payload, "blurry image", "pixelated, low res"));
        assert_eq!(
            payload,
            json!({
                "quality": ["pixelated, low res", "dark"],
                "notes": "blurry image",
                "extra": ["very blurry image"]
            })
        );
    }

    #[test]
    fn non_object_payloads_are_untouched() {
        let mut payload = json!(["blurry image"]);
        assert!(!replace_value(&mut payload, "blurry image", "x"));
    }
}
