//! Completion service: close out a leased item with its outcome.
//!
//! The token check and the write share one IMMEDIATE transaction. Success
//! clears the lease, so a token works at most once; a retry after success
//! sees `ReservationMismatch`, which tells the caller the work is already
//! recorded.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::error::{Error, Result};
use crate::model::*;
use crate::storage::{self, Storage};

pub(crate) fn finalize(
    storage: &Storage,
    id: ItemId,
    token: &LeaseToken,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Result<()> {
    let (labels_json, skipped) = match outcome {
        Outcome::Labeled(labels) => (storage::encode_labels(labels)?, false),
        Outcome::Skipped => (storage::encode_labels(&Labels::new())?, true),
    };
    let stamp = storage::encode_ts(now);

    storage.write(|tx| {
        let holder: Option<Option<String>> = tx
            .query_row(
                "SELECT reserved_by FROM images WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;

        match holder {
            None => return Err(Error::NotFound(id)),
            Some(current) if current.as_deref() != Some(token.as_str()) => {
                return Err(Error::ReservationMismatch(id));
            }
            Some(_) => {}
        }

        tx.execute(
            "UPDATE images
             SET status = 'done',
                 labels_json = ?1,
                 reserved_by = NULL,
                 reserved_at = NULL,
                 skipped = ?2,
                 updated_at = ?3
             WHERE id = ?4",
            params![labels_json, skipped, stamp, id.0],
        )?;
        Ok(())
    })
}
