//! Lease manager: pick the next eligible item and lease it to one caller.
//!
//! Reclaim is not a background sweep. An in-progress item whose lease has
//! run past the timeout simply becomes eligible again, and the next
//! reservation that scans for work takes it over.

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{OptionalExtension, params};

use crate::error::Result;
use crate::model::*;
use crate::storage::{self, Storage};

/// Latest grant time that counts as expired at `now`.
///
/// A timeout reaching past the earliest representable instant means no lease
/// ever expires.
pub fn expiry_threshold(now: DateTime<Utc>, timeout: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Lease the next eligible item, or `None` when nothing is eligible.
///
/// Pending items come before expired leases; ties break by ascending id.
/// Selection and update share one IMMEDIATE transaction, so two concurrent
/// callers never receive the same item.
pub(crate) fn reserve_next(
    storage: &Storage,
    timeout: TimeDelta,
    now: DateTime<Utc>,
) -> Result<Option<Reservation>> {
    let threshold = storage::encode_ts(expiry_threshold(now, timeout));
    let stamp = storage::encode_ts(now);

    storage.write(|tx| {
        let candidate: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT id, filename, status
                 FROM images
                 WHERE status = 'pending'
                    OR (
                        status = 'in_progress'
                        AND reserved_at IS NOT NULL
                        AND reserved_at <= ?1
                    )
                 ORDER BY CASE status WHEN 'pending' THEN 0 ELSE 1 END, id
                 LIMIT 1",
                params![threshold],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, source_ref, status)) = candidate else {
            return Ok(None);
        };

        let token = LeaseToken::generate();
        tx.execute(
            "UPDATE images
             SET status = 'in_progress',
                 reserved_by = ?1,
                 reserved_at = ?2,
                 updated_at = ?2
             WHERE id = ?3",
            params![token.as_str(), stamp, id],
        )?;

        Ok(Some(Reservation {
            id: ItemId(id),
            source_ref,
            token,
            reclaimed: status == ItemState::InProgress.as_str(),
        }))
    })
}
