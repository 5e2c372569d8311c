//! Startup and shutdown lease release.
//!
//! No lease survives a process lifecycle boundary: the host demotes every
//! in-progress item back to pending before serving and again on clean exit.
//! After a restart each item is either pending or done, never stuck behind a
//! token nobody can produce.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::engine::Engine;
use crate::error::Result;
use crate::storage::{self, Storage};

/// Demote every in-progress item to pending and clear its lease.
/// Returns the number of leases discarded.
pub(crate) fn release_all(storage: &Storage, now: DateTime<Utc>) -> Result<usize> {
    let stamp = storage::encode_ts(now);
    storage.write(|tx| {
        let released = tx.execute(
            "UPDATE images
             SET status = 'pending',
                 reserved_by = NULL,
                 reserved_at = NULL,
                 updated_at = ?1
             WHERE status = 'in_progress'",
            params![stamp],
        )?;
        Ok(released)
    })
}

/// Scope of one serving process.
///
/// `LeaseScope::begin` releases stale leases before handing the engine out;
/// `finish` (or dropping the scope) releases whatever is still leased.
pub struct LeaseScope {
    engine: Arc<Engine>,
    finished: bool,
}

impl LeaseScope {
    /// Release leases left by a previous process and start serving.
    pub fn begin(engine: Arc<Engine>) -> Result<Self> {
        let released = engine.release_all_leases()?;
        tracing::info!(released, "startup lease release");
        Ok(Self {
            engine,
            finished: false,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Release all leases for a clean shutdown.
    pub fn finish(mut self) -> Result<usize> {
        self.finished = true;
        let released = self.engine.release_all_leases()?;
        tracing::info!(released, "shutdown lease release");
        Ok(released)
    }
}

impl Drop for LeaseScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.engine.release_all_leases() {
            Ok(released) => tracing::info!(released, "shutdown lease release"),
            Err(e) => tracing::error!(error = %e, "shutdown lease release failed"),
        }
    }
}
