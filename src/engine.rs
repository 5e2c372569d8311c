//! Core engine. The public API for handing out and closing labeling work.
//!
//! The engine owns the configuration and the storage handle. It holds no
//! locks and no connection of its own, so one instance can be shared across
//! threads (`Arc<Engine>`) and several processes can run their own engines
//! against the same database file.

use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::catalog::{self, SyncReport};
use crate::completion;
use crate::config::{Category, Config};
use crate::error::{Error, Result};
use crate::lease;
use crate::lifecycle;
use crate::model::*;
use crate::storage::Storage;
use crate::telemetry::{lease as spans, metrics};

/// The work assignment engine.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    storage: Storage,
}

impl Engine {
    /// Open (or create) the database named in `config`.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = Storage::open(&config.database_path, config.busy_timeout)?;
        Ok(Self { config, storage })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Label categories offered to annotators.
    pub fn categories(&self) -> &[Category] {
        &self.config.categories
    }

    // -----------------------------------------------------------------------
    // Catalog
    // -----------------------------------------------------------------------

    /// Register images in the configured directory that are not yet known.
    pub fn sync_catalog(&self) -> Result<SyncReport> {
        self.sync_catalog_at(Utc::now())
    }

    pub fn sync_catalog_at(&self, now: DateTime<Utc>) -> Result<SyncReport> {
        catalog::sync(
            &self.storage,
            &self.config.image_directory,
            &self.config.extensions,
            now,
        )
    }

    // -----------------------------------------------------------------------
    // Leasing
    // -----------------------------------------------------------------------

    /// Lease the next item to the caller. `None` means the queue is drained.
    ///
    /// Refreshes the catalog first; a failed refresh is logged and the
    /// reservation proceeds with the rows already known.
    pub fn reserve_next(&self) -> Result<Option<Reservation>> {
        self.reserve_next_at(Utc::now())
    }

    pub fn reserve_next_at(&self, now: DateTime<Utc>) -> Result<Option<Reservation>> {
        if let Err(e) = self.sync_catalog_at(now) {
            tracing::warn!(error = %e, "catalog sync skipped");
        }

        let started = Instant::now();
        let span = spans::start_lease_span("reserve", None);
        let _enter = span.enter();

        let reservation = lease::reserve_next(&self.storage, self.config.lease_timeout_delta()?, now)?;
        record_duration("reserve", started);

        match &reservation {
            Some(r) => {
                spans::record_item(&span, r.id);
                spans::record_outcome(&span, "granted");
                metrics::leases_granted()
                    .add(1, &[KeyValue::new("reclaimed", r.reclaimed.to_string())]);
                if r.reclaimed {
                    tracing::info!(item = %r.id, file = %r.source_ref, "reclaimed expired lease");
                } else {
                    tracing::info!(item = %r.id, file = %r.source_ref, "lease granted");
                }
            }
            None => {
                spans::record_outcome(&span, "empty");
                tracing::debug!("no eligible items");
            }
        }
        Ok(reservation)
    }

    /// Record labels for a leased item.
    pub fn finalize(&self, id: ItemId, token: &LeaseToken, labels: Labels) -> Result<()> {
        self.complete_at(id, token, Outcome::Labeled(labels), Utc::now())
    }

    pub fn finalize_at(
        &self,
        id: ItemId,
        token: &LeaseToken,
        labels: Labels,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.complete_at(id, token, Outcome::Labeled(labels), now)
    }

    /// Close out a leased item without labels.
    pub fn skip(&self, id: ItemId, token: &LeaseToken) -> Result<()> {
        self.complete_at(id, token, Outcome::Skipped, Utc::now())
    }

    pub fn skip_at(&self, id: ItemId, token: &LeaseToken, now: DateTime<Utc>) -> Result<()> {
        self.complete_at(id, token, Outcome::Skipped, now)
    }

    /// Close out a leased item with `outcome` if `token` is its current lease.
    pub fn complete_at(
        &self,
        id: ItemId,
        token: &LeaseToken,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let started = Instant::now();
        let span = spans::start_lease_span("finalize", Some(id));
        let _enter = span.enter();
        let outcome_label = KeyValue::new("outcome", outcome.as_str());

        let result = completion::finalize(&self.storage, id, token, &outcome, now);
        record_duration("finalize", started);

        match &result {
            Ok(()) => {
                spans::record_outcome(&span, outcome.as_str());
                metrics::items_finalized().add(1, &[outcome_label]);
                tracing::info!(item = %id, outcome = outcome.as_str(), "item finalized");
            }
            Err(Error::ReservationMismatch(_)) => {
                spans::record_outcome(&span, "conflict");
                metrics::lease_conflicts().add(1, &[outcome_label]);
                tracing::info!(item = %id, "stale lease presented");
            }
            Err(Error::NotFound(_)) => spans::record_outcome(&span, "not_found"),
            Err(e) => {
                spans::record_outcome(&span, "error");
                tracing::error!(item = %id, error = %e, "finalize failed");
            }
        }
        result
    }

    /// Demote every in-progress item to pending. For lifecycle hooks only.
    pub fn release_all_leases(&self) -> Result<usize> {
        self.release_all_leases_at(Utc::now())
    }

    pub fn release_all_leases_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let released = lifecycle::release_all(&self.storage, now)?;
        if released > 0 {
            metrics::leases_released().add(released as u64, &[]);
            tracing::info!(released, "released outstanding leases");
        }
        Ok(released)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Get an item by id.
    pub fn get(&self, id: ItemId) -> Result<Item> {
        self.storage.get_item(id)
    }

    /// List items, ordered by id. No lease semantics.
    pub fn list_items(&self, filter: ItemFilter) -> Result<Vec<Item>> {
        self.storage.list_items(filter)
    }

    pub fn counts(&self) -> Result<StateCounts> {
        self.storage.count_states()
    }
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}
