//! Lease operation span helpers.
//!
//! Provides span creation and outcome recording for the engine's
//! transactional operations.

use tracing::Span;

use crate::model::ItemId;

/// Start a span for one engine operation.
///
/// `item.id` may be empty (e.g. `reserve_next` before an item is chosen) and
/// `lease.outcome` is always declared empty; fill both via [`record_item`] and
/// [`record_outcome`].
pub fn start_lease_span(operation: &'static str, item_id: Option<ItemId>) -> Span {
    let span = tracing::info_span!(
        "lease.operation",
        "lease.operation" = operation,
        "item.id" = tracing::field::Empty,
        "lease.outcome" = tracing::field::Empty,
    );
    if let Some(id) = item_id {
        record_item(&span, id);
    }
    span
}

/// Attach the item the operation ended up touching.
pub fn record_item(span: &Span, item_id: ItemId) {
    span.record("item.id", item_id.0);
}

/// Record how the operation ended ("granted", "empty", "conflict", ...).
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("lease.outcome", outcome);
}
