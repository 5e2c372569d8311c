//! Core data model.
//!
//! An item is one image that needs labels. It has a stable identity, the
//! file name it was discovered under, and a lifecycle state. While an item
//! is in progress it carries a lease: the token a worker must present to
//! finish it, and the moment the lease was granted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Snapshot of one item row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Assigned at first registration, never changes.
    pub id: ItemId,

    /// File name of the underlying image. Unique across all items.
    pub source_ref: String,

    /// Current lifecycle state.
    pub state: ItemState,

    /// Present exactly while `state` is `InProgress`.
    pub lease: Option<Lease>,

    /// Result data. Present once the item is `Done`.
    pub payload: Option<Payload>,

    /// Set when the item was finished via skip rather than a label submission.
    pub skipped: bool,

    pub updated_at: Option<DateTime<Utc>>,
}

/// Stable integer identity of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .map(ItemId)
            .map_err(|_| Error::Other(format!("invalid item id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of an item.
///
/// `Pending -> InProgress` only by reservation. `InProgress -> Pending` by
/// lease expiry or a lifecycle release. `InProgress -> Done` only by
/// completion. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting for a worker.
    Pending,
    /// Leased to exactly one worker.
    InProgress,
    /// Labeled or skipped. Terminal.
    Done,
}

impl ItemState {
    pub const ALL: [ItemState; 3] = [ItemState::Pending, ItemState::InProgress, ItemState::Done];

    /// Value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::InProgress => "in_progress",
            ItemState::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Done)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ItemState::Pending),
            "in_progress" => Ok(ItemState::InProgress),
            "done" => Ok(ItemState::Done),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A time-bounded exclusive claim on an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub granted_at: DateTime<Utc>,
}

/// Opaque proof of lease ownership.
///
/// Minted from a v4 UUID, so it carries 122 bits from the OS random source and
/// nothing derived from the item id or the clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LeaseToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LeaseToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a successful `reserve_next` hands to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ItemId,
    pub source_ref: String,
    pub token: LeaseToken,
    /// True when the item was taken over from an expired lease.
    pub reclaimed: bool,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Category name to selected label values.
///
/// Backed by a `BTreeMap` so the stored JSON always has sorted keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, Vec<String>>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of one category.
    pub fn with<I, S>(mut self, category: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(category, values);
        self
    }

    pub fn insert<I, S>(&mut self, category: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .insert(category.into(), values.into_iter().map(Into::into).collect());
    }

    pub fn get(&self, category: &str) -> Option<&[String]> {
        self.0.get(category).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// At least one category has at least one value selected.
    pub fn has_selection(&self) -> bool {
        self.0.values().any(|values| !values.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Vec<String>)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, Vec<String>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Stored result data of a finished item.
///
/// Rows written by this engine always hold `Labels`. Offline tools may leave
/// text that is not a label object; it is surfaced as `Raw` instead of
/// failing the read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Labels(Labels),
    Raw(String),
}

impl Payload {
    pub fn labels(&self) -> Option<&Labels> {
        match self {
            Payload::Labels(labels) => Some(labels),
            Payload::Raw(_) => None,
        }
    }
}

/// How a leased item is being closed out.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Labeled(Labels),
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Labeled(_) => "labeled",
            Outcome::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Read-only listing filter. Results are ordered by ascending id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub state: Option<ItemState>,
    /// `None` or `Some(0)` means no limit.
    pub limit: Option<usize>,
}

impl ItemFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: ItemState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Number of items per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub done: u64,
    /// Subset of `done` finished via skip.
    pub skipped: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.done
    }
}
