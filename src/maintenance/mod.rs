//! Offline maintenance over the label store.
//!
//! These run singly against a quiet database (no lease traffic expected)
//! and never touch lease columns.

pub mod export;
pub mod relabel;

pub use export::{ExportOptions, ExportReport, export_labels};
pub use relabel::rename_label;
