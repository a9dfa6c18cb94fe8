//! Completion markers
//!
//! A marker is an empty record keyed `<phase prefix>/<chunk key>`. Workers
//! write one after a chunk task succeeds; barriers count them per prefix and
//! restarts skip chunks whose marker already exists.

use crate::io::error::Result;

/// Persistent set of completion markers
pub trait MarkerStore: Send + Sync {
    /// Record that the task behind `key` finished
    ///
    /// # Errors
    ///
    /// Returns a storage error if the marker cannot be persisted
    fn put_marker(&self, key: &str) -> Result<()>;

    /// Whether the task behind `key` already finished
    ///
    /// # Errors
    ///
    /// Returns a storage error if the marker set cannot be queried
    fn has_marker(&self, key: &str) -> Result<bool>;

    /// Number of markers under `prefix`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the marker set cannot be listed
    fn count_markers(&self, prefix: &str) -> Result<usize>;
}
