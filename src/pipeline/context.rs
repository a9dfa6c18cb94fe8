//! Shared resources every chunk task runs against

use crate::field::invert::{FieldInverter, GradientInverter};
use crate::model::predictor::ModelRegistry;
use crate::store::markers::MarkerStore;
use crate::store::memory::{MemoryMarkers, MemoryStore};
use crate::store::retry::{RetryPolicy, RetryingStore};
use crate::store::tensor_store::TensorStore;
use std::sync::Arc;

/// Storage, models and inverter handed to every task
///
/// Reads and writes go through a retrying wrapper, so tasks never see a
/// transient storage failure unless the retry budget is spent.
#[derive(Clone)]
pub struct TaskContext {
    store: Arc<dyn TensorStore>,
    /// Completion markers
    pub markers: Arc<dyn MarkerStore>,
    /// Predictors by name
    pub models: ModelRegistry,
    /// Inversion strategy for invert tasks
    pub inverter: Arc<dyn FieldInverter>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// Context with the default retry policy and gradient inverter
    pub fn new(
        store: Arc<dyn TensorStore>,
        markers: Arc<dyn MarkerStore>,
        models: ModelRegistry,
    ) -> Self {
        Self::with_policy(store, markers, models, RetryPolicy::default())
    }

    /// Context retrying storage calls under `policy`
    pub fn with_policy(
        store: Arc<dyn TensorStore>,
        markers: Arc<dyn MarkerStore>,
        models: ModelRegistry,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store: Arc::new(RetryingStore::new(store, policy)),
            markers,
            models,
            inverter: Arc::new(GradientInverter::default()),
        }
    }

    /// Fully in-memory context
    pub fn in_memory(models: ModelRegistry) -> Self {
        Self::new(
            Arc::new(MemoryStore::in_memory()),
            Arc::new(MemoryMarkers::default()),
            models,
        )
    }

    /// Replace the inversion strategy
    #[must_use]
    pub fn with_inverter(mut self, inverter: Arc<dyn FieldInverter>) -> Self {
        self.inverter = inverter;
        self
    }

    /// The retrying store
    pub fn store(&self) -> &dyn TensorStore {
        self.store.as_ref()
    }

    /// Shared handle to the retrying store
    pub fn shared_store(&self) -> Arc<dyn TensorStore> {
        Arc::clone(&self.store)
    }
}
