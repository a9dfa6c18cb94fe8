//! Bounded retry with exponential backoff for storage calls

use crate::io::configuration::{
    RETRY_INITIAL_DELAY_MS, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_MS,
};
use crate::io::error::{AlignError, Result, storage_error};
use crate::spatial::bbox::BoundingBox;
use crate::store::tensor_store::{LayerHandle, TensorStore};
use ndarray::{Array3, ArrayView3};
use std::time::Duration;
use tracing::warn;

/// How often and how patiently to retry transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits, for tests
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Run `call`, retrying transient failures until attempts run out
    ///
    /// A transient failure on the last attempt becomes a fatal storage error.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or a storage error once all
    /// attempts failed transiently
    pub fn run<T>(&self, operation: &'static str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match call() {
                Err(error) if error.is_transient() => {
                    if attempt >= self.max_attempts {
                        return Err(exhausted(operation, attempt, &error));
                    }
                    warn!(operation, attempt, ?delay, %error, "transient storage failure, retrying");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn exhausted(operation: &'static str, attempts: u32, error: &AlignError) -> AlignError {
    let path = match error {
        AlignError::Transient { path, .. } => path.as_str(),
        _ => "<unknown>",
    };
    storage_error(
        operation,
        path,
        &format!("gave up after {attempts} attempts: {error}"),
    )
}

/// Store wrapper retrying every call under a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: TensorStore> RetryingStore<S> {
    /// Wrap `inner`
    pub const fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped store
    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: TensorStore> TensorStore for RetryingStore<S> {
    fn create_layer(&self, layer: &LayerHandle) -> Result<()> {
        self.policy
            .run("create_layer", || self.inner.create_layer(layer))
    }

    fn layer_info(&self, path: &str) -> Result<Option<LayerHandle>> {
        self.policy.run("layer_info", || self.inner.layer_info(path))
    }

    fn read(&self, layer: &LayerHandle, mip: u32, bbox: &BoundingBox, z: i64) -> Result<Array3<f32>> {
        self.policy
            .run("read", || self.inner.read(layer, mip, bbox, z))
    }

    fn write(
        &self,
        layer: &LayerHandle,
        mip: u32,
        bbox: &BoundingBox,
        z: i64,
        data: &ArrayView3<'_, f32>,
    ) -> Result<()> {
        self.policy
            .run("write", || self.inner.write(layer, mip, bbox, z, data))
    }
}
