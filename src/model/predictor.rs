//! Field predictors
//!
//! A predictor looks at a source and a target tile and returns the relative
//! field that warps the source onto the target. Learned models plug in
//! through [`FieldPredictor`]; the registry resolves them by the names used
//! in the configuration's model ranges.

use crate::field::tensor::{Convention, Field};
use crate::io::configuration::DEFAULT_MODEL;
use crate::io::error::{Result, ensure_shape, invalid_parameter};
use crate::model::translation::TranslationSearch;
use ndarray::{Array2, ArrayView2, Axis};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Model mapping an image pair to a relative displacement field
pub trait FieldPredictor: Send + Sync {
    /// Predict the relative field over the inputs' grid
    ///
    /// Images hold raw intensities; `0` marks missing data.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs differ in shape or prediction fails
    fn predict_field(
        &self,
        mip: u32,
        source: &ArrayView2<'_, f32>,
        target: &ArrayView2<'_, f32>,
    ) -> Result<Field>;
}

/// Average a predictor with its own prediction on the half-turned pair
///
/// The rotated prediction is rotated back before averaging, which cancels
/// orientation bias of the wrapped model.
#[derive(Debug, Clone)]
pub struct FlipAveraged<P> {
    inner: P,
}

impl<P: FieldPredictor> FlipAveraged<P> {
    /// Wrap a predictor
    pub const fn new(inner: P) -> Self {
        Self { inner }
    }
}

fn half_turn(image: &ArrayView2<'_, f32>) -> Array2<f32> {
    let mut rotated = image.to_owned();
    rotated.invert_axis(Axis(0));
    rotated.invert_axis(Axis(1));
    rotated
}

impl<P: FieldPredictor> FieldPredictor for FlipAveraged<P> {
    fn predict_field(
        &self,
        mip: u32,
        source: &ArrayView2<'_, f32>,
        target: &ArrayView2<'_, f32>,
    ) -> Result<Field> {
        let forward = self.inner.predict_field(mip, source, target)?;
        let rotated = self
            .inner
            .predict_field(
                mip,
                &half_turn(source).view(),
                &half_turn(target).view(),
            )?
            .rotate_half_turn();
        ensure_shape(
            "FlipAveraged",
            forward.data().shape(),
            rotated.data().shape(),
        )?;
        let averaged = (forward.data() + rotated.data()) * 0.5;
        Field::new(averaged, mip, Convention::Relative)
    }
}

impl<P: FieldPredictor + ?Sized> FieldPredictor for Arc<P> {
    fn predict_field(
        &self,
        mip: u32,
        source: &ArrayView2<'_, f32>,
        target: &ArrayView2<'_, f32>,
    ) -> Result<Field> {
        (**self).predict_field(mip, source, target)
    }
}

/// Predictors by name
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn FieldPredictor>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModelRegistry {
    /// Registry holding the built-in translation search under [`DEFAULT_MODEL`]
    pub fn with_builtin(search_radius: usize) -> Self {
        let mut registry = Self::default();
        registry.register(DEFAULT_MODEL, TranslationSearch::new(search_radius));
        registry
    }

    /// Add or replace a model
    pub fn register(&mut self, name: impl Into<String>, model: impl FieldPredictor + 'static) {
        self.models.insert(name.into(), Arc::new(model));
    }

    /// Wrap every registered model in [`FlipAveraged`]
    #[must_use]
    pub fn flip_averaged(self) -> Self {
        let models = self
            .models
            .into_iter()
            .map(|(name, model)| {
                let wrapped: Arc<dyn FieldPredictor> = Arc::new(FlipAveraged::new(model));
                (name, wrapped)
            })
            .collect();
        Self { models }
    }

    /// Whether a model is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Registered names in order
    pub fn names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    /// Look up a model
    ///
    /// # Errors
    ///
    /// Returns an invalid parameter error for unknown names
    pub fn get(&self, name: &str) -> Result<Arc<dyn FieldPredictor>> {
        self.models.get(name).cloned().ok_or_else(|| {
            invalid_parameter(
                "model",
                &name,
                &format!("no model registered under this name, known: {:?}", self.names()),
            )
        })
    }
}
