//! Field prediction models

/// Predictor trait, flip averaging and the model registry
pub mod predictor;
/// Built-in exhaustive translation search
pub mod translation;

pub use predictor::{FieldPredictor, FlipAveraged, ModelRegistry};
pub use translation::TranslationSearch;
