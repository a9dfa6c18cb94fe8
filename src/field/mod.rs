//! Displacement fields and their algebra
//!
//! This module contains field-related functionality including:
//! - The `(1, H, W, 2)` field tile and its coordinate conventions
//! - Conversion, resampling, composition and profiling
//! - Inversion by gradient descent
//! - Fixed-point storage encoding

/// Convention conversion, resampling, composition and profiling
pub mod algebra;
/// Int16 fixed-point encoding for field volumes
pub mod codec;
/// Field inversion strategies
pub mod invert;
/// The field tile type
pub mod tensor;

pub use tensor::{Convention, Field};
