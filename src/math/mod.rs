//! Numerical building blocks shared by the field algebra and rendering

/// Smoothing, pooling and block correlation over 2D planes
pub mod filters;
/// Bilinear sampling with zero or border padding
pub mod interpolation;
