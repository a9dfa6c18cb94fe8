//! Input/output, configuration and the ambient command-line stack
//!
//! This module contains io-related functionality including:
//! - The crate error type
//! - Run configuration and documented defaults
//! - Command-line parsing, logging setup and progress display
//! - PNG import and export of sections

/// Command-line interface
pub mod cli;
/// Run configuration and defaults
pub mod configuration;
/// Error types and helpers
pub mod error;
/// PNG import and export
pub mod image;
/// Tracing subscriber setup
pub mod logging;
/// Per-phase progress bars
pub mod progress;
