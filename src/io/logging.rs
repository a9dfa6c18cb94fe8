//! Global tracing subscriber setup

use crate::io::error::{Result, invalid_parameter};
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// How log lines are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Default to `debug` instead of `info` when `RUST_LOG` is unset
    pub verbose: bool,
    /// One JSON object per line instead of human readable text
    pub json: bool,
}

impl LogOptions {
    /// Filter directive used when `RUST_LOG` is unset
    pub const fn default_directive(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }
}

/// Install the global subscriber writing to stderr
///
/// `RUST_LOG` takes precedence over the verbosity flag.
///
/// # Errors
///
/// Returns an error if a subscriber was already installed
pub fn init(options: LogOptions) -> Result<()> {
    INITIALISED
        .set(())
        .map_err(|()| {
            invalid_parameter("logging", &"init", &"tracing has already been initialised")
        })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_directive()));
    let registry = Registry::default().with(filter);
    if options.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true);
        registry
            .with(layer)
            .try_init()
            .map_err(|e| invalid_parameter("logging", &"json", &e))
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(true);
        registry
            .with(layer)
            .try_init()
            .map_err(|e| invalid_parameter("logging", &"text", &e))
    }
}
