//! Tests for the `pipeline` modules

mod executor;
mod render;
mod tasks;
