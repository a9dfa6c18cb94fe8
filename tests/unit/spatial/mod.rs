//! Tests for the `spatial` modules

mod chunks;
