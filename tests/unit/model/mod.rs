//! Tests for the `model` modules

mod translation;
