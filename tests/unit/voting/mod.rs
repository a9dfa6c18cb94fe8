//! Tests for the `voting` modules
