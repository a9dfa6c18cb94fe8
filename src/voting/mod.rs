//! Consensus among candidate fields

/// Softmin vector voting
pub mod consensus;
/// Triangle-consistency voting over the pairwise store
pub mod pairwise;

pub use consensus::{Consensus, VoteConfig, vector_vote};
