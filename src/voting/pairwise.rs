//! Three-way pairwise voting
//!
//! The stored field from `s` to `t` is cross-checked against two-hop
//! estimates through intermediary sections `k`. The vote replaces the direct
//! field with the consensus, so a single bad pairwise estimate is outvoted by
//! consistent triangles.

use crate::io::error::Result;
use crate::spatial::bbox::BoundingBox;
use crate::store::pairwise::PairwiseFields;
use crate::store::tensor_store::TensorStore;
use crate::voting::consensus::{Consensus, VoteConfig, vector_vote};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Pick up to `count` intermediaries for the pair `(source, target)`
///
/// `candidates` are the sections `k` for which both hops `s -> k` and
/// `k -> t` exist. They are ordered by total hop length with ties broken by
/// a shuffle seeded from `seed` and the pair.
pub fn select_intermediaries(source: i64, target: i64, candidates: &[i64], count: usize, seed: u64) -> Vec<i64> {
    let mut chosen: Vec<i64> = candidates
        .iter()
        .copied()
        .filter(|k| *k != target && *k != source)
        .collect();
    chosen.sort_unstable();
    chosen.dedup();
    let mut rng = StdRng::seed_from_u64(seed ^ (source as u64).rotate_left(17) ^ (target as u64));
    chosen.shuffle(&mut rng);
    chosen.sort_by_key(|k| (k - source).abs() + (target - k).abs());
    chosen.truncate(count);
    chosen
}

/// Vote between the direct field from `source` to `target` and its two-hop
/// estimates through `intermediaries`
///
/// # Errors
///
/// Returns an error if any hop's offset is not registered or a read fails
pub fn pairwise_vote(
    store: &dyn TensorStore,
    fields: &PairwiseFields,
    source: i64,
    target: i64,
    intermediaries: &[i64],
    bbox: &BoundingBox,
    config: &VoteConfig,
) -> Result<Consensus> {
    let mut candidates = Vec::with_capacity(intermediaries.len() + 1);
    candidates.push(fields.compose_path(store, &[target, source], bbox)?);
    for k in intermediaries {
        candidates.push(fields.compose_path(store, &[target, *k, source], bbox)?);
    }
    vector_vote(&candidates, config, source)
}
