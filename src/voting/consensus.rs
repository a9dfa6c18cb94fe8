//! Vector voting
//!
//! Candidates that all map the same section into the same frame are weighted
//! per pixel by how well they agree with the others. The disagreement of a
//! candidate is its mean distance to every other candidate; a softmin over the
//! disagreements gives the weights, and the consensus is the weighted sum of
//! the unblurred candidates.

use crate::field::tensor::{Convention, Field};
use crate::io::error::{AlignError, Result, ensure_shape, invalid_parameter};
use crate::math::filters::gaussian_blur;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

/// Settings of one vote
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoteConfig {
    /// Softmin temperature in mip 0 pixels
    pub temperature: f32,
    /// Gaussian sigma in grid cells applied before weighting, 0 disables
    pub blur_sigma: f32,
    /// Candidates drawn at random when more are offered
    pub subset: Option<usize>,
    /// Seed of the subset draw, mixed with the section index
    pub seed: u64,
}

impl VoteConfig {
    /// Scale-adaptive defaults for `mip`: temperature `2^mip`, no blur, no subsampling
    pub const fn for_mip(mip: u32) -> Self {
        Self {
            temperature: (1_u64 << mip) as f32,
            blur_sigma: 0.0,
            subset: None,
            seed: 0,
        }
    }
}

/// Outcome of a vote
#[derive(Debug, Clone)]
pub struct Consensus {
    /// Weighted consensus field, absolute convention
    pub field: Field,
    /// Per-pixel sum of the unnormalized softmin weights
    pub confidence: Array2<f32>,
    /// Number of candidates that took part
    pub voters: usize,
}

/// Vote among candidate fields for section `z`
///
/// A single candidate is passed through unchanged with full confidence.
///
/// # Errors
///
/// Returns [`AlignError::NoCandidates`] for an empty candidate list, and an
/// error if candidates are not absolute or differ in grid or mip
pub fn vector_vote(candidates: &[Field], config: &VoteConfig, z: i64) -> Result<Consensus> {
    let Some(first) = candidates.first() else {
        return Err(AlignError::NoCandidates { z });
    };
    for candidate in candidates {
        if candidate.convention() != Convention::Absolute {
            return Err(invalid_parameter(
                "candidates",
                &format!("{:?}", candidate.convention()),
                &"voting operates on absolute fields",
            ));
        }
        ensure_shape(
            "vector_vote",
            &[first.rows(), first.cols()],
            &[candidate.rows(), candidate.cols()],
        )?;
        if candidate.mip() != first.mip() {
            return Err(invalid_parameter(
                "candidates",
                &candidate.mip(),
                &format!("all candidates must be at mip {}", first.mip()),
            ));
        }
    }
    if config.temperature.is_nan() || config.temperature <= 0.0 {
        return Err(invalid_parameter(
            "temperature",
            &config.temperature,
            &"softmin temperature must be positive",
        ));
    }

    let chosen = choose_subset(candidates, config, z);
    if let [only] = chosen.as_slice() {
        return Ok(Consensus {
            field: (*only).clone(),
            confidence: Array2::ones(only.dim()),
            voters: 1,
        });
    }

    let (weights, confidence) = voting_weights(&chosen, config.temperature, config.blur_sigma);
    let mut x = Array2::<f32>::zeros(first.dim());
    let mut y = Array2::<f32>::zeros(first.dim());
    for (candidate, weight) in chosen.iter().zip(&weights) {
        x += &(weight * &candidate.component(0));
        y += &(weight * &candidate.component(1));
    }

    Ok(Consensus {
        field: Field::from_components(&x.view(), &y.view(), first.mip(), Convention::Absolute)?,
        confidence,
        voters: chosen.len(),
    })
}

/// Per-candidate normalized weights and the per-pixel weight sum
///
/// Distances are measured on blurred copies when `blur_sigma > 0`.
pub fn voting_weights(
    candidates: &[&Field],
    temperature: f32,
    blur_sigma: f32,
) -> (Vec<Array2<f32>>, Array2<f32>) {
    let dim = candidates.first().map_or((0, 0), |f| f.dim());
    let planes: Vec<(Array2<f32>, Array2<f32>)> = candidates
        .iter()
        .map(|field| {
            if blur_sigma > 0.0 {
                (
                    gaussian_blur(&field.component(0), blur_sigma),
                    gaussian_blur(&field.component(1), blur_sigma),
                )
            } else {
                (field.component(0).to_owned(), field.component(1).to_owned())
            }
        })
        .collect();

    let n = planes.len();
    let mut disagreement: Vec<Array2<f32>> = vec![Array2::zeros(dim); n];
    for i in 0..n {
        for j in (i + 1)..n {
            let (Some((xi, yi)), Some((xj, yj))) = (planes.get(i), planes.get(j)) else {
                continue;
            };
            let distance = Array2::from_shape_fn(dim, |(r, c)| {
                let dx = xi.get([r, c]).copied().unwrap_or(0.0) - xj.get([r, c]).copied().unwrap_or(0.0);
                let dy = yi.get([r, c]).copied().unwrap_or(0.0) - yj.get([r, c]).copied().unwrap_or(0.0);
                dx.hypot(dy)
            });
            if let Some(d) = disagreement.get_mut(i) {
                *d += &distance;
            }
            if let Some(d) = disagreement.get_mut(j) {
                *d += &distance;
            }
        }
    }
    let others = (n.saturating_sub(1)).max(1) as f32;
    for d in &mut disagreement {
        d.mapv_inplace(|v| v / others);
    }

    let mut weights: Vec<Array2<f32>> = vec![Array2::zeros(dim); n];
    let mut confidence = Array2::<f32>::zeros(dim);
    for ((r, c), total) in confidence.indexed_iter_mut() {
        let lowest = disagreement
            .iter()
            .filter_map(|d| d.get([r, c]).copied())
            .fold(f32::INFINITY, f32::min);
        let shifted: Vec<f32> = disagreement
            .iter()
            .map(|d| {
                let value = d.get([r, c]).copied().unwrap_or(lowest);
                (-(value - lowest) / temperature).exp()
            })
            .collect();
        let partition: f32 = shifted.iter().sum();
        for (weight, value) in weights.iter_mut().zip(&shifted) {
            if let Some(w) = weight.get_mut([r, c]) {
                *w = value / partition;
            }
        }
        *total = partition * (-lowest / temperature).exp();
    }
    (weights, confidence)
}

fn choose_subset<'a>(candidates: &'a [Field], config: &VoteConfig, z: i64) -> Vec<&'a Field> {
    match config.subset {
        Some(size) if size > 0 && size < candidates.len() => {
            let mut rng = StdRng::seed_from_u64(config.seed ^ (z as u64).rotate_left(32));
            let mut picked = sample(&mut rng, candidates.len(), size).into_vec();
            picked.sort_unstable();
            picked
                .into_iter()
                .filter_map(|index| candidates.get(index))
                .collect()
        }
        _ => candidates.iter().collect(),
    }
}
