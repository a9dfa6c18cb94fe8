//! Pipeline constants and the immutable run configuration

use crate::io::error::{Result, invalid_parameter};
use crate::spatial::bbox::BoundingBox;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Block scheduling defaults
/// Sections aligned together in one block, excluding the overlap
pub const DEFAULT_BLOCK_SIZE: usize = 10;
/// Prior sections each section votes over, also the block overlap
pub const DEFAULT_TGT_RADIUS: usize = 3;
/// Sections searched backwards when target imagery is missing
pub const DEFAULT_NUM_TARGETS: usize = 1;

// Chunking defaults
/// Processing chunk edge in pixels at the working mip
pub const DEFAULT_CHUNK_SIZE: u32 = 1024;
/// Storage chunk edge in pixels at every mip
pub const DEFAULT_STORAGE_CHUNK: u32 = 128;
/// Read margin around every chunk in mip 0 pixels
pub const DEFAULT_PAD: u32 = 256;
/// Coarsest mip a bounding box must stay integral at
pub const DEFAULT_MAX_MIP: u32 = 9;

// Model defaults
/// Predictor used for sections no model range covers
pub const DEFAULT_MODEL: &str = "translation";
/// Shift radius of the built-in translation search, in grid cells
pub const DEFAULT_SEARCH_RADIUS: usize = 8;

// Voting defaults
/// Gaussian blur applied before computing voting weights
pub const DEFAULT_BLUR_SIGMA: f32 = 1.0;
/// Fixed seed for reproducible candidate subsampling
pub const DEFAULT_SEED: u64 = 42;
/// Two-hop estimates cross-checked against each direct pairwise field
pub const DEFAULT_INTERMEDIARIES: usize = 2;

// Field storage
/// Fixed-point scale of int16 field volumes
pub const FIELD_INT16_SCALE: f32 = 4.0;
/// Smallest displacement an int16 field volume represents without warning
pub const FIELD_INT16_MIN: f32 = -8192.0;
/// Largest displacement an int16 field volume represents without warning
pub const FIELD_INT16_MAX: f32 = 8191.0;

// Field inversion optimizer
/// Gradient descent step size
pub const INVERT_LEARNING_RATE: f32 = 0.1;
/// Hard cap on optimizer steps
pub const INVERT_MAX_ITERATIONS: usize = 1000;
/// Trailing costs averaged as the reference for early stopping
pub const INVERT_HISTORY_WINDOW: usize = 20;
/// Most recent costs averaged as the current value for early stopping
pub const INVERT_CURRENT_WINDOW: usize = 5;
/// Relative improvement below which the optimizer stops
pub const INVERT_EPSILON: f32 = 1e-9;

// Missing data detection on raw 8-bit imagery
/// Raw values at or above this are treated as missing
pub const MISSING_DATA_HIGH: f32 = 253.0;

// Retry policy for transient storage failures
/// Attempts before a transient error becomes fatal
pub const RETRY_MAX_ATTEMPTS: u32 = 5;
/// First backoff delay
pub const RETRY_INITIAL_DELAY_MS: u64 = 50;
/// Backoff delay ceiling
pub const RETRY_MAX_DELAY_MS: u64 = 2000;

// Completion barriers
/// Time a phase may take to produce all its markers
pub const BARRIER_TIMEOUT_SECS: u64 = 3600;
/// Marker polling interval while waiting on a barrier
pub const BARRIER_POLL_INTERVAL_MS: u64 = 500;

// Progress bar display settings
/// Phase bars kept on screen before older ones are cleared
pub const MAX_INDIVIDUAL_PROGRESS_BARS: usize = 5;

/// Model choice for a half-open range of source sections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRange {
    /// First section covered
    pub z_start: i64,
    /// One past the last section covered
    pub z_stop: i64,
    /// Name the predictor is registered under
    pub model: String,
}

/// Immutable configuration of one alignment run
///
/// Built once, validated, and then passed by reference to the planner and every
/// task context. Deserializes from JSON with every field optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlignConfig {
    /// Layer holding the unaligned source sections
    pub src_path: String,
    /// Prefix under which every output layer is created
    pub dst_path: String,
    /// Working resolution for field computation and rendering
    pub mip: u32,
    /// Final rendered images are downsampled up to this mip
    pub render_high_mip: u32,
    /// Coarsest mip the bounding box must remain integral at
    pub max_mip: u32,
    /// Region of interest in mip 0 pixels
    pub bbox: BoundingBox,
    /// First section of the run
    pub z_start: i64,
    /// One past the last section of the run
    pub z_stop: i64,
    /// Sections owned by each block
    pub block_size: usize,
    /// Voting radius, also the overlap between neighboring blocks
    pub tgt_radius: usize,
    /// Read margin in mip 0 pixels
    pub pad: u32,
    /// Processing chunk edge at the working mip
    pub chunk_size: [u32; 2],
    /// Storage chunk edge for newly created layers
    pub storage_chunk: [u32; 2],
    /// Sections that must never be a source or a target
    pub skip_list: Vec<i64>,
    /// Predictor lookup by source section
    pub model_ranges: Vec<ModelRange>,
    /// Shift radius of the built-in translation search, in grid cells
    pub search_radius: usize,
    /// Block offset index to resume from
    pub restart: usize,
    /// Worker threads for local execution, 0 picks the core count
    pub threads: usize,
    /// Softmin temperature in mip 0 pixels, `2^mip` when unset
    pub softmin_temperature: Option<f32>,
    /// Gaussian sigma applied before voting, 0 disables
    pub blur_sigma: f32,
    /// Sections searched when target imagery is missing
    pub num_targets: usize,
    /// Candidates drawn per vote when more are available
    pub vote_subset: Option<usize>,
    /// Seed for every random choice of the run
    pub seed: u64,
    /// Persist the per-pixel voting confidence
    pub write_confidence: bool,
    /// Run the two-orientation average around every prediction
    pub flip_average: bool,
    /// Record the schedule without reading, writing or predicting
    pub dry_run: bool,
    /// Seconds a phase may take before the run is aborted
    pub barrier_timeout_secs: u64,
    /// Mip at which neighbour correlation of the output is scored, if any
    pub qc_mip: Option<u32>,
    /// Offsets computed by a pairwise run
    pub pairwise_offsets: Vec<i64>,
    /// Cross-check pairwise fields against two-hop estimates
    pub pairwise_vote: bool,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            src_path: String::from("src/image"),
            dst_path: String::from("dst"),
            mip: 0,
            render_high_mip: 0,
            max_mip: DEFAULT_MAX_MIP,
            bbox: BoundingBox::default(),
            z_start: 0,
            z_stop: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            tgt_radius: DEFAULT_TGT_RADIUS,
            pad: DEFAULT_PAD,
            chunk_size: [DEFAULT_CHUNK_SIZE; 2],
            storage_chunk: [DEFAULT_STORAGE_CHUNK; 2],
            skip_list: Vec::new(),
            model_ranges: Vec::new(),
            search_radius: DEFAULT_SEARCH_RADIUS,
            restart: 0,
            threads: 0,
            softmin_temperature: None,
            blur_sigma: DEFAULT_BLUR_SIGMA,
            num_targets: DEFAULT_NUM_TARGETS,
            vote_subset: None,
            seed: DEFAULT_SEED,
            write_confidence: false,
            flip_average: false,
            dry_run: false,
            barrier_timeout_secs: BARRIER_TIMEOUT_SECS,
            qc_mip: None,
            pairwise_offsets: vec![-1, -2],
            pairwise_vote: false,
        }
    }
}

impl AlignConfig {
    /// Load a configuration from a JSON file and validate it
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON for this
    /// schema, or fails [`AlignConfig::validate`]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| crate::io::error::fs_error(path, "read config", source))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| crate::AlignError::Serialization {
                context: "run configuration",
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Softmin temperature in effect for this run
    pub fn temperature(&self) -> f32 {
        self.softmin_temperature
            .unwrap_or_else(|| (1_u32 << self.mip) as f32)
    }

    /// Barrier timeout as a duration
    pub const fn barrier_timeout(&self) -> Duration {
        Duration::from_secs(self.barrier_timeout_secs)
    }

    /// Predictor name registered for a source section
    ///
    /// Without any model ranges every section uses [`DEFAULT_MODEL`]; once
    /// ranges are given, sections outside all of them have no model.
    pub fn model_for(&self, z: i64) -> Option<&str> {
        if self.model_ranges.is_empty() {
            return Some(DEFAULT_MODEL);
        }
        self.model_ranges
            .iter()
            .find(|range| range.z_start <= z && z < range.z_stop)
            .map(|range| range.model.as_str())
    }

    /// Check every configuration constraint that can be checked without storage
    ///
    /// # Errors
    ///
    /// Returns an invalid parameter error naming the first violated constraint
    pub fn validate(&self) -> Result<()> {
        if self.src_path.is_empty() {
            return Err(invalid_parameter(
                "src_path",
                &self.src_path,
                &"source layer must be named",
            ));
        }
        if self.dst_path.is_empty() {
            return Err(invalid_parameter(
                "dst_path",
                &self.dst_path,
                &"destination prefix must be named",
            ));
        }
        if self.mip > self.render_high_mip || self.render_high_mip > self.max_mip {
            return Err(invalid_parameter(
                "mip",
                &format!(
                    "mip={} render_high_mip={} max_mip={}",
                    self.mip, self.render_high_mip, self.max_mip
                ),
                &"require mip <= render_high_mip <= max_mip",
            ));
        }
        if self.max_mip >= 30 {
            return Err(invalid_parameter(
                "max_mip",
                &self.max_mip,
                &"mip levels beyond 29 do not fit pixel coordinates",
            ));
        }
        self.bbox.check_integral(self.max_mip)?;
        if self.bbox.is_empty() {
            return Err(invalid_parameter(
                "bbox",
                &self.bbox,
                &"region of interest is empty",
            ));
        }
        if self.z_start >= self.z_stop {
            return Err(invalid_parameter(
                "z_range",
                &format!("{}..{}", self.z_start, self.z_stop),
                &"z range is empty",
            ));
        }
        if self.tgt_radius == 0 {
            return Err(invalid_parameter(
                "tgt_radius",
                &self.tgt_radius,
                &"at least one voting target is required",
            ));
        }
        if self.block_size < self.tgt_radius {
            return Err(invalid_parameter(
                "block_size",
                &self.block_size,
                &format!("must be at least the overlap {}", self.tgt_radius),
            ));
        }
        let mip_scale = 1_u32 << self.mip;
        if self.pad % mip_scale != 0 {
            return Err(invalid_parameter(
                "pad",
                &self.pad,
                &format!("must be a multiple of 2^mip = {mip_scale}"),
            ));
        }
        if self.chunk_size.contains(&0) || self.storage_chunk.contains(&0) {
            return Err(invalid_parameter(
                "chunk_size",
                &format!("{:?} / {:?}", self.chunk_size, self.storage_chunk),
                &"chunk edges must be positive",
            ));
        }
        if self.chunk_size[0] % self.storage_chunk[0] != 0
            || self.chunk_size[1] % self.storage_chunk[1] != 0
        {
            return Err(invalid_parameter(
                "chunk_size",
                &format!("{:?}", self.chunk_size),
                &format!(
                    "must be a multiple of the storage chunk {:?}",
                    self.storage_chunk
                ),
            ));
        }
        if self.num_targets == 0 {
            return Err(invalid_parameter(
                "num_targets",
                &self.num_targets,
                &"at least the direct target is required",
            ));
        }
        if self.blur_sigma < 0.0 || !self.blur_sigma.is_finite() {
            return Err(invalid_parameter(
                "blur_sigma",
                &self.blur_sigma,
                &"must be a finite non-negative number",
            ));
        }
        if let Some(temperature) = self.softmin_temperature
            && (temperature <= 0.0 || !temperature.is_finite())
        {
            return Err(invalid_parameter(
                "softmin_temperature",
                &temperature,
                &"must be a finite positive number",
            ));
        }
        if self.vote_subset == Some(0) {
            return Err(invalid_parameter(
                "vote_subset",
                &0,
                &"a vote needs at least one candidate",
            ));
        }
        if let Some(qc_mip) = self.qc_mip
            && (qc_mip <= self.mip || qc_mip > self.max_mip)
        {
            return Err(invalid_parameter(
                "qc_mip",
                &qc_mip,
                &format!("must lie in {}..={}", self.mip + 1, self.max_mip),
            ));
        }
        if self.pairwise_offsets.contains(&0) {
            return Err(invalid_parameter(
                "pairwise_offsets",
                &format!("{:?}", self.pairwise_offsets),
                &"a section is never aligned to itself",
            ));
        }
        if self.search_radius == 0 {
            return Err(invalid_parameter(
                "search_radius",
                &self.search_radius,
                &"must be positive",
            ));
        }
        for range in &self.model_ranges {
            if range.z_start >= range.z_stop || range.model.is_empty() {
                return Err(invalid_parameter(
                    "model_ranges",
                    &format!("{}..{} -> '{}'", range.z_start, range.z_stop, range.model),
                    &"ranges must be non-empty and name a model",
                ));
            }
        }
        Ok(())
    }
}
