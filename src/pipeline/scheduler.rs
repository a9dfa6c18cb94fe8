//! Phase construction and sequencing
//!
//! A run is an ordered list of phases. Every task inside a phase is
//! independent of the others; a phase starts only once every task of the
//! previous phase has left its completion marker. Phases are built up front
//! from the block plan, so a dry run sees exactly what a real run executes.

use crate::io::configuration::{AlignConfig, DEFAULT_INTERMEDIARIES};
use crate::io::error::{Result, invalid_parameter};
use crate::io::progress::ProgressManager;
use crate::model::predictor::ModelRegistry;
use crate::pipeline::executor::{PhaseExecutor, PhaseReport};
use crate::pipeline::plan::{Block, BlockPlan, Layout, Parity, Role};
use crate::pipeline::tasks::{
    ChunkTask, ComposeTask, ComputeFieldTask, CopyTask, CorrelateTask, DownsampleTask,
    PairwiseVoteTask, RenderTask, Task, VectorVoteTask,
};
use crate::spatial::bbox::BoundingBox;
use crate::spatial::chunks::ChunkGrid;
use crate::store::pairwise::PairwiseFields;
use crate::store::tensor_store::{LayerHandle, TensorStore};
use crate::store::volumes::{FieldRef, ImageRef};
use crate::voting::consensus::VoteConfig;
use crate::voting::pairwise::select_intermediaries;
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};
use tracing::{info, info_span};

/// A set of independent chunk tasks behind one barrier
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    /// Human readable name, also the marker path suffix
    pub name: String,
    /// Marker prefix shared by all tasks
    pub prefix: String,
    /// The tasks
    pub tasks: Vec<ChunkTask>,
}

/// Timing of a finished run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Per-phase reports in execution order
    pub phases: Vec<PhaseReport>,
    /// Wall time of the whole run
    pub elapsed: Duration,
}

impl RunSummary {
    /// Tasks executed across all phases
    pub fn executed(&self) -> usize {
        self.phases.iter().map(|p| p.executed).sum()
    }

    /// Tasks skipped because their marker already existed
    pub fn skipped(&self) -> usize {
        self.phases.iter().map(|p| p.skipped).sum()
    }
}

/// Builds and sequences the phases of an alignment run
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: AlignConfig,
    plan: BlockPlan,
    layout: Layout,
    source: LayerHandle,
    grid: ChunkGrid,
}

impl Scheduler {
    /// Validate the configuration, build the block plan and check that every
    /// section has a registered model
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configurations, runs whose sections are
    /// all skipped, or sections without a registered model
    pub fn new(config: AlignConfig, source: LayerHandle, models: &ModelRegistry) -> Result<Self> {
        config.validate()?;
        let plan = BlockPlan::build(&config)?;
        let used: BTreeSet<i64> = plan
            .blocks
            .iter()
            .flat_map(|block| block.sections.iter().copied())
            .collect();
        for z in used {
            match config.model_for(z) {
                Some(name) if models.contains(name) => {}
                Some(name) => {
                    return Err(invalid_parameter(
                        "model_ranges",
                        &name,
                        &format!("section {z} uses a model that is not registered, known: {:?}", models.names()),
                    ));
                }
                None => {
                    return Err(invalid_parameter(
                        "model_ranges",
                        &z,
                        &"no model range covers this section",
                    ));
                }
            }
        }
        let grid = ChunkGrid::new(config.chunk_size, config.storage_chunk, [0, 0], config.mip)?;
        let layout = Layout::new(&config);
        Ok(Self {
            config,
            plan,
            layout,
            source,
            grid,
        })
    }

    /// The block decomposition
    pub const fn plan(&self) -> &BlockPlan {
        &self.plan
    }

    /// Output layer names
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The run configuration
    pub const fn config(&self) -> &AlignConfig {
        &self.config
    }

    fn chunks(&self) -> Vec<BoundingBox> {
        self.grid.break_into_chunks(&self.config.bbox)
    }

    fn chunks_at(&self, mip: u32) -> Vec<BoundingBox> {
        self.grid.at_mip(mip).break_into_chunks(&self.config.bbox)
    }

    fn pad(&self) -> i64 {
        i64::from(self.config.pad)
    }

    fn vote_config(&self) -> VoteConfig {
        VoteConfig {
            temperature: self.config.temperature(),
            blur_sigma: self.config.blur_sigma,
            subset: self.config.vote_subset,
            seed: self.config.seed,
        }
    }

    fn model(&self, z: i64) -> String {
        self.config
            .model_for(z)
            .map(str::to_string)
            .unwrap_or_default()
    }

    fn pairs(&self, parity: Parity) -> PairwiseFields {
        self.layout.block_pairs(parity, self.plan.offsets(parity))
    }

    fn phase(&self, name: String, tasks: Vec<Task>) -> Option<Phase> {
        if tasks.is_empty() {
            return None;
        }
        let prefix = self.layout.marker_prefix(&name);
        Some(Phase {
            tasks: tasks
                .into_iter()
                .map(|task| ChunkTask::new(prefix.clone(), task))
                .collect(),
            prefix,
            name,
        })
    }

    /// Every layer an alignment run writes
    pub fn layers(&self) -> Vec<LayerHandle> {
        let mut layers = Vec::new();
        for parity in [Parity::Even, Parity::Odd] {
            layers.push(self.layout.block_image(parity));
            layers.push(self.layout.block_field(parity));
            if self.config.write_confidence {
                layers.push(self.layout.block_confidence(parity));
            }
            layers.extend(self.pairs(parity).layers().cloned());
        }
        layers.extend([
            self.layout.stitch_image(),
            self.layout.stitch_correction(),
            self.layout.stitch_vote(),
            self.layout.cumulative(),
            self.layout.final_field(),
            self.layout.final_image(),
        ]);
        if self.config.qc_mip.is_some() {
            layers.push(self.layout.correlation());
        }
        layers
    }

    /// Record every output layer's metadata
    ///
    /// # Errors
    ///
    /// Propagates store failures
    pub fn create_layers(&self, store: &dyn TensorStore, layers: &[LayerHandle]) -> Result<()> {
        layers.iter().try_for_each(|layer| store.create_layer(layer))
    }

    fn compute_task(
        &self,
        block: &Block,
        z: i64,
        target: i64,
        backups: Vec<i64>,
        bbox: BoundingBox,
    ) -> Result<Task> {
        let parity = block.parity();
        let image = self.layout.block_image(parity);
        Ok(Task::ComputeField(ComputeFieldTask {
            source: ImageRef::new(self.source.clone(), z),
            target: ImageRef::new(image.clone(), target),
            dst: self.pairs(parity).volume(target - z)?.clone(),
            bbox,
            mip: self.config.mip,
            pad: self.pad(),
            model: self.model(z),
            prev_field: Some(FieldRef::new(self.layout.block_field(parity), target, self.config.mip)),
            backups: backups
                .into_iter()
                .map(|b| ImageRef::new(image.clone(), b))
                .collect(),
            reference_bbox: self.config.bbox,
        }))
    }

    /// Backup targets for `target`: already rendered sections further from `z`
    fn backups(&self, block: &Block, z: i64, target: i64) -> Vec<i64> {
        let extra = self.config.num_targets.saturating_sub(1);
        let Some(position) = block.sections.iter().position(|s| *s == target) else {
            return Vec::new();
        };
        if target > z {
            block
                .sections
                .get(position + 1..=block.anchor)
                .unwrap_or_default()
                .iter()
                .copied()
                .take(extra)
                .collect()
        } else {
            block
                .sections
                .get(..position)
                .unwrap_or_default()
                .iter()
                .rev()
                .copied()
                .take(extra)
                .collect()
        }
    }

    /// Copy, compute, vote and render phases of every block, step by step
    ///
    /// Steps before `config.restart` are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if a needed pairwise offset is not registered
    pub fn block_phases(&self) -> Result<Vec<Phase>> {
        let chunks = self.chunks();
        let mip = self.config.mip;
        let mut phases = Vec::new();

        for step in self.config.restart..self.plan.step_count() {
            let mut copies = Vec::new();
            let mut computes = Vec::new();
            let mut votes = Vec::new();
            let mut renders = Vec::new();

            for block in &self.plan.blocks {
                let order = block.step_order();
                let Some(position) = order.get(step).copied() else {
                    continue;
                };
                let (Some(z), Some(role)) = (
                    block.section(position),
                    block.role(position, &self.plan.skip, self.plan.overlap),
                ) else {
                    continue;
                };
                let parity = block.parity();
                let targets = match role {
                    Role::Copy => {
                        copies.extend(chunks.iter().map(|bbox| {
                            Task::Copy(CopyTask {
                                src: self.source.clone(),
                                src_z: z,
                                dst: self.layout.block_image(parity),
                                dst_z: z,
                                bbox: *bbox,
                                mip,
                            })
                        }));
                        continue;
                    }
                    Role::Serial { target } => vec![target],
                    Role::Vote { targets } => targets,
                };

                let pairs = self.pairs(parity);
                for bbox in &chunks {
                    let mut candidates = Vec::with_capacity(targets.len());
                    for target in &targets {
                        computes.push(self.compute_task(block, z, *target, self.backups(block, z, *target), *bbox)?);
                        candidates.push(vec![FieldRef::new(pairs.volume(target - z)?.clone(), z, mip)]);
                    }
                    votes.push(Task::VectorVote(VectorVoteTask {
                        candidates,
                        dst: self.layout.block_field(parity),
                        confidence: self
                            .config
                            .write_confidence
                            .then(|| self.layout.block_confidence(parity)),
                        z,
                        bbox: *bbox,
                        mip,
                        pad: self.pad(),
                        vote: self.vote_config(),
                    }));
                    renders.push(Task::Render(RenderTask {
                        image: ImageRef::new(self.source.clone(), z),
                        field: Some(FieldRef::new(self.layout.block_field(parity), z, mip)),
                        dst: self.layout.block_image(parity),
                        dst_z: z,
                        bbox: *bbox,
                        mip,
                        pad: self.pad(),
                    }));
                }
            }

            phases.extend(
                [
                    ("copy", copies),
                    ("compute_field", computes),
                    ("vector_vote", votes),
                    ("render", renders),
                ]
                .into_iter()
                .filter_map(|(stage, tasks)| self.phase(format!("block/step_{step:03}/{stage}"), tasks)),
            );
        }
        Ok(phases)
    }

    /// Phases estimating and broadcasting the correction between block frames
    ///
    /// Empty for single block runs.
    pub fn stitch_phases(&self) -> Vec<Phase> {
        let chunks = self.chunks();
        let mip = self.config.mip;
        let mut copies = Vec::new();
        let mut computes = Vec::new();
        let mut votes = Vec::new();

        for pair in self.plan.blocks.windows(2) {
            let [previous, block] = pair else {
                continue;
            };
            let Some(start) = block.start() else {
                continue;
            };
            for bbox in &chunks {
                for z in block.starters() {
                    copies.push(Task::Copy(CopyTask {
                        src: self.layout.block_image(previous.parity()),
                        src_z: *z,
                        dst: self.layout.stitch_image(),
                        dst_z: *z,
                        bbox: *bbox,
                        mip,
                    }));
                    computes.push(Task::ComputeField(ComputeFieldTask {
                        source: ImageRef::new(self.layout.block_image(block.parity()), *z),
                        target: ImageRef::new(self.layout.stitch_image(), *z),
                        dst: self.layout.stitch_correction(),
                        bbox: *bbox,
                        mip,
                        pad: self.pad(),
                        model: self.model(*z),
                        prev_field: None,
                        backups: Vec::new(),
                        reference_bbox: self.config.bbox,
                    }));
                }
                votes.push(Task::VectorVote(VectorVoteTask {
                    candidates: block
                        .starters()
                        .iter()
                        .map(|z| vec![FieldRef::new(self.layout.stitch_correction(), *z, mip)])
                        .collect(),
                    dst: self.layout.stitch_vote(),
                    confidence: None,
                    z: start,
                    bbox: *bbox,
                    mip,
                    pad: self.pad(),
                    vote: self.vote_config(),
                }));
            }
        }

        let mut phases: Vec<Phase> = [
            ("stitch/copy", copies),
            ("stitch/compute_field", computes),
            ("stitch/vector_vote", votes),
        ]
        .into_iter()
        .filter_map(|(name, tasks)| self.phase(name.to_string(), tasks))
        .collect();

        // Each cumulative correction depends on the previous block's
        for pair in self.plan.blocks.windows(2) {
            let [previous, block] = pair else {
                continue;
            };
            let (Some(previous_start), Some(start)) = (previous.start(), block.start()) else {
                continue;
            };
            let tasks = chunks
                .iter()
                .map(|bbox| {
                    Task::Compose(ComposeTask {
                        outer: FieldRef::new(self.layout.cumulative(), previous_start, mip),
                        inner: FieldRef::new(self.layout.stitch_vote(), start, mip),
                        dst: self.layout.cumulative(),
                        dst_z: start,
                        bbox: *bbox,
                        mip,
                        pad: self.pad(),
                    })
                })
                .collect();
            phases.extend(self.phase(format!("stitch/broadcast_{:03}", block.index), tasks));
        }
        phases
    }

    /// Final composition, rendering, pyramid and quality phases
    pub fn output_phases(&self) -> Vec<Phase> {
        let chunks = self.chunks();
        let mip = self.config.mip;
        let mut composes = Vec::new();
        let mut renders = Vec::new();
        for block in &self.plan.blocks {
            let Some(start) = block.start() else {
                continue;
            };
            for z in block.owned_sections() {
                for bbox in &chunks {
                    composes.push(Task::Compose(ComposeTask {
                        outer: FieldRef::new(self.layout.cumulative(), start, mip),
                        inner: FieldRef::new(self.layout.block_field(block.parity()), *z, mip),
                        dst: self.layout.final_field(),
                        dst_z: *z,
                        bbox: *bbox,
                        mip,
                        pad: self.pad(),
                    }));
                    renders.push(Task::Render(RenderTask {
                        image: ImageRef::new(self.source.clone(), *z),
                        field: Some(FieldRef::new(self.layout.final_field(), *z, mip)),
                        dst: self.layout.final_image(),
                        dst_z: *z,
                        bbox: *bbox,
                        mip,
                        pad: self.pad(),
                    }));
                }
            }
        }
        let mut phases: Vec<Phase> = [("final/compose", composes), ("final/render", renders)]
            .into_iter()
            .filter_map(|(name, tasks)| self.phase(name.to_string(), tasks))
            .collect();

        let owned = self.plan.owned_sections();
        for level in mip + 1..=self.config.render_high_mip {
            let level_chunks = self.chunks_at(level);
            let tasks = owned
                .iter()
                .flat_map(|z| {
                    level_chunks.iter().map(|bbox| {
                        Task::Downsample(DownsampleTask {
                            layer: self.layout.final_image(),
                            z: *z,
                            bbox: *bbox,
                            mip: level,
                        })
                    })
                })
                .collect();
            phases.extend(self.phase(format!("downsample/mip_{level}"), tasks));
        }

        if let Some(qc_mip) = self.config.qc_mip {
            let qc_chunks = self.chunks_at(qc_mip);
            let tasks = owned
                .windows(2)
                .filter_map(|pair| match pair {
                    [previous, z] => Some((*previous, *z)),
                    _ => None,
                })
                .flat_map(|(previous, z)| {
                    qc_chunks.iter().map(move |bbox| (previous, z, *bbox))
                })
                .map(|(previous, z, bbox)| {
                    Task::Correlate(CorrelateTask {
                        image: self.layout.final_image(),
                        z,
                        neighbour: previous,
                        dst: self.layout.correlation(),
                        bbox,
                        mip,
                        dst_mip: qc_mip,
                    })
                })
                .collect();
            phases.extend(self.phase("qc/correlation".to_string(), tasks));
        }
        phases
    }

    /// Every phase of a block alignment run in order
    ///
    /// # Errors
    ///
    /// Propagates phase construction failures
    pub fn phases(&self) -> Result<Vec<Phase>> {
        let mut phases = self.block_phases()?;
        phases.extend(self.stitch_phases());
        phases.extend(self.output_phases());
        Ok(phases)
    }

    /// Source to target pairs of a pairwise run, skip-aware
    pub fn pairwise_pairs(&self) -> Vec<(i64, i64)> {
        let usable = self.plan.skip.usable(self.config.z_start..self.config.z_stop);
        let range = self.config.z_start..self.config.z_stop;
        usable
            .iter()
            .flat_map(|z| {
                self.plan
                    .skip
                    .extend_offsets(*z, &self.config.pairwise_offsets)
                    .into_iter()
                    .map(move |offset| (*z, z + offset))
            })
            .filter(|(_, target)| range.contains(target))
            .collect()
    }

    /// Raw and voted pairwise stores of a pairwise run
    pub fn pairwise_fields(&self) -> (PairwiseFields, PairwiseFields) {
        let offsets: BTreeSet<i64> = self
            .pairwise_pairs()
            .iter()
            .map(|(source, target)| target - source)
            .collect();
        (
            self.layout.pairwise_raw(offsets.iter().copied()),
            self.layout.pairwise_voted(offsets),
        )
    }

    /// Layers written by a pairwise run
    pub fn pairwise_layers(&self) -> Vec<LayerHandle> {
        let (raw, voted) = self.pairwise_fields();
        let mut layers: Vec<LayerHandle> = raw.layers().cloned().collect();
        if self.config.pairwise_vote {
            layers.extend(voted.layers().cloned());
        }
        layers
    }

    /// Phases of a pairwise run: every configured pair aligned between raw
    /// sections, optionally followed by triangle voting
    ///
    /// # Errors
    ///
    /// Returns an error if a pair's offset is not registered
    pub fn pairwise_phases(&self) -> Result<Vec<Phase>> {
        let chunks = self.chunks();
        let mip = self.config.mip;
        let pairs = self.pairwise_pairs();
        let (raw, voted) = self.pairwise_fields();

        let mut computes = Vec::new();
        for (source, target) in &pairs {
            let dst = raw.volume(target - source)?;
            computes.extend(chunks.iter().map(|bbox| {
                Task::ComputeField(ComputeFieldTask {
                    source: ImageRef::new(self.source.clone(), *source),
                    target: ImageRef::new(self.source.clone(), *target),
                    dst: dst.clone(),
                    bbox: *bbox,
                    mip,
                    pad: self.pad(),
                    model: self.model(*source),
                    prev_field: None,
                    backups: Vec::new(),
                    reference_bbox: self.config.bbox,
                })
            }));
        }
        let mut phases: Vec<Phase> = self
            .phase("pairwise/compute_field".to_string(), computes)
            .into_iter()
            .collect();

        if self.config.pairwise_vote {
            let computed: HashSet<(i64, i64)> = pairs.iter().copied().collect();
            let mut votes = Vec::new();
            for (source, target) in &pairs {
                let eligible: Vec<i64> = pairs
                    .iter()
                    .filter(|(s, k)| s == source && k != target && computed.contains(&(*k, *target)))
                    .map(|(_, k)| *k)
                    .collect();
                let intermediaries =
                    select_intermediaries(*source, *target, &eligible, DEFAULT_INTERMEDIARIES, self.config.seed);
                votes.extend(chunks.iter().map(|bbox| {
                    Task::PairwiseVote(PairwiseVoteTask {
                        fields: raw.clone(),
                        voted: voted.clone(),
                        source: *source,
                        target: *target,
                        intermediaries: intermediaries.clone(),
                        bbox: *bbox,
                        vote: self.vote_config(),
                    })
                }));
            }
            phases.extend(self.phase("pairwise/vote".to_string(), votes));
        }
        Ok(phases)
    }

    /// Execute phases in order, each behind its barrier
    ///
    /// # Errors
    ///
    /// Returns the first phase failure; later phases are not started
    pub fn run(
        &self,
        phases: &[Phase],
        executor: &dyn PhaseExecutor,
        progress: &ProgressManager,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!(phases = phases.len(), blocks = self.plan.blocks.len(), "starting run");
        for phase in phases {
            let span = info_span!("phase", name = %phase.name);
            let _entered = span.enter();
            let bar = progress.phase_bar(&phase.name, phase.tasks.len());
            let report = executor.run_phase(phase, &bar)?;
            progress.finish_phase(&bar, &report);
            info!(
                executed = report.executed,
                skipped = report.skipped,
                elapsed_ms = report.elapsed.as_millis(),
                "phase complete"
            );
            summary.phases.push(report);
        }
        summary.elapsed = started.elapsed();
        info!(
            executed = summary.executed(),
            skipped = summary.skipped(),
            elapsed_s = summary.elapsed.as_secs_f64(),
            "run complete"
        );
        Ok(summary)
    }
}
