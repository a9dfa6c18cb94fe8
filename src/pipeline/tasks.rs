//! Chunk tasks
//!
//! Each task operates on one processing chunk of one section and is fully
//! described by plain data, so it can be executed in-process or serialized
//! to JSON and handed to a remote worker. A task reads everything it needs
//! from storage and writes its result back; tasks in one phase never write
//! the same storage chunk.

use crate::field::algebra::{
    compose_chain, compose_fields, profile_field, rel_to_abs, shift_field, upsample_field,
};
use crate::field::tensor::Field;
use crate::io::error::{AlignError, Result, ensure_shape, invalid_parameter};
use crate::math::filters::block_correlation;
use crate::pipeline::context::TaskContext;
use crate::pipeline::render::{downsample, fill_missing, missing_data_mask, render};
use crate::spatial::bbox::BoundingBox;
use crate::store::pairwise::PairwiseFields;
use crate::store::tensor_store::{LayerHandle, TensorStore};
use crate::store::volumes::{FieldRef, ImageRef, read_image, write_field, write_plane};
use crate::voting::consensus::{VoteConfig, vector_vote};
use crate::voting::pairwise::pairwise_vote;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Read a field over `bbox` grown by `pad` and bring it to `mip`
fn read_padded(store: &dyn TensorStore, field: &FieldRef, bbox: &BoundingBox, pad: i64, mip: u32) -> Result<Field> {
    let raw = field.read(store, &bbox.uncrop(pad))?;
    upsample_field(&raw, field.mip, mip)
}

const fn margin(pad: i64, mip: u32) -> usize {
    let cells = pad >> mip;
    if cells > 0 { cells as usize } else { 0 }
}

/// Copy one chunk of a layer section to another layer or section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTask {
    /// Layer read from
    pub src: LayerHandle,
    /// Section read from
    pub src_z: i64,
    /// Layer written to
    pub dst: LayerHandle,
    /// Section written to
    pub dst_z: i64,
    /// Chunk in mip 0 pixels
    pub bbox: BoundingBox,
    /// Resolution of the copy
    pub mip: u32,
}

impl CopyTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        if self.src.channels != self.dst.channels {
            return Err(invalid_parameter(
                "dst",
                &self.dst.path,
                &format!("channel count {} differs from source {}", self.dst.channels, self.src.channels),
            ));
        }
        let data = ctx.store().read(&self.src, self.mip, &self.bbox, self.src_z)?;
        ctx.store()
            .write(&self.dst, self.mip, &self.bbox, self.dst_z, &data.view())
    }
}

/// Predict the field aligning one source section to one target section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeFieldTask {
    /// Image being aligned
    pub source: ImageRef,
    /// Image aligned to
    pub target: ImageRef,
    /// Field layer written at the source section
    pub dst: LayerHandle,
    /// Chunk in mip 0 pixels
    pub bbox: BoundingBox,
    /// Resolution of the prediction
    pub mip: u32,
    /// Context read around the chunk, in mip 0 pixels
    pub pad: i64,
    /// Registered predictor name
    pub model: String,
    /// Field of the target, whose bulk drift pre-shifts the source window
    pub prev_field: Option<FieldRef>,
    /// Sections substituted, in order, where the target is missing data
    pub backups: Vec<ImageRef>,
    /// Imaged area; missing pixels outside it are never substituted
    pub reference_bbox: BoundingBox,
}

impl ComputeFieldTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let store = ctx.store();
        let drift = match &self.prev_field {
            Some(prev) => profile_field(&upsample_field(&prev.read(store, &self.bbox)?, prev.mip, self.mip)?),
            None => [0, 0],
        };
        let padded = self.bbox.uncrop(self.pad);
        let source = self.source.read(store, self.mip, &padded.translate(drift))?;
        let mut target = self.target.read(store, self.mip, &padded)?;

        for backup in &self.backups {
            let mask = missing_data_mask(&target.view(), &padded, &self.reference_bbox, self.mip);
            if !mask.iter().any(|missing| *missing) {
                break;
            }
            let substitute = backup.read(store, self.mip, &padded)?;
            let filled = fill_missing(&mut target, &substitute.view(), &mask)?;
            debug!(z = self.target.z, backup = backup.z, filled, "substituted missing target data");
        }

        let model = ctx.models.get(&self.model)?;
        let relative = model.predict_field(self.mip, &source.view(), &target.view())?;
        let absolute = rel_to_abs(&relative, &padded, self.mip)?;
        let field = shift_field(&absolute.crop(margin(self.pad, self.mip)), [-drift[0], -drift[1]])?;
        trace!(src = self.source.z, tgt = self.target.z, ?drift, "field computed");
        write_field(store, &self.dst, &self.bbox, self.source.z, &field)
    }
}

/// Vote among candidate fields for one section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorVoteTask {
    /// Candidates, each a chain of fields ordered from the last hop to the
    /// first; a single entry is read directly
    pub candidates: Vec<Vec<FieldRef>>,
    /// Field layer receiving the consensus
    pub dst: LayerHandle,
    /// Layer receiving the per-pixel confidence, if kept
    pub confidence: Option<LayerHandle>,
    /// Section voted for
    pub z: i64,
    /// Chunk in mip 0 pixels
    pub bbox: BoundingBox,
    /// Resolution of the vote
    pub mip: u32,
    /// Context read around each hop of a chain, in mip 0 pixels
    pub pad: i64,
    /// Softmin settings
    pub vote: VoteConfig,
}

impl VectorVoteTask {
    fn candidate(&self, store: &dyn TensorStore, chain: &[FieldRef]) -> Result<Field> {
        match chain {
            [] => Err(AlignError::NoCandidates { z: self.z }),
            [single] => read_padded(store, single, &self.bbox, 0, self.mip),
            hops => {
                let fields = hops
                    .iter()
                    .map(|hop| read_padded(store, hop, &self.bbox, self.pad, self.mip))
                    .collect::<Result<Vec<_>>>()?;
                Ok(compose_chain(&fields)?.crop(margin(self.pad, self.mip)))
            }
        }
    }

    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let store = ctx.store();
        let fields = self
            .candidates
            .iter()
            .map(|chain| self.candidate(store, chain))
            .collect::<Result<Vec<_>>>()?;
        let consensus = vector_vote(&fields, &self.vote, self.z)?;
        trace!(z = self.z, voters = consensus.voters, "vote finished");
        write_field(store, &self.dst, &self.bbox, self.z, &consensus.field)?;
        if let Some(layer) = &self.confidence {
            write_plane(store, layer, self.mip, &self.bbox, self.z, &consensus.confidence.view())?;
        }
        Ok(())
    }
}

/// Warp one chunk of a section through its field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderTask {
    /// Image warped
    pub image: ImageRef,
    /// Field applied, identity when absent
    pub field: Option<FieldRef>,
    /// Image layer written
    pub dst: LayerHandle,
    /// Section written
    pub dst_z: i64,
    /// Chunk in mip 0 pixels
    pub bbox: BoundingBox,
    /// Resolution of the output
    pub mip: u32,
    /// Residual displacement the read window covers, in mip 0 pixels
    pub pad: i64,
}

impl RenderTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let store = ctx.store();
        let field = self
            .field
            .as_ref()
            .map(|field| read_padded(store, field, &self.bbox, 0, self.mip))
            .transpose()?;
        let rendered = render(store, &self.image, field.as_ref(), &self.bbox, self.mip, self.pad)?;
        write_plane(store, &self.dst, self.mip, &self.bbox, self.dst_z, &rendered.view())
    }
}

/// Compose two stored fields, resampling through `inner` then `outer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeTask {
    /// Field applied last
    pub outer: FieldRef,
    /// Field applied first
    pub inner: FieldRef,
    /// Field layer written
    pub dst: LayerHandle,
    /// Section written
    pub dst_z: i64,
    /// Chunk in mip 0 pixels
    pub bbox: BoundingBox,
    /// Resolution of the result
    pub mip: u32,
    /// Context read around the chunk, in mip 0 pixels
    pub pad: i64,
}

impl ComposeTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let store = ctx.store();
        let outer = read_padded(store, &self.outer, &self.bbox, self.pad, self.mip)?;
        let inner = read_padded(store, &self.inner, &self.bbox, self.pad, self.mip)?;
        let composed = compose_fields(&outer, &inner)?.crop(margin(self.pad, self.mip));
        write_field(store, &self.dst, &self.bbox, self.dst_z, &composed)
    }
}

/// Invert one chunk of a stored field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertTask {
    /// Field inverted
    pub field: FieldRef,
    /// Field layer written
    pub dst: LayerHandle,
    /// Section written
    pub dst_z: i64,
    /// Chunk in mip 0 pixels
    pub bbox: BoundingBox,
    /// Resolution of the result
    pub mip: u32,
    /// Context read around the chunk, in mip 0 pixels
    pub pad: i64,
}

impl InvertTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let store = ctx.store();
        let field = read_padded(store, &self.field, &self.bbox, self.pad, self.mip)?;
        let inverse = ctx.inverter.invert(&field)?.crop(margin(self.pad, self.mip));
        write_field(store, &self.dst, &self.bbox, self.dst_z, &inverse)
    }
}

/// Build one chunk of `mip` from the level below by 2x2 averaging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsampleTask {
    /// Single channel layer read and written
    pub layer: LayerHandle,
    /// Section
    pub z: i64,
    /// Chunk in mip 0 pixels, integral at `mip`
    pub bbox: BoundingBox,
    /// Level written, read from `mip - 1`
    pub mip: u32,
}

impl DownsampleTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let finer = self.mip.checked_sub(1).ok_or_else(|| {
            invalid_parameter("mip", &self.mip, &"mip 0 has no finer level")
        })?;
        let store = ctx.store();
        let plane = read_image(store, &self.layer, finer, &self.bbox, self.z)?;
        let coarse = downsample(&plane.view());
        write_plane(store, &self.layer, self.mip, &self.bbox, self.z, &coarse.view())
    }
}

/// Replace one pairwise field by its vote against two-hop estimates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseVoteTask {
    /// Pairwise fields read
    pub fields: PairwiseFields,
    /// Pairwise fields written
    pub voted: PairwiseFields,
    /// Source section of the pair
    pub source: i64,
    /// Target section of the pair
    pub target: i64,
    /// Sections routed through for the two-hop estimates
    pub intermediaries: Vec<i64>,
    /// Chunk in mip 0 pixels
    pub bbox: BoundingBox,
    /// Softmin settings
    pub vote: VoteConfig,
}

impl PairwiseVoteTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let store = ctx.store();
        let consensus = pairwise_vote(
            store,
            &self.fields,
            self.source,
            self.target,
            &self.intermediaries,
            &self.bbox,
            &self.vote,
        )?;
        self.voted
            .write(store, self.target, self.source, &self.bbox, &consensus.field)
    }
}

/// Score neighbouring sections by blockwise Pearson correlation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelateTask {
    /// Image layer compared
    pub image: LayerHandle,
    /// Section scored
    pub z: i64,
    /// Section it is compared with
    pub neighbour: i64,
    /// Scalar layer written at `z`
    pub dst: LayerHandle,
    /// Chunk in mip 0 pixels, integral at `dst_mip`
    pub bbox: BoundingBox,
    /// Resolution the images are read at
    pub mip: u32,
    /// Resolution of the score map, one value per `2^(dst_mip - mip)` block
    pub dst_mip: u32,
}

impl CorrelateTask {
    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        let store = ctx.store();
        let a = read_image(store, &self.image, self.mip, &self.bbox, self.z)?;
        let b = read_image(store, &self.image, self.mip, &self.bbox, self.neighbour)?;
        ensure_shape("CorrelateTask", a.shape(), b.shape())?;
        let block = 1_usize << self.dst_mip.saturating_sub(self.mip);
        let scores = block_correlation(&a.view(), &b.view(), block);
        write_plane(store, &self.dst, self.dst_mip, &self.bbox, self.z, &scores.view())
    }
}

/// Every kind of chunk task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Raw chunk copy
    Copy(CopyTask),
    /// Field prediction
    ComputeField(ComputeFieldTask),
    /// Softmin vote
    VectorVote(VectorVoteTask),
    /// Warp through a field
    Render(RenderTask),
    /// Field composition
    Compose(ComposeTask),
    /// Field inversion
    Invert(InvertTask),
    /// Pyramid level
    Downsample(DownsampleTask),
    /// Triangle-consistency vote
    PairwiseVote(PairwiseVoteTask),
    /// Neighbour correlation
    Correlate(CorrelateTask),
}

impl Task {
    /// Run the task against `ctx`
    ///
    /// # Errors
    ///
    /// Returns the first storage, model or numerical failure
    pub fn execute(&self, ctx: &TaskContext) -> Result<()> {
        match self {
            Self::Copy(task) => task.execute(ctx),
            Self::ComputeField(task) => task.execute(ctx),
            Self::VectorVote(task) => task.execute(ctx),
            Self::Render(task) => task.execute(ctx),
            Self::Compose(task) => task.execute(ctx),
            Self::Invert(task) => task.execute(ctx),
            Self::Downsample(task) => task.execute(ctx),
            Self::PairwiseVote(task) => task.execute(ctx),
            Self::Correlate(task) => task.execute(ctx),
        }
    }

    /// Short name of the task kind
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Copy(_) => "copy",
            Self::ComputeField(_) => "compute_field",
            Self::VectorVote(_) => "vector_vote",
            Self::Render(_) => "render",
            Self::Compose(_) => "compose",
            Self::Invert(_) => "invert",
            Self::Downsample(_) => "downsample",
            Self::PairwiseVote(_) => "pairwise_vote",
            Self::Correlate(_) => "correlate",
        }
    }

    /// Chunk the task covers
    pub const fn bbox(&self) -> &BoundingBox {
        match self {
            Self::Copy(task) => &task.bbox,
            Self::ComputeField(task) => &task.bbox,
            Self::VectorVote(task) => &task.bbox,
            Self::Render(task) => &task.bbox,
            Self::Compose(task) => &task.bbox,
            Self::Invert(task) => &task.bbox,
            Self::Downsample(task) => &task.bbox,
            Self::PairwiseVote(task) => &task.bbox,
            Self::Correlate(task) => &task.bbox,
        }
    }

    /// Marker name, unique among the tasks of one phase
    pub fn marker_leaf(&self) -> String {
        match self {
            Self::Copy(task) => task.bbox.stringify(task.dst_z),
            Self::ComputeField(task) => {
                format!("{}_{}", task.bbox.stringify(task.source.z), task.target.z)
            }
            Self::VectorVote(task) => task.bbox.stringify(task.z),
            Self::Render(task) => task.bbox.stringify(task.dst_z),
            Self::Compose(task) => task.bbox.stringify(task.dst_z),
            Self::Invert(task) => task.bbox.stringify(task.dst_z),
            Self::Downsample(task) => task.bbox.stringify(task.z),
            Self::PairwiseVote(task) => format!("{}_{}", task.bbox.stringify(task.source), task.target),
            Self::Correlate(task) => task.bbox.stringify(task.z),
        }
    }

    /// Every section the task reads or writes
    pub fn sections(&self) -> Vec<i64> {
        let mut sections = match self {
            Self::Copy(task) => vec![task.src_z, task.dst_z],
            Self::ComputeField(task) => {
                let mut zs = vec![task.source.z, task.target.z];
                zs.extend(task.prev_field.iter().map(|f| f.z));
                zs.extend(task.backups.iter().map(|b| b.z));
                zs
            }
            Self::VectorVote(task) => {
                let mut zs = vec![task.z];
                zs.extend(task.candidates.iter().flatten().map(|f| f.z));
                zs
            }
            Self::Render(task) => {
                let mut zs = vec![task.image.z, task.dst_z];
                zs.extend(task.field.iter().map(|f| f.z));
                zs
            }
            Self::Compose(task) => vec![task.outer.z, task.inner.z, task.dst_z],
            Self::Invert(task) => vec![task.field.z, task.dst_z],
            Self::Downsample(task) => vec![task.z],
            Self::PairwiseVote(task) => {
                let mut zs = vec![task.source, task.target];
                zs.extend(&task.intermediaries);
                zs
            }
            Self::Correlate(task) => vec![task.z, task.neighbour],
        };
        sections.sort_unstable();
        sections.dedup();
        sections
    }
}

/// A task tagged with the marker prefix of its phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkTask {
    /// Marker prefix of the owning phase
    pub prefix: String,
    /// The work itself
    pub task: Task,
}

impl ChunkTask {
    /// Tag `task` with a phase prefix
    pub fn new(prefix: impl Into<String>, task: Task) -> Self {
        Self {
            prefix: prefix.into(),
            task,
        }
    }

    /// Completion marker key
    pub fn marker_key(&self) -> String {
        format!("{}/{}", self.prefix, self.task.marker_leaf())
    }

    /// Serialize for a task queue
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the task cannot be encoded
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|source| AlignError::Serialization {
            context: "chunk task",
            source,
        })
    }

    /// Decode a task leased from a queue
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed payloads
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|source| AlignError::Serialization {
            context: "chunk task",
            source,
        })
    }

    /// Execute, wrapping any failure with the marker key
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::TaskFailed`] carrying the underlying error
    pub fn execute(&self, ctx: &TaskContext) -> Result<()> {
        self.task.execute(ctx).map_err(|source| AlignError::TaskFailed {
            task: format!("{} {}", self.task.kind(), self.marker_key()),
            source: Box::new(source),
        })
    }
}
