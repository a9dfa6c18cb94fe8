//! Block partitioning and layer layout
//!
//! The z range is cut into blocks of `block_size` nominal sections. Each
//! block lists its own usable sections followed by the first `overlap`
//! usable sections of what comes after, so neighbouring blocks share exactly
//! `overlap` sections. Within a block one anchor section is copied as is,
//! the sections before it are aligned serially towards it, and every section
//! after it votes over the `overlap` sections preceding it.

use crate::io::configuration::AlignConfig;
use crate::io::error::{Result, invalid_parameter};
use crate::spatial::skip::SkipList;
use crate::store::pairwise::PairwiseFields;
use crate::store::tensor_store::LayerHandle;
use std::collections::BTreeSet;
use std::fmt;

/// Which of the two alternating volume sets a block writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parity {
    /// Blocks 0, 2, 4, ...
    Even,
    /// Blocks 1, 3, 5, ...
    Odd,
}

impl Parity {
    /// Parity of block `index`
    pub const fn of(index: usize) -> Self {
        if index % 2 == 0 { Self::Even } else { Self::Odd }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Even => f.write_str("even"),
            Self::Odd => f.write_str("odd"),
        }
    }
}

/// What a block position does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Copied unchanged; fixes the block's frame
    Copy,
    /// Aligned to the next section in the block only
    Serial {
        /// The one target
        target: i64,
    },
    /// Aligned to several preceding sections and voted
    Vote {
        /// Targets, nearest first
        targets: Vec<i64>,
    },
}

/// One block of consecutive usable sections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Position of the block in the run
    pub index: usize,
    /// Owned sections followed by the overlap into the next block
    pub sections: Vec<i64>,
    /// Number of leading sections the block owns
    pub owned: usize,
    /// Position of the copied section
    pub anchor: usize,
}

impl Block {
    /// Volume set the block writes to
    pub const fn parity(&self) -> Parity {
        Parity::of(self.index)
    }

    /// First section of the block
    pub fn start(&self) -> Option<i64> {
        self.sections.first().copied()
    }

    /// Sections whose final field comes from this block
    pub fn owned_sections(&self) -> &[i64] {
        self.sections.get(..self.owned).unwrap_or(&self.sections)
    }

    /// Sections shared with the previous block, up to and including the anchor
    pub fn starters(&self) -> &[i64] {
        self.sections.get(..=self.anchor).unwrap_or(&self.sections)
    }

    /// Section at a position
    pub fn section(&self, position: usize) -> Option<i64> {
        self.sections.get(position).copied()
    }

    /// Role of the section at `position`
    pub fn role(&self, position: usize, skip: &SkipList, overlap: usize) -> Option<Role> {
        let z = self.section(position)?;
        if position == self.anchor {
            return Some(Role::Copy);
        }
        if position < self.anchor {
            return self.section(position + 1).map(|target| Role::Serial { target });
        }
        let offsets: Vec<i64> = (1..=overlap as i64).map(|step| -step).collect();
        let first = self.start()?;
        let targets = skip
            .extend_offsets(z, &offsets)
            .into_iter()
            .map(|offset| z + offset)
            .filter(|target| *target >= first)
            .collect();
        Some(Role::Vote { targets })
    }

    /// Positions in execution order: anchor, serial positions walking back to
    /// the start, then vote positions walking forward
    pub fn step_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..=self.anchor).rev().collect();
        order.extend(self.anchor + 1..self.sections.len());
        order
    }
}

/// The full block decomposition of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    /// Blocks in z order
    pub blocks: Vec<Block>,
    /// Sections shared by neighbouring blocks, also the voting radius
    pub overlap: usize,
    /// Sections never used
    pub skip: SkipList,
}

impl BlockPlan {
    /// Partition the configured z range into blocks
    ///
    /// Nominal groups of `block_size` sections own their usable sections.
    /// A group owning fewer than `overlap`, none at all when every section
    /// is skipped, is merged into its predecessor; a short first group takes
    /// in the group after it. Every later block can then stitch to the one
    /// before it.
    ///
    /// # Errors
    ///
    /// Returns an error if no section in the range is usable
    pub fn build(config: &AlignConfig) -> Result<Self> {
        let skip = SkipList::new(config.z_start, config.z_stop, config.skip_list.iter().copied());
        let usable = skip.usable(config.z_start..config.z_stop);
        if usable.is_empty() {
            return Err(invalid_parameter(
                "skip_list",
                &format!("{:?}", config.skip_list),
                &"every section of the z range is skipped",
            ));
        }
        let overlap = config.tgt_radius;
        let block_size = config.block_size.max(1) as i64;

        let mut groups: Vec<Vec<i64>> = Vec::new();
        let mut nominal = config.z_start;
        while nominal < config.z_stop {
            let end = (nominal + block_size).min(config.z_stop);
            let owned: Vec<i64> = usable
                .iter()
                .copied()
                .filter(|z| (nominal..end).contains(z))
                .collect();
            match groups.last_mut() {
                Some(previous) if owned.len() < overlap => previous.extend(owned),
                _ if owned.is_empty() => {}
                _ => groups.push(owned),
            }
            nominal = end;
        }
        while groups.len() > 1 && groups.first().is_some_and(|g| g.len() < overlap) {
            let second = groups.remove(1);
            if let Some(first) = groups.first_mut() {
                first.extend(second);
            }
        }

        let blocks = groups
            .iter()
            .enumerate()
            .map(|(index, owned)| {
                let last = owned.last().copied().unwrap_or(config.z_start);
                let mut sections = owned.clone();
                sections.extend(usable.iter().copied().filter(|z| *z > last).take(overlap));
                Block {
                    index,
                    owned: owned.len(),
                    anchor: overlap.min(sections.len()).saturating_sub(1),
                    sections,
                }
            })
            .collect();

        Ok(Self {
            blocks,
            overlap,
            skip,
        })
    }

    /// Number of execution steps, the longest block's step order
    pub fn step_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.sections.len())
            .max()
            .unwrap_or(0)
    }

    /// Every `target - source` offset the blocks of one parity compute
    pub fn offsets(&self, parity: Parity) -> BTreeSet<i64> {
        let mut offsets = BTreeSet::new();
        for block in self.blocks.iter().filter(|b| b.parity() == parity) {
            for position in 0..block.sections.len() {
                let (Some(z), Some(role)) = (block.section(position), block.role(position, &self.skip, self.overlap)) else {
                    continue;
                };
                match role {
                    Role::Copy => {}
                    Role::Serial { target } => {
                        offsets.insert(target - z);
                    }
                    Role::Vote { targets } => offsets.extend(targets.iter().map(|t| t - z)),
                }
            }
        }
        offsets
    }

    /// Every section whose final field is produced, in z order
    pub fn owned_sections(&self) -> Vec<i64> {
        self.blocks
            .iter()
            .flat_map(|block| block.owned_sections().iter().copied())
            .collect()
    }
}

/// Names and handles of every layer a run writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    prefix: String,
    chunk: [u32; 2],
    mip: u32,
    pad: i64,
}

impl Layout {
    /// Layout under `config.dst_path`
    pub fn new(config: &AlignConfig) -> Self {
        Self {
            prefix: config.dst_path.trim_end_matches('/').to_string(),
            chunk: config.storage_chunk,
            mip: config.mip,
            pad: i64::from(config.pad),
        }
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{name}", self.prefix)
    }

    /// Marker prefix of a phase
    pub fn marker_prefix(&self, phase: &str) -> String {
        self.path(&format!("markers/{phase}"))
    }

    /// Rendered block images
    pub fn block_image(&self, parity: Parity) -> LayerHandle {
        LayerHandle::image(self.path(&format!("block/{parity}/image")), self.chunk)
    }

    /// Voted block fields
    pub fn block_field(&self, parity: Parity) -> LayerHandle {
        LayerHandle::field(self.path(&format!("block/{parity}/field")), self.chunk)
    }

    /// Voting confidence of block fields
    pub fn block_confidence(&self, parity: Parity) -> LayerHandle {
        LayerHandle::scalar(self.path(&format!("block/{parity}/confidence")), self.chunk)
    }

    /// Pairwise fields computed inside blocks
    pub fn block_pairs(&self, parity: Parity, offsets: impl IntoIterator<Item = i64>) -> PairwiseFields {
        PairwiseFields::new(&self.path(&format!("block/{parity}/pairs")), offsets, self.chunk, self.mip, self.pad)
    }

    /// Previous block's images of each block's starter sections
    pub fn stitch_image(&self) -> LayerHandle {
        LayerHandle::image(self.path("stitch/image"), self.chunk)
    }

    /// Per-section corrections between neighbouring block frames
    pub fn stitch_correction(&self) -> LayerHandle {
        LayerHandle::field(self.path("stitch/correction"), self.chunk)
    }

    /// Voted correction per block, stored at the block's first section
    pub fn stitch_vote(&self) -> LayerHandle {
        LayerHandle::field(self.path("stitch/vote"), self.chunk)
    }

    /// Running composition of corrections, stored at each block's first section
    pub fn cumulative(&self) -> LayerHandle {
        LayerHandle::field(self.path("stitch/cumulative"), self.chunk)
    }

    /// Final per-section fields
    pub fn final_field(&self) -> LayerHandle {
        LayerHandle::field(self.path("field"), self.chunk)
    }

    /// Final rendered sections
    pub fn final_image(&self) -> LayerHandle {
        LayerHandle::image(self.path("image"), self.chunk)
    }

    /// Neighbour correlation scores
    pub fn correlation(&self) -> LayerHandle {
        LayerHandle::scalar(self.path("qc/correlation"), self.chunk)
    }

    /// Raw fields of a pairwise run
    pub fn pairwise_raw(&self, offsets: impl IntoIterator<Item = i64>) -> PairwiseFields {
        PairwiseFields::new(&self.path("pairwise/raw"), offsets, self.chunk, self.mip, self.pad)
    }

    /// Voted fields of a pairwise run
    pub fn pairwise_voted(&self, offsets: impl IntoIterator<Item = i64>) -> PairwiseFields {
        PairwiseFields::new(&self.path("pairwise/voted"), offsets, self.chunk, self.mip, self.pad)
    }
}
