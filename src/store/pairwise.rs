//! Pairwise field store
//!
//! Fields between section pairs are kept in one volume per z offset
//! (`target - source`), each indexed by the source section. Multi-hop paths
//! are composed on the fly from the per-hop volumes.

use crate::field::algebra::compose_chain;
use crate::field::tensor::Field;
use crate::io::error::{AlignError, Result, invalid_parameter};
use crate::spatial::bbox::BoundingBox;
use crate::store::tensor_store::{LayerHandle, TensorStore};
use crate::store::volumes::{read_field, write_field};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// Registry of per-offset field volumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseFields {
    volumes: BTreeMap<i64, LayerHandle>,
    /// Resolution the fields are stored at
    pub mip: u32,
    /// Context in mip 0 pixels read around each hop before composing
    pub pad: i64,
}

impl PairwiseFields {
    /// One `i16` field volume per offset under `prefix`
    pub fn new(prefix: &str, offsets: impl IntoIterator<Item = i64>, chunk: [u32; 2], mip: u32, pad: i64) -> Self {
        let volumes = offsets
            .into_iter()
            .filter(|offset| *offset != 0)
            .map(|offset| (offset, LayerHandle::field(format!("{prefix}/{offset}"), chunk)))
            .collect();
        Self { volumes, mip, pad }
    }

    /// Registered offsets in increasing order
    pub fn offsets(&self) -> Vec<i64> {
        self.volumes.keys().copied().collect()
    }

    /// Every registered volume
    pub fn layers(&self) -> impl Iterator<Item = &LayerHandle> {
        self.volumes.values()
    }

    /// Volume holding fields from `source` to `source + offset`
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::MissingOffset`] for unregistered offsets
    pub fn volume(&self, offset: i64) -> Result<&LayerHandle> {
        self.volumes
            .get(&offset)
            .ok_or_else(|| AlignError::MissingOffset {
                offset,
                available: self.offsets(),
            })
    }

    /// Read the stored field aligning `source` to `target`
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::MissingOffset`] if `target - source` is not
    /// registered, or a store failure
    pub fn read(&self, store: &dyn TensorStore, target: i64, source: i64, bbox: &BoundingBox) -> Result<Field> {
        let layer = self.volume(target - source)?;
        read_field(store, layer, self.mip, bbox, source)
    }

    /// Store the field aligning `source` to `target`
    ///
    /// # Errors
    ///
    /// Returns [`AlignError::MissingOffset`] if `target - source` is not
    /// registered, or a store failure
    pub fn write(
        &self,
        store: &dyn TensorStore,
        target: i64,
        source: i64,
        bbox: &BoundingBox,
        field: &Field,
    ) -> Result<()> {
        let layer = self.volume(target - source)?;
        write_field(store, layer, bbox, source, field)
    }

    /// Field along a path of sections, written from the final target back to
    /// the source: `[t, s]` is a direct lookup, `[t, k, s]` composes the hop
    /// from `k` to `t` with the hop from `s` to `k`
    ///
    /// Every hop is read over the box grown by `pad` so that composition has
    /// context at the border, then the result is cropped back to `bbox`.
    ///
    /// # Errors
    ///
    /// Fails before any read with [`AlignError::MissingOffset`] if a hop's
    /// offset is not registered, and with an invalid parameter error for a
    /// path shorter than two sections
    pub fn compose_path(&self, store: &dyn TensorStore, path: &[i64], bbox: &BoundingBox) -> Result<Field> {
        if path.len() < 2 {
            return Err(invalid_parameter(
                "path",
                &format!("{path:?}"),
                &"a path needs a target and a source",
            ));
        }
        for hop in path.windows(2) {
            if let [target, source] = hop {
                self.volume(target - source)?;
            }
        }
        if let [target, source] = path {
            return self.read(store, *target, *source, bbox);
        }

        trace!(?path, %bbox, "composing pairwise path");
        let padded = bbox.uncrop(self.pad);
        let hops = path
            .windows(2)
            .filter_map(|hop| match hop {
                [target, source] => Some(self.read(store, *target, *source, &padded)),
                _ => None,
            })
            .collect::<Result<Vec<_>>>()?;
        let composed = compose_chain(&hops)?;
        let margin = (self.pad >> self.mip).max(0) as usize;
        Ok(composed.crop(margin))
    }
}
