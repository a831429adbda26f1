//! Buffer directory of the raw-data block and decoded-sample recycling.
//!
//! The raw-data block is a run of sample buffers, optionally interrupted
//! by skip markers standing for buffers that were never written. A single
//! pass over the block's entries yields a partition of the sample axis
//! into descriptors; decoded samples are cached in a fixed set of pool
//! slots that are reclaimed round-robin, with a revocable token telling a
//! descriptor whether its slot still belongs to it.

use ndarray::Array2;
use std::cell::Cell;
use std::io::{Read, Seek};
use std::rc::Rc;

use crate::error::{RawError, Result};
use crate::tags::{block, kind, SampleEncoding, TagRecord, TagStore};
use crate::tree::BlockTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Samples stored on disk.
    Data,
    /// A skipped stretch; reads inside it yield zeros.
    Skip,
}

/// One stretch of the sample axis. `first..=last` are absolute sample
/// numbers; `slot`/`token` point at cached decoded samples when valid.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub first: i64,
    pub last: i64,
    pub nsamp: usize,
    pub kind: BufferKind,
    pub record: Option<TagRecord>,
    pub slot: Option<usize>,
    pub token: Option<Rc<Cell<bool>>>,
    /// Compensation grade the cached samples are stamped with.
    pub grade: i32,
}

impl BufferDescriptor {
    pub fn contains(&self, sample: i64) -> bool {
        sample >= self.first && sample <= self.last
    }

    /// Slot index if the cached copy is still owned by this descriptor.
    pub fn cached_slot(&self) -> Option<usize> {
        match (&self.token, self.slot) {
            (Some(token), Some(slot)) if token.get() => Some(slot),
            _ => None,
        }
    }

    pub fn drop_cache(&mut self) {
        self.slot = None;
        self.token = None;
    }
}

/// Ordered directory of the raw-data block.
pub struct BufferIndex {
    descriptors: Vec<BufferDescriptor>,
    first_sample: i64,
    nchan: usize,
}

impl BufferIndex {
    /// Scan the raw-data block's entries into a contiguous partition.
    ///
    /// A FIRST_SAMPLE tag sets the stream origin. A skip marker before the
    /// first buffer shifts the origin by whole (yet unseen) buffer lengths;
    /// with `renumber` the origin is forced to zero instead and the leading
    /// skip is discarded. Mid-stream skip markers are held until the next
    /// buffer reveals the nominal buffer length, then emitted as zero
    /// stretches.
    pub fn scan<R: Read + Seek>(
        store: &mut TagStore<R>,
        tree: &BlockTree,
        nchan: usize,
        renumber: bool,
    ) -> Result<Self> {
        let raw_nodes = tree.find_by_type(tree.root(), block::RAW_DATA);
        let raw = *raw_nodes
            .first()
            .ok_or_else(|| RawError::MissingData("raw data block".into()))?;

        let mut first_sample: i64 = 0;
        let mut leading_skip: i64 = 0;
        let mut pending_skip: i64 = 0;
        let mut descriptors: Vec<BufferDescriptor> = Vec::new();
        let mut next_first: i64 = 0;

        for rec in tree.node(raw).entries.iter() {
            match rec.kind {
                kind::FIRST_SAMPLE if descriptors.is_empty() => {
                    first_sample = i64::from(store.read_at(rec.pos)?.as_i32()?);
                }
                kind::DATA_SKIP => {
                    let count = i64::from(store.read_at(rec.pos)?.as_i32()?);
                    if descriptors.is_empty() {
                        leading_skip += count;
                    } else {
                        pending_skip += count;
                    }
                }
                kind::DATA_BUFFER => {
                    let enc = SampleEncoding::from_type(rec.dtype)?;
                    let bytes = rec.size as usize;
                    if nchan == 0 || bytes % (nchan * enc.width()) != 0 {
                        return Err(RawError::Structural(format!(
                            "data buffer of {} bytes does not divide into {} channels",
                            bytes, nchan
                        )));
                    }
                    let nsamp = bytes / (nchan * enc.width());
                    if nsamp == 0 {
                        return Err(RawError::Structural(format!(
                            "zero-length data buffer at offset {}",
                            rec.pos
                        )));
                    }

                    if descriptors.is_empty() {
                        if renumber {
                            first_sample = 0;
                        } else {
                            first_sample += leading_skip * nsamp as i64;
                        }
                        next_first = first_sample;
                    }
                    if pending_skip > 0 {
                        let skipped = pending_skip * nsamp as i64;
                        descriptors.push(BufferDescriptor {
                            first: next_first,
                            last: next_first + skipped - 1,
                            nsamp: skipped as usize,
                            kind: BufferKind::Skip,
                            record: None,
                            slot: None,
                            token: None,
                            grade: 0,
                        });
                        next_first += skipped;
                        pending_skip = 0;
                    }
                    descriptors.push(BufferDescriptor {
                        first: next_first,
                        last: next_first + nsamp as i64 - 1,
                        nsamp,
                        kind: BufferKind::Data,
                        record: Some(*rec),
                        slot: None,
                        token: None,
                        grade: 0,
                    });
                    next_first += nsamp as i64;
                }
                _ => {}
            }
        }

        if descriptors.is_empty() {
            return Err(RawError::MissingData("raw data block holds no buffers".into()));
        }
        if pending_skip > 0 {
            // trailing skip with no buffer after it; the nominal buffer
            // length comes from the preceding data descriptor
            let nominal = descriptors
                .iter()
                .rev()
                .find(|d| d.kind == BufferKind::Data)
                .map(|d| d.nsamp as i64)
                .unwrap_or(0);
            let skipped = pending_skip * nominal;
            if skipped > 0 {
                descriptors.push(BufferDescriptor {
                    first: next_first,
                    last: next_first + skipped - 1,
                    nsamp: skipped as usize,
                    kind: BufferKind::Skip,
                    record: None,
                    slot: None,
                    token: None,
                    grade: 0,
                });
            }
        }
        log::debug!(
            "buffer index: {} descriptor(s), samples {}..={}",
            descriptors.len(),
            first_sample,
            descriptors.last().map(|d| d.last).unwrap_or(first_sample)
        );
        Ok(Self {
            descriptors,
            first_sample,
            nchan,
        })
    }

    pub fn nchan(&self) -> usize {
        self.nchan
    }

    pub fn first_sample(&self) -> i64 {
        self.first_sample
    }

    pub fn last_sample(&self) -> i64 {
        self.descriptors.last().map(|d| d.last).unwrap_or(0)
    }

    pub fn n_samples(&self) -> usize {
        self.descriptors.iter().map(|d| d.nsamp).sum()
    }

    pub fn descriptors(&self) -> &[BufferDescriptor] {
        &self.descriptors
    }

    pub fn descriptor_mut(&mut self, idx: usize) -> &mut BufferDescriptor {
        &mut self.descriptors[idx]
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptor covering an absolute sample number, by binary search.
    pub fn locate(&self, sample: i64) -> Option<usize> {
        if sample < self.first_sample || sample > self.last_sample() {
            return None;
        }
        let idx = self
            .descriptors
            .partition_point(|d| d.last < sample);
        (idx < self.descriptors.len()).then_some(idx)
    }

    /// Drop every cached slot reference, e.g. after the pool was resized.
    pub fn drop_caches(&mut self) {
        for d in &mut self.descriptors {
            d.drop_cache();
        }
    }
}

struct RingSlot {
    data: Array2<f32>,
    owner: Option<Rc<Cell<bool>>>,
}

/// Fixed set of decoded-sample arrays handed out strictly round-robin.
/// Reassigning a slot clears the previous owner's token, so stale
/// descriptor caches are detected without back-pointers.
pub struct RingBufferPool {
    slots: Vec<RingSlot>,
    cursor: usize,
}

impl RingBufferPool {
    pub fn new(n_slots: usize) -> Self {
        let n = n_slots.max(2);
        Self {
            slots: (0..n)
                .map(|_| RingSlot {
                    data: Array2::zeros((0, 0)),
                    owner: None,
                })
                .collect(),
            cursor: 0,
        }
    }

    /// Size the pool by a memory budget for `rows x cols` f32 blocks.
    pub fn with_budget(budget_bytes: usize, rows: usize, cols: usize) -> Self {
        let per_block = (rows * cols * std::mem::size_of::<f32>()).max(1);
        Self::new(budget_bytes / per_block)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Claim the next slot, sized `rows x cols`, revoking its previous
    /// owner. Returns the slot index and the new validity token.
    pub fn allocate(&mut self, rows: usize, cols: usize) -> (usize, Rc<Cell<bool>>) {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.slots.len();

        if let Some(old) = self.slots[idx].owner.take() {
            old.set(false);
        }
        if self.slots[idx].data.dim() != (rows, cols) {
            self.slots[idx].data = Array2::zeros((rows, cols));
        }
        let token = Rc::new(Cell::new(true));
        self.slots[idx].owner = Some(Rc::clone(&token));
        (idx, token)
    }

    pub fn slot(&self, idx: usize) -> &Array2<f32> {
        &self.slots[idx].data
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut Array2<f32> {
        &mut self.slots[idx].data
    }
}
