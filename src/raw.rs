//! Random access over a recording: decoding, calibration, compensation,
//! projection and filtering behind one sample-range interface.
//!
//! All reads funnel through a staging path that decodes whole buffers
//! into the raw pool, calibrates them and brings them to the active
//! compensation grade; picks, derivations, projection and filtering are
//! layered on top of that cache. Requested ranges may extend past either
//! end of the stream: samples before the start read as zeros, samples
//! past the end repeat the final column.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek};
use std::rc::Rc;

use crate::buffers::{BufferIndex, BufferKind, RingBufferPool};
use crate::channels::{ChannelCatalog, ChannelKind};
use crate::compensation::{CompensationOperator, SparseSelector};
use crate::error::{RawError, Result};
use crate::filter::{FilterDefinition, FilterResponseEngine};
use crate::projection::ProjectionOperator;
use crate::tags::{block, kind, TagStore};
use crate::tree::BlockTree;

/// Open-time settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderOptions {
    /// Memory budget for the decoded-sample pools.
    pub buffer_budget_bytes: usize,
    /// Renumber the sample axis to start at zero, discarding any skip
    /// before the first stored buffer.
    pub renumber_samples: bool,
    pub filter: FilterDefinition,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            buffer_budget_bytes: 256 * 1024 * 1024,
            renumber_samples: false,
            filter: FilterDefinition::default(),
        }
    }
}

/// Row selection for a pick: channel indices in output order, plus an
/// optional derivation whose synthesized rows are appended below them.
#[derive(Debug, Clone)]
pub struct ChannelSelection {
    pub picks: Vec<usize>,
    pub derivation: Option<SparseSelector>,
}

impl ChannelSelection {
    pub fn new(picks: Vec<usize>) -> Self {
        Self {
            picks,
            derivation: None,
        }
    }

    pub fn by_names(catalog: &ChannelCatalog, names: &[&str]) -> Result<Self> {
        let picks = names
            .iter()
            .map(|name| {
                catalog
                    .position(name)
                    .ok_or_else(|| RawError::MissingData(format!("channel {:?}", name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(picks))
    }

    fn out_rows(&self) -> usize {
        self.picks.len() + self.derivation.as_ref().map(|d| d.nrows()).unwrap_or(0)
    }
}

struct FilteredBlock {
    slot: usize,
    token: Rc<std::cell::Cell<bool>>,
}

pub struct RawReader<R> {
    store: TagStore<R>,
    catalog: ChannelCatalog,
    index: BufferIndex,
    comp: CompensationOperator,
    proj: Option<ProjectionOperator>,
    raw_pool: RingBufferPool,
    filt_pool: RingBufferPool,
    filter: FilterDefinition,
    engine: Option<FilterResponseEngine>,
    /// Filtered-block cache keyed by block number along the sample axis.
    filtered: HashMap<i64, FilteredBlock>,
    sample_rate: f32,
    /// Grade the stored samples are compensated at.
    file_grade: i32,
    /// Raw first-sample value per channel; `filter_baseline` maps it
    /// into the filtered data's space before it is subtracted.
    baseline: Vec<f32>,
}

impl<R: Read + Seek> RawReader<R> {
    pub fn open(reader: R, options: ReaderOptions) -> Result<Self> {
        let mut store = TagStore::open(reader)?;
        let tree = BlockTree::build(&mut store)?;
        let catalog = ChannelCatalog::from_tree(&mut store, &tree)?;

        let info = *tree
            .find_by_type(tree.root(), block::MEAS_INFO)
            .first()
            .ok_or_else(|| RawError::MissingData("measurement info block".into()))?;
        let sample_rate = tree
            .find_tag(&mut store, info, kind::SAMPLE_RATE)?
            .ok_or_else(|| RawError::MissingData("sampling rate tag".into()))?
            .as_f32()?;
        let file_grade = tree
            .find_tag(&mut store, info, kind::COMP_GRADE)?
            .map(|tag| tag.as_i32())
            .transpose()?
            .unwrap_or(0);

        let index = BufferIndex::scan(&mut store, &tree, catalog.len(), options.renumber_samples)?;
        let comp = CompensationOperator::from_tree(&mut store, &tree, &catalog)?;
        let proj = match ProjectionOperator::from_tree(&mut store, &tree)? {
            Some(mut op) => {
                op.build_basis(&catalog)?;
                Some(op)
            }
            None => None,
        };

        let nchan = catalog.len();
        let max_nsamp = index
            .descriptors()
            .iter()
            .filter(|d| d.kind == BufferKind::Data)
            .map(|d| d.nsamp)
            .max()
            .unwrap_or(1);
        let padded = options.filter.block_size + 2 * options.filter.taper_size;
        let raw_pool = RingBufferPool::with_budget(options.buffer_budget_bytes / 2, nchan, max_nsamp);
        let filt_pool = RingBufferPool::with_budget(options.buffer_budget_bytes / 2, nchan, padded);
        let engine = options
            .filter
            .enabled
            .then(|| FilterResponseEngine::new(&options.filter, sample_rate));

        log::info!(
            "opened recording: {} channels at {} Hz, samples {}..={}, {} compensation set(s), {} projection item(s)",
            nchan,
            sample_rate,
            index.first_sample(),
            index.last_sample(),
            comp.grades().len(),
            proj.as_ref().map(|p| p.items().len()).unwrap_or(0)
        );

        let mut reader = Self {
            store,
            catalog,
            index,
            comp,
            proj,
            raw_pool,
            filt_pool,
            filter: options.filter,
            engine,
            filtered: HashMap::new(),
            sample_rate,
            file_grade,
            baseline: vec![0.0; nchan],
        };
        let first_col = reader.read_segment(reader.index.first_sample(), 1)?;
        reader.baseline = (0..nchan).map(|c| first_col[[c, 0]]).collect();
        Ok(reader)
    }

    pub fn catalog(&self) -> &ChannelCatalog {
        &self.catalog
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn first_sample(&self) -> i64 {
        self.index.first_sample()
    }

    pub fn last_sample(&self) -> i64 {
        self.index.last_sample()
    }

    pub fn n_samples(&self) -> usize {
        self.index.n_samples()
    }

    pub fn compensation_grades(&self) -> Vec<i32> {
        self.comp.grades()
    }

    pub fn active_grade(&self) -> i32 {
        self.comp.active_grade()
    }

    /// Switch the working compensation grade. Cached raw buffers are not
    /// touched here; each is moved to the new grade when next read.
    pub fn set_compensation_grade(&mut self, grade: i32) -> Result<()> {
        self.comp.set_grade(grade)?;
        self.filtered.clear();
        Ok(())
    }

    /// Replace the filter settings. Responses are rebuilt only when the
    /// new definition differs beyond the corner tolerance.
    pub fn set_filter(&mut self, def: FilterDefinition) {
        if def.matches(&self.filter) {
            self.filter = def;
            return;
        }
        self.engine = def
            .enabled
            .then(|| FilterResponseEngine::new(&def, self.sample_rate));
        self.filter = def;
        self.filtered.clear();
    }

    /// Read `count` samples starting at absolute sample `first`, rows
    /// ordered per `selection` (all channels when `None`).
    pub fn pick(
        &mut self,
        selection: Option<&ChannelSelection>,
        first: i64,
        count: usize,
    ) -> Result<Array2<f32>> {
        let full = self.read_segment(first, count)?;
        self.select(selection, full)
    }

    /// Like [`pick`](Self::pick) with active projection items removed.
    /// Falls back to the plain pick when no basis exists or the picked
    /// channels are provably untouched.
    pub fn pick_projected(
        &mut self,
        selection: Option<&ChannelSelection>,
        first: i64,
        count: usize,
    ) -> Result<Array2<f32>> {
        let use_proj = match &self.proj {
            Some(op) if op.nvec() > 0 => match selection {
                Some(sel) => op.touches(&sel.picks),
                None => true,
            },
            _ => false,
        };
        if !use_proj {
            return self.pick(selection, first, count);
        }
        let mut full = self.read_segment(first, count)?;
        if let Some(op) = &self.proj {
            op.apply(&mut full, true)?;
        }
        self.select(selection, full)
    }

    /// Like [`pick_projected`](Self::pick_projected) with the band filter
    /// applied. Falls back when filtering is disabled.
    pub fn pick_filtered(
        &mut self,
        selection: Option<&ChannelSelection>,
        first: i64,
        count: usize,
    ) -> Result<Array2<f32>> {
        if self.engine.is_none() || !self.filter.enabled {
            return self.pick_projected(selection, first, count);
        }
        let mut full = self.filtered_segment(first, count)?;

        let stream_last = self.index.last_sample();
        let last_req = first + count as i64 - 1;
        if last_req > stream_last {
            let tail = self.filtered_segment(stream_last, 1)?;
            let start = (stream_last + 1).max(first);
            for s in start..=last_req {
                let dst = (s - first) as usize;
                for c in 0..self.catalog.len() {
                    full[[c, dst]] = tail[[c, 0]];
                }
            }
        }
        self.select(selection, full)
    }

    fn select(
        &self,
        selection: Option<&ChannelSelection>,
        full: Array2<f32>,
    ) -> Result<Array2<f32>> {
        let sel = match selection {
            None => return Ok(full),
            Some(sel) => sel,
        };
        let mut out = Array2::zeros((sel.out_rows(), full.ncols()));
        for (r, &p) in sel.picks.iter().enumerate() {
            if p >= self.catalog.len() {
                return Err(RawError::Structural(format!(
                    "pick {} exceeds channel count {}",
                    p,
                    self.catalog.len()
                )));
            }
            out.row_mut(r).assign(&full.row(p));
        }
        if let Some(der) = &sel.derivation {
            let derived = der.apply(&full)?;
            for r in 0..derived.nrows() {
                out.row_mut(sel.picks.len() + r).assign(&derived.row(r));
            }
        }
        Ok(out)
    }

    /// All-channel segment at the active compensation grade. Columns
    /// before the stream stay zero, columns past it repeat the last one.
    fn read_segment(&mut self, first: i64, count: usize) -> Result<Array2<f32>> {
        let nchan = self.catalog.len();
        let mut out = Array2::zeros((nchan, count));
        if count == 0 {
            return Ok(out);
        }
        let stream_first = self.index.first_sample();
        let stream_last = self.index.last_sample();
        let last_req = first + count as i64 - 1;

        let in_first = first.max(stream_first);
        let in_last = last_req.min(stream_last);
        if in_first <= in_last {
            let mut i = self.index.locate(in_first).ok_or_else(|| {
                RawError::Structural(format!("no buffer covers sample {}", in_first))
            })?;
            while i < self.index.len() {
                let (d_first, d_last, d_kind) = {
                    let d = &self.index.descriptors()[i];
                    (d.first, d.last, d.kind)
                };
                if d_first > in_last {
                    break;
                }
                if d_kind == BufferKind::Data {
                    let slot = self.ensure_decoded(i)?;
                    let src = self.raw_pool.slot(slot);
                    for s in d_first.max(in_first)..=d_last.min(in_last) {
                        let sc = (s - d_first) as usize;
                        let dc = (s - first) as usize;
                        for c in 0..nchan {
                            out[[c, dc]] = src[[c, sc]];
                        }
                    }
                }
                i += 1;
            }
        }

        if last_req > stream_last {
            let last_idx = self.index.len() - 1;
            // a stream ending on a skip stretch replicates the zeros the
            // columns already hold
            if self.index.descriptors()[last_idx].kind == BufferKind::Data {
                let slot = self.ensure_decoded(last_idx)?;
                let src = self.raw_pool.slot(slot);
                let tail: Vec<f32> = (0..nchan).map(|c| src[[c, src.ncols() - 1]]).collect();
                let start = (stream_last + 1).max(first);
                for s in start..=last_req {
                    let dc = (s - first) as usize;
                    for c in 0..nchan {
                        out[[c, dc]] = tail[c];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Decode, calibrate and grade-adjust one buffer, reusing the cached
    /// slot when its token is still valid.
    fn ensure_decoded(&mut self, i: usize) -> Result<usize> {
        let target = self.comp.active_grade();
        let (cached, grade, record, nsamp) = {
            let d = &self.index.descriptors()[i];
            (d.cached_slot(), d.grade, d.record, d.nsamp)
        };
        if let Some(slot) = cached {
            if grade != target {
                self.comp
                    .recompensate(self.raw_pool.slot_mut(slot), grade, target)?;
                self.index.descriptor_mut(i).grade = target;
            }
            return Ok(slot);
        }

        let record =
            record.ok_or_else(|| RawError::MissingData("skip stretch holds no samples".into()))?;
        let nchan = self.catalog.len();
        let tag = self.store.read_at(record.pos)?;
        let mut samples = tag.as_samples(nchan)?;
        if samples.ncols() != nsamp {
            return Err(RawError::Structural(format!(
                "buffer decoded to {} samples, directory says {}",
                samples.ncols(),
                nsamp
            )));
        }
        for (c, ch) in self.catalog.channels().iter().enumerate() {
            let k = ch.calibration();
            if (k - 1.0).abs() > f32::EPSILON {
                for v in samples.row_mut(c) {
                    *v *= k;
                }
            }
        }
        self.comp.recompensate(&mut samples, self.file_grade, target)?;

        let (slot, token) = self.raw_pool.allocate(nchan, nsamp);
        self.raw_pool.slot_mut(slot).assign(&samples);
        let d = self.index.descriptor_mut(i);
        d.slot = Some(slot);
        d.token = Some(token);
        d.grade = target;
        Ok(slot)
    }

    /// Overlap-add of filtered blocks intersecting the request. Columns
    /// outside the stream stay zero; the caller handles tail replication.
    fn filtered_segment(&mut self, first: i64, count: usize) -> Result<Array2<f32>> {
        let nchan = self.catalog.len();
        let mut out = Array2::zeros((nchan, count));
        if count == 0 {
            return Ok(out);
        }
        let blocklen = self.filter.block_size as i64;
        let taper = self.filter.taper_size as i64;
        let padded = blocklen + 2 * taper;
        let stream_first = self.index.first_sample();
        let stream_last = self.index.last_sample();
        let last_req = first + count as i64 - 1;

        let lo = first.max(stream_first);
        let hi = last_req.min(stream_last);
        if lo > hi {
            return Ok(out);
        }

        let b_max = (stream_last - stream_first).div_euclid(blocklen);
        let a = lo - stream_first - taper - blocklen + 1;
        let b_lo = (a.div_euclid(blocklen) + i64::from(a.rem_euclid(blocklen) != 0)).max(0);
        let b_hi = ((hi - stream_first + taper).div_euclid(blocklen)).min(b_max);

        for b in b_lo..=b_hi {
            let slot = self.ensure_filtered(b)?;
            let padded_first = stream_first + b * blocklen - taper;
            let src = self.filt_pool.slot(slot);
            for s in padded_first.max(lo)..=(padded_first + padded - 1).min(hi) {
                let sc = (s - padded_first) as usize;
                let dc = (s - first) as usize;
                for c in 0..nchan {
                    out[[c, dc]] += src[[c, sc]];
                }
            }
        }
        Ok(out)
    }

    /// Produce (or reuse) the filtered block `b`: projected samples are
    /// centered in a zero-padded slot and each non-stimulus channel is
    /// filtered against its band, with the per-channel baseline removed.
    fn ensure_filtered(&mut self, b: i64) -> Result<usize> {
        if let Some(fb) = self.filtered.get(&b) {
            if fb.token.get() {
                return Ok(fb.slot);
            }
        }
        let blocklen = self.filter.block_size;
        let taper = self.filter.taper_size;
        let padded = blocklen + 2 * taper;
        let nchan = self.catalog.len();
        let active_first = self.index.first_sample() + b * blocklen as i64;

        let raw = self.pick_projected(None, active_first, blocklen)?;
        let (slot, token) = self.filt_pool.allocate(nchan, padded);
        {
            let dst = self.filt_pool.slot_mut(slot);
            dst.fill(0.0);
            for c in 0..nchan {
                for s in 0..blocklen {
                    dst[[c, taper + s]] = raw[[c, s]];
                }
            }
        }

        let dc = self.filter_baseline()?;
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| RawError::MissingData("filter engine".into()))?;
        for c in 0..nchan {
            let ch_kind = self.catalog.channel(c).kind;
            if ch_kind == ChannelKind::Stimulus {
                // margins are already zero, the payload passes through
                continue;
            }
            let mut row: Vec<f32> = self.filt_pool.slot(slot).row(c).to_vec();
            engine.apply(&mut row, false, dc[c], ch_kind)?;
            let dst = self.filt_pool.slot_mut(slot);
            for (s, v) in row.iter().enumerate() {
                dst[[c, s]] = *v;
            }
        }

        self.filtered.insert(b, FilteredBlock { slot, token });
        Ok(slot)
    }

    /// The dc offset removed before filtering: the first-sample column
    /// taken through the current compensation set and the projection, so
    /// it lives in the same space as the data being filtered.
    fn filter_baseline(&self) -> Result<Vec<f32>> {
        let nchan = self.catalog.len();
        let mut col = Array2::from_shape_fn((nchan, 1), |(c, _)| self.baseline[c]);
        self.comp.apply(&mut col, true)?;
        let mut dc: Vec<f32> = (0..nchan).map(|c| col[[c, 0]]).collect();
        if let Some(op) = &self.proj {
            op.apply_vec(&mut dc, true)?;
        }
        Ok(dc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelInfo;
    use crate::tags::SampleEncoding;
    use crate::writer::ContainerWriter;
    use std::io::Cursor;

    fn ramp_container(nchan: usize, nbuf: usize, nsamp: usize, first: i32) -> Vec<u8> {
        let mut w = ContainerWriter::new(Cursor::new(Vec::new()));
        w.start_block(block::MEAS).unwrap();
        w.start_block(block::MEAS_INFO).unwrap();
        w.write_i32(kind::NCHAN, nchan as i32).unwrap();
        w.write_f32(kind::SAMPLE_RATE, 100.0).unwrap();
        for c in 0..nchan {
            w.write_ch_info(&ChannelInfo {
                name: format!("EEG {:03}", c + 1),
                cal: 1.0,
                range: 1.0,
                kind: ChannelKind::Sensor,
                scan_no: c as i32 + 1,
            })
            .unwrap();
        }
        w.end_block(block::MEAS_INFO).unwrap();
        w.start_block(block::RAW_DATA).unwrap();
        w.write_i32(kind::FIRST_SAMPLE, first).unwrap();
        for b in 0..nbuf {
            let samples = Array2::from_shape_fn((nchan, nsamp), |(c, s)| {
                (c * 1000) as f32 + first as f32 + (b * nsamp + s) as f32
            });
            w.write_data_buffer(SampleEncoding::Float32, &samples).unwrap();
        }
        w.end_block(block::RAW_DATA).unwrap();
        w.end_block(block::MEAS).unwrap();
        w.finish().unwrap().into_inner()
    }

    fn open_ramp(nchan: usize, nbuf: usize, nsamp: usize, first: i32) -> RawReader<Cursor<Vec<u8>>> {
        RawReader::open(
            Cursor::new(ramp_container(nchan, nbuf, nsamp, first)),
            ReaderOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_pick_spans_buffer_boundary() {
        let mut reader = open_ramp(4, 3, 100, 0);
        let out = reader.pick(None, 50, 100).unwrap();
        assert_eq!(out.dim(), (4, 100));
        for c in 0..4 {
            for s in 0..100 {
                assert_eq!(out[[c, s]], (c * 1000) as f32 + 50.0 + s as f32);
            }
        }
    }

    #[test]
    fn test_pick_past_end_replicates_last_column() {
        let mut reader = open_ramp(4, 3, 100, 0);
        let out = reader.pick(None, 280, 50).unwrap();
        for c in 0..4 {
            for s in 0..20 {
                assert_eq!(out[[c, s]], (c * 1000) as f32 + 280.0 + s as f32);
            }
            for s in 20..50 {
                assert_eq!(out[[c, s]], (c * 1000) as f32 + 299.0);
            }
        }
    }

    #[test]
    fn test_zero_fill_before_stream_start() {
        let mut reader = open_ramp(2, 1, 100, 25);
        let out = reader.pick(None, 0, 30).unwrap();
        for c in 0..2 {
            for s in 0..25 {
                assert_eq!(out[[c, s]], 0.0);
            }
            for s in 25..30 {
                assert_eq!(out[[c, s]], (c * 1000) as f32 + s as f32);
            }
        }
    }

    #[test]
    fn test_selection_reorders_and_derives() {
        let mut reader = open_ramp(4, 1, 100, 0);
        let selection = ChannelSelection {
            picks: vec![2, 0],
            derivation: Some(SparseSelector::new(
                1,
                4,
                vec![(0, 0, 1.0), (0, 1, 1.0)],
            )),
        };
        let out = reader.pick(Some(&selection), 10, 5).unwrap();
        assert_eq!(out.dim(), (3, 5));
        assert_eq!(out[[0, 0]], 2010.0);
        assert_eq!(out[[1, 0]], 10.0);
        // derived row = ch0 + ch1
        assert_eq!(out[[2, 0]], 10.0 + 1010.0);
    }

    #[test]
    fn test_selection_by_names() {
        let reader = open_ramp(3, 1, 10, 0);
        let sel = ChannelSelection::by_names(reader.catalog(), &["eeg 002"]).unwrap();
        assert_eq!(sel.picks, vec![1]);
        assert!(ChannelSelection::by_names(reader.catalog(), &["nope"]).is_err());
    }

    #[test]
    fn test_allpass_filter_matches_plain_pick() {
        let nchan = 2;
        let nsamp = 64;
        let mut w = ContainerWriter::new(Cursor::new(Vec::new()));
        w.start_block(block::MEAS).unwrap();
        w.start_block(block::MEAS_INFO).unwrap();
        w.write_i32(kind::NCHAN, nchan as i32).unwrap();
        w.write_f32(kind::SAMPLE_RATE, 100.0).unwrap();
        for c in 0..nchan {
            w.write_ch_info(&ChannelInfo {
                name: format!("EEG {:03}", c + 1),
                cal: 1.0,
                range: 1.0,
                kind: ChannelKind::Sensor,
                scan_no: c as i32 + 1,
            })
            .unwrap();
        }
        w.end_block(block::MEAS_INFO).unwrap();
        w.start_block(block::RAW_DATA).unwrap();
        w.write_i32(kind::FIRST_SAMPLE, 0).unwrap();
        for b in 0..3usize {
            let samples = Array2::from_shape_fn((nchan, nsamp), |(c, s)| {
                ((b * nsamp + s) as f32 * 0.37).sin() * (c + 1) as f32
            });
            w.write_data_buffer(SampleEncoding::Float32, &samples).unwrap();
        }
        w.end_block(block::RAW_DATA).unwrap();
        w.end_block(block::MEAS).unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut options = ReaderOptions::default();
        options.filter.enabled = true;
        options.filter.block_size = 64;
        options.filter.taper_size = 16;
        options.filter.band.highpass = 0.0;
        options.filter.band.lowpass = 0.0;
        options.filter.eog_band = options.filter.band;
        let mut reader = RawReader::open(Cursor::new(bytes), options).unwrap();

        let plain = reader.pick(None, 16, 120).unwrap();
        let filtered = reader.pick_filtered(None, 16, 120).unwrap();
        for (a, b) in filtered.iter().zip(plain.iter()) {
            assert!((a - b).abs() < 1e-2, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_trailing_skip_reads_zeros_and_replicates_zeros() {
        let mut w = ContainerWriter::new(Cursor::new(Vec::new()));
        w.start_block(block::MEAS).unwrap();
        w.start_block(block::MEAS_INFO).unwrap();
        w.write_i32(kind::NCHAN, 2).unwrap();
        w.write_f32(kind::SAMPLE_RATE, 100.0).unwrap();
        for c in 0..2 {
            w.write_ch_info(&ChannelInfo {
                name: format!("EEG {:03}", c + 1),
                cal: 1.0,
                range: 1.0,
                kind: ChannelKind::Sensor,
                scan_no: c + 1,
            })
            .unwrap();
        }
        w.end_block(block::MEAS_INFO).unwrap();
        w.start_block(block::RAW_DATA).unwrap();
        w.write_i32(kind::FIRST_SAMPLE, 0).unwrap();
        let samples = Array2::from_shape_fn((2, 10), |(c, s)| (c * 1000 + s) as f32);
        w.write_data_buffer(SampleEncoding::Float32, &samples).unwrap();
        w.write_skip(1).unwrap();
        w.end_block(block::RAW_DATA).unwrap();
        w.end_block(block::MEAS).unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut reader =
            RawReader::open(Cursor::new(bytes), ReaderOptions::default()).unwrap();
        assert_eq!(reader.last_sample(), 19);

        let out = reader.pick(None, 5, 30).unwrap();
        for c in 0..2 {
            for s in 0..5 {
                assert_eq!(out[[c, s]], (c * 1000 + 5 + s) as f32);
            }
            // skipped stretch and past-end replication both read as zeros
            for s in 5..30 {
                assert_eq!(out[[c, s]], 0.0);
            }
        }
    }

    #[test]
    fn test_unknown_grade_without_references_is_noop() {
        let mut reader = open_ramp(2, 1, 10, 0);
        reader.set_compensation_grade(5).unwrap();
        assert_eq!(reader.active_grade(), 0);
    }
}
