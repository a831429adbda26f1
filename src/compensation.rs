//! Interference removal derived from reference sensors.
//!
//! Compensation sets live in auxiliary blocks of the container as named
//! matrices; each set is keyed by an integer grade. Applying a set
//! subtracts `postsel · (M · (presel · x))` from the samples in place,
//! and the same transform added back undoes it exactly.

use ndarray::Array2;
use std::io::{Read, Seek};

use crate::channels::ChannelCatalog;
use crate::error::{RawError, Result};
use crate::tags::{block, kind, TagStore};
use crate::tree::{BlockTree, NodeId};

/// Dense matrix keyed by row/column channel-name lists.
#[derive(Debug, Clone)]
pub struct NamedMatrix {
    pub row_names: Vec<String>,
    pub col_names: Vec<String>,
    pub data: Array2<f32>,
}

impl NamedMatrix {
    pub fn from_block<R: Read + Seek>(
        store: &mut TagStore<R>,
        tree: &BlockTree,
        node: NodeId,
    ) -> Result<Self> {
        let nrow = tree
            .find_tag(store, node, kind::NROW)?
            .ok_or_else(|| RawError::MissingData("matrix row count".into()))?
            .as_i32()? as usize;
        let ncol = tree
            .find_tag(store, node, kind::NCOL)?
            .ok_or_else(|| RawError::MissingData("matrix column count".into()))?
            .as_i32()? as usize;
        let row_names = name_list(tree.find_tag(store, node, kind::ROW_NAMES)?)?;
        let col_names = name_list(tree.find_tag(store, node, kind::COL_NAMES)?)?;
        let values = tree
            .find_tag(store, node, kind::MATRIX_DATA)?
            .ok_or_else(|| RawError::MissingData("matrix data".into()))?
            .as_f32_vec()?;
        if values.len() != nrow * ncol {
            return Err(RawError::Structural(format!(
                "matrix payload holds {} values, expected {}x{}",
                values.len(),
                nrow,
                ncol
            )));
        }
        if row_names.len() != nrow || col_names.len() != ncol {
            return Err(RawError::Structural(
                "matrix name lists disagree with its dimensions".into(),
            ));
        }
        let data = Array2::from_shape_vec((nrow, ncol), values)
            .map_err(|e| RawError::Structural(e.to_string()))?;
        Ok(Self {
            row_names,
            col_names,
            data,
        })
    }
}

fn name_list(tag: Option<crate::tags::Tag>) -> Result<Vec<String>> {
    let tag = tag.ok_or_else(|| RawError::MissingData("matrix name list".into()))?;
    let joined = tag.as_string()?;
    if joined.is_empty() {
        return Ok(Vec::new());
    }
    Ok(joined.split(':').map(|s| s.to_string()).collect())
}

/// Sparse selection/derivation matrix in triplet form. The selection
/// matrices around a compensation set and the derived-channel synthesis
/// matrix are almost entirely zeros, so a dense representation is never
/// materialized.
#[derive(Debug, Clone)]
pub struct SparseSelector {
    nrows: usize,
    ncols: usize,
    triplets: Vec<(usize, usize, f32)>,
}

impl SparseSelector {
    pub fn new(nrows: usize, ncols: usize, triplets: Vec<(usize, usize, f32)>) -> Self {
        debug_assert!(triplets.iter().all(|&(r, c, _)| r < nrows && c < ncols));
        Self {
            nrows,
            ncols,
            triplets,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// `y = S · x`, where `x` has one row per input channel.
    pub fn apply(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        if x.nrows() != self.ncols {
            return Err(RawError::DimensionMismatch {
                expected: self.ncols,
                found: x.nrows(),
            });
        }
        let mut y = Array2::<f32>::zeros((self.nrows, x.ncols()));
        for &(r, c, w) in &self.triplets {
            for s in 0..x.ncols() {
                y[[r, s]] += w * x[[c, s]];
            }
        }
        Ok(y)
    }

    /// Rows that carry at least one nonzero weight.
    pub fn active_rows(&self) -> Vec<usize> {
        let mut rows: Vec<usize> = self.triplets.iter().map(|&(r, _, _)| r).collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }
}

/// One compensation definition at a given grade.
#[derive(Debug, Clone)]
pub struct CompensationSet {
    pub grade: i32,
    pub matrix: NamedMatrix,
    pub presel: Option<SparseSelector>,
    pub postsel: Option<SparseSelector>,
}

impl CompensationSet {
    /// Subtract (`do_comp`) or add back the modeled interference in place.
    pub fn apply(&self, samples: &mut Array2<f32>, do_comp: bool) -> Result<()> {
        let expected = self
            .presel
            .as_ref()
            .map(|s| s.ncols())
            .unwrap_or(self.matrix.data.ncols());
        if samples.nrows() != expected {
            return Err(RawError::DimensionMismatch {
                expected,
                found: samples.nrows(),
            });
        }

        let picked = match &self.presel {
            Some(sel) => sel.apply(samples)?,
            None => samples.clone(),
        };
        if picked.nrows() != self.matrix.data.ncols() {
            return Err(RawError::DimensionMismatch {
                expected: self.matrix.data.ncols(),
                found: picked.nrows(),
            });
        }
        let transformed = self.matrix.data.dot(&picked);
        let delta = match &self.postsel {
            Some(sel) => sel.apply(&transformed)?,
            None => transformed,
        };
        if delta.nrows() != samples.nrows() {
            return Err(RawError::DimensionMismatch {
                expected: samples.nrows(),
                found: delta.nrows(),
            });
        }

        if do_comp {
            *samples -= &delta;
        } else {
            *samples += &delta;
        }
        Ok(())
    }

    /// Wire the set to the recording's channel order: the preselection
    /// gathers the matrix's input channels, the postselection scatters
    /// its outputs back. Every named channel must exist.
    fn attach(&mut self, catalog: &ChannelCatalog) -> Result<()> {
        let nchan = catalog.len();
        let mut pre = Vec::with_capacity(self.matrix.col_names.len());
        for (j, name) in self.matrix.col_names.iter().enumerate() {
            let pos = catalog
                .position(name)
                .ok_or_else(|| RawError::MissingData(format!("compensation input {:?}", name)))?;
            pre.push((j, pos, 1.0));
        }
        let mut post = Vec::with_capacity(self.matrix.row_names.len());
        for (i, name) in self.matrix.row_names.iter().enumerate() {
            let pos = catalog
                .position(name)
                .ok_or_else(|| RawError::MissingData(format!("compensation output {:?}", name)))?;
            post.push((pos, i, 1.0));
        }
        self.presel = Some(SparseSelector::new(self.matrix.data.ncols(), nchan, pre));
        self.postsel = Some(SparseSelector::new(nchan, self.matrix.data.nrows(), post));
        Ok(())
    }
}

/// Holds every compensation set of the recording plus the "current" and
/// "undo" slots. At most one set is current.
pub struct CompensationOperator {
    sets: Vec<CompensationSet>,
    current: Option<usize>,
    undo: Option<usize>,
    has_reference: bool,
}

impl CompensationOperator {
    pub fn empty(has_reference: bool) -> Self {
        Self {
            sets: Vec::new(),
            current: None,
            undo: None,
            has_reference,
        }
    }

    pub fn from_tree<R: Read + Seek>(
        store: &mut TagStore<R>,
        tree: &BlockTree,
        catalog: &ChannelCatalog,
    ) -> Result<Self> {
        let mut sets = Vec::new();
        for comp_node in tree.find_by_type(tree.root(), block::COMPENSATION) {
            for &child in &tree.node(comp_node).children {
                if tree.node(child).block_type != block::COMP_DATA {
                    continue;
                }
                let grade = tree
                    .find_tag(store, child, kind::COMP_GRADE)?
                    .ok_or_else(|| RawError::MissingData("compensation grade".into()))?
                    .as_i32()?;
                let matrix = NamedMatrix::from_block(store, tree, child)?;
                let mut set = CompensationSet {
                    grade,
                    matrix,
                    presel: None,
                    postsel: None,
                };
                set.attach(catalog)?;
                log::debug!(
                    "compensation grade {}: {}x{} matrix",
                    grade,
                    set.matrix.data.nrows(),
                    set.matrix.data.ncols()
                );
                sets.push(set);
            }
        }
        Ok(Self {
            sets,
            current: None,
            undo: None,
            has_reference: catalog.has_reference_channels(),
        })
    }

    pub fn grades(&self) -> Vec<i32> {
        self.sets.iter().map(|s| s.grade).collect()
    }

    /// Grade of the current set; 0 means uncompensated.
    pub fn active_grade(&self) -> i32 {
        self.current.map(|i| self.sets[i].grade).unwrap_or(0)
    }

    pub fn set_for_grade(&self, grade: i32) -> Option<&CompensationSet> {
        self.sets.iter().find(|s| s.grade == grade)
    }

    /// Select the target grade. The previously current set moves to the
    /// undo slot; cached data is brought over lazily by the reader. No-op
    /// at the requested grade; MissingData when the grade has no set while
    /// reference channels are present.
    pub fn set_grade(&mut self, target: i32) -> Result<()> {
        if target == self.active_grade() {
            return Ok(());
        }
        let next = if target == 0 {
            None
        } else {
            match self.sets.iter().position(|s| s.grade == target) {
                Some(i) => Some(i),
                None if self.has_reference => {
                    return Err(RawError::MissingData(format!(
                        "no compensation set for grade {}",
                        target
                    )));
                }
                None => None,
            }
        };
        self.undo = self.current;
        self.current = next;
        Ok(())
    }

    /// Apply (or undo) the current set in place. No-op without one.
    pub fn apply(&self, samples: &mut Array2<f32>, do_comp: bool) -> Result<()> {
        if let Some(i) = self.current {
            self.sets[i].apply(samples, do_comp)?;
        }
        Ok(())
    }

    /// Move samples stamped at `from` to grade `to`: undo first, then
    /// compensate to the target.
    pub fn recompensate(&self, samples: &mut Array2<f32>, from: i32, to: i32) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if from != 0 {
            self.set_for_grade(from)
                .ok_or_else(|| {
                    RawError::MissingData(format!("no compensation set for grade {}", from))
                })?
                .apply(samples, false)?;
        }
        if to != 0 {
            self.set_for_grade(to)
                .ok_or_else(|| {
                    RawError::MissingData(format!("no compensation set for grade {}", to))
                })?
                .apply(samples, true)?;
        }
        Ok(())
    }
}
