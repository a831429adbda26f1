//! Orthogonal subspace removal.
//!
//! Projection items (artifact/noise subspaces) are read from auxiliary
//! blocks as named vector sets. Active items are mapped into the working
//! channel order, orthogonalized once via SVD, and then applied to sample
//! columns on demand.

use nalgebra::DMatrix;
use ndarray::Array2;
use std::io::{Read, Seek};

use crate::channels::ChannelCatalog;
use crate::compensation::NamedMatrix;
use crate::error::{RawError, Result};
use crate::tags::{block, kind, TagStore};
use crate::tree::BlockTree;

/// Relative singular-value cutoff below which a direction is dropped.
const SINGULAR_CUTOFF: f64 = 1e-2;

#[derive(Debug, Clone)]
pub struct ProjectionItem {
    pub name: String,
    pub active: bool,
    /// One vector per row, columns keyed by channel name.
    pub vectors: NamedMatrix,
}

pub struct ProjectionOperator {
    items: Vec<ProjectionItem>,
    /// Orthonormal basis over the working channel order, one column per
    /// kept direction. Empty until [`build_basis`](Self::build_basis).
    basis: Array2<f32>,
    nchan: usize,
}

impl ProjectionOperator {
    pub fn from_tree<R: Read + Seek>(
        store: &mut TagStore<R>,
        tree: &BlockTree,
    ) -> Result<Option<Self>> {
        let mut items = Vec::new();
        for proj_node in tree.find_by_type(tree.root(), block::PROJECTION) {
            for &child in &tree.node(proj_node).children {
                if tree.node(child).block_type != block::PROJ_ITEM {
                    continue;
                }
                let name = match tree.find_tag(store, child, kind::PROJ_ITEM_NAME)? {
                    Some(tag) => tag.as_string()?,
                    None => String::new(),
                };
                let active = tree
                    .find_tag(store, child, kind::PROJ_ITEM_ACTIVE)?
                    .map(|tag| tag.as_i32())
                    .transpose()?
                    .unwrap_or(0)
                    != 0;
                let vectors = NamedMatrix::from_block(store, tree, child)?;
                items.push(ProjectionItem {
                    name,
                    active,
                    vectors,
                });
            }
        }
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            items,
            basis: Array2::zeros((0, 0)),
            nchan: 0,
        }))
    }

    pub fn items(&self) -> &[ProjectionItem] {
        &self.items
    }

    pub fn nvec(&self) -> usize {
        self.basis.ncols()
    }

    /// Map active item vectors into the catalog's channel order (bad
    /// channels zeroed, unknown names skipped with a warning), then
    /// orthogonalize. Returns the number of kept directions.
    pub fn build_basis(&mut self, catalog: &ChannelCatalog) -> Result<usize> {
        let nchan = catalog.len();
        self.nchan = nchan;

        let mut rows: Vec<Vec<f64>> = Vec::new();
        for item in self.items.iter().filter(|it| it.active) {
            let positions: Vec<Option<usize>> = item
                .vectors
                .col_names
                .iter()
                .map(|name| {
                    let pos = catalog.position(name);
                    if pos.is_none() {
                        log::warn!(
                            "projection {:?} references unknown channel {:?}",
                            item.name,
                            name
                        );
                    }
                    pos
                })
                .collect();
            for v in 0..item.vectors.data.nrows() {
                let mut row = vec![0.0f64; nchan];
                for (j, pos) in positions.iter().enumerate() {
                    if let Some(&p) = pos.as_ref() {
                        if !catalog.is_bad(p) {
                            row[p] = f64::from(item.vectors.data[[v, j]]);
                        }
                    }
                }
                let norm: f64 = row.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm > 0.0 {
                    for x in &mut row {
                        *x /= norm;
                    }
                    rows.push(row);
                }
            }
        }

        if rows.is_empty() {
            self.basis = Array2::zeros((nchan, 0));
            return Ok(0);
        }

        let m = DMatrix::from_fn(rows.len(), nchan, |r, c| rows[r][c]);
        let svd = m.svd(false, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| RawError::Structural("projection SVD failed".into()))?;
        let s0 = svd.singular_values[0];
        let kept = svd
            .singular_values
            .iter()
            .filter(|&&s| s > SINGULAR_CUTOFF * s0)
            .count();

        let mut basis = Array2::<f32>::zeros((nchan, kept));
        for k in 0..kept {
            for c in 0..nchan {
                basis[[c, k]] = v_t[(k, c)] as f32;
            }
        }
        self.basis = basis;
        log::debug!(
            "projection basis: {} direction(s) over {} channels",
            kept,
            nchan
        );
        Ok(kept)
    }

    /// Project one column in place. With `complement` the subspace is
    /// removed (`v - residual`), otherwise the residual alone remains.
    pub fn apply_vec(&self, v: &mut [f32], complement: bool) -> Result<()> {
        if self.nvec() == 0 {
            return Ok(());
        }
        if v.len() != self.nchan {
            return Err(RawError::DimensionMismatch {
                expected: self.nchan,
                found: v.len(),
            });
        }
        let mut residual = vec![0.0f32; v.len()];
        for k in 0..self.basis.ncols() {
            let mut w = 0.0f32;
            for c in 0..v.len() {
                w += self.basis[[c, k]] * v[c];
            }
            for c in 0..v.len() {
                residual[c] += w * self.basis[[c, k]];
            }
        }
        if complement {
            for (x, r) in v.iter_mut().zip(residual.iter()) {
                *x -= r;
            }
        } else {
            v.copy_from_slice(&residual);
        }
        Ok(())
    }

    /// Column-wise matrix overload of [`apply_vec`](Self::apply_vec).
    pub fn apply(&self, samples: &mut Array2<f32>, complement: bool) -> Result<()> {
        if self.nvec() == 0 {
            return Ok(());
        }
        if samples.nrows() != self.nchan {
            return Err(RawError::DimensionMismatch {
                expected: self.nchan,
                found: samples.nrows(),
            });
        }
        let mut column = vec![0.0f32; self.nchan];
        for s in 0..samples.ncols() {
            for c in 0..self.nchan {
                column[c] = samples[[c, s]];
            }
            self.apply_vec(&mut column, complement)?;
            for c in 0..self.nchan {
                samples[[c, s]] = column[c];
            }
        }
        Ok(())
    }

    /// Whether any basis direction has a nonzero entry in the channel
    /// set; when false the operator provably leaves those channels alone.
    /// Indices outside the channel range cannot be touched and are
    /// ignored; the caller's pick validation reports them.
    pub fn touches(&self, picks: &[usize]) -> bool {
        picks.iter().any(|&c| {
            c < self.basis.nrows() && (0..self.basis.ncols()).any(|k| self.basis[[c, k]] != 0.0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn operator_with_basis(basis: Array2<f32>) -> ProjectionOperator {
        let nchan = basis.nrows();
        ProjectionOperator {
            items: vec![ProjectionItem {
                name: "test".into(),
                active: true,
                vectors: NamedMatrix {
                    row_names: vec![],
                    col_names: vec![],
                    data: Array2::zeros((0, 0)),
                },
            }],
            basis,
            nchan,
        }
    }

    #[test]
    fn test_complement_removes_subspace() {
        // basis = e0
        let op = operator_with_basis(arr2(&[[1.0f32], [0.0], [0.0]]));
        let mut v = [3.0f32, 4.0, 5.0];
        op.apply_vec(&mut v, true).unwrap();
        assert_eq!(v, [0.0, 4.0, 5.0]);
    }

    #[test]
    fn test_residual_alone() {
        let op = operator_with_basis(arr2(&[[1.0f32], [0.0], [0.0]]));
        let mut v = [3.0f32, 4.0, 5.0];
        op.apply_vec(&mut v, false).unwrap();
        assert_eq!(v, [3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_idempotence() {
        let inv_sqrt2 = std::f32::consts::FRAC_1_SQRT_2;
        let op = operator_with_basis(arr2(&[[inv_sqrt2], [inv_sqrt2], [0.0]]));
        let mut once = arr2(&[[1.0f32], [2.0], [3.0]]);
        op.apply(&mut once, true).unwrap();
        let mut twice = once.clone();
        op.apply(&mut twice, true).unwrap();
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_basis_is_noop() {
        let op = operator_with_basis(Array2::zeros((3, 0)));
        let mut v = [1.0f32, 2.0, 3.0];
        op.apply_vec(&mut v, true).unwrap();
        assert_eq!(v, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let op = operator_with_basis(arr2(&[[1.0f32], [0.0]]));
        let mut v = [1.0f32, 2.0, 3.0];
        assert!(matches!(
            op.apply_vec(&mut v, true),
            Err(RawError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_touches_reports_nonzero_channels() {
        let op = operator_with_basis(arr2(&[[1.0f32], [0.0], [0.5]]));
        assert!(op.touches(&[0]));
        assert!(!op.touches(&[1]));
        assert!(op.touches(&[1, 2]));
    }

    #[test]
    fn test_touches_ignores_out_of_range_indices() {
        let op = operator_with_basis(arr2(&[[1.0f32], [0.0], [0.5]]));
        assert!(!op.touches(&[99]));
        assert!(op.touches(&[99, 0]));
    }
}
