use log::trace;
use nalgebra_sparse::{pattern::SparsityPattern, CscMatrix};

use crate::{
    dae::{JacobianBlocks, JacobianPattern},
    error::{DaeError, MatrixError},
};

use super::copy_block;

/// The square Newton matrix `[ode_x + shift*I, ode_z; alg_x, alg_z]` of the undifferentiated
/// problem, stored on the union of the four block patterns plus the full diagonal.
///
/// The pattern is fixed when the assembly is created, only the values change between calls to
/// [JacobianAssembly::assemble].
#[derive(Debug, Clone)]
pub struct JacobianAssembly {
    n_diff: usize,
    matrix: CscMatrix<f64>,
    /// position of each differential diagonal entry in `matrix.values()`
    diag: Vec<usize>,
    work: Vec<f64>,
}

impl JacobianAssembly {
    pub fn new(pattern: &JacobianPattern) -> Result<Self, DaeError> {
        let n_diff = pattern.n_diff();
        let n = n_diff + pattern.n_alg();

        let mut columns: Vec<Vec<usize>> = (0..n).map(|j| vec![j]).collect();
        let placements = [
            (&pattern.ode_x, 0, 0),
            (&pattern.alg_x, n_diff, 0),
            (&pattern.ode_z, 0, n_diff),
            (&pattern.alg_z, n_diff, n_diff),
        ];
        for (block, row_offset, col_offset) in placements {
            for j in 0..block.major_dim() {
                let lane = block.lane(j);
                columns[j + col_offset].extend(lane.iter().map(|&i| i + row_offset));
            }
        }

        let mut offsets = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        offsets.push(0);
        for col in columns.iter_mut() {
            col.sort_unstable();
            col.dedup();
            indices.extend_from_slice(col);
            offsets.push(indices.len());
        }
        let sparsity = SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices)
            .map_err(|e| MatrixError::Other(e.to_string()))?;
        let nnz = sparsity.nnz();
        let matrix = CscMatrix::try_from_pattern_and_values(sparsity, vec![0.0; nnz])
            .map_err(MatrixError::SparseFormat)?;

        let mut diag = Vec::with_capacity(n_diff);
        let col_offsets = matrix.col_offsets();
        let row_indices = matrix.row_indices();
        for j in 0..n_diff {
            let range = col_offsets[j]..col_offsets[j + 1];
            let k = row_indices[range.clone()]
                .binary_search(&j)
                .map_err(|_| MatrixError::IndexOutOfBounds)?;
            diag.push(range.start + k);
        }
        trace!("assembled Jacobian pattern: n = {n}, nnz = {nnz}");

        Ok(Self {
            n_diff,
            matrix,
            diag,
            work: vec![0.0; n],
        })
    }

    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn matrix(&self) -> &CscMatrix<f64> {
        &self.matrix
    }

    /// Overwrite the matrix with `blocks` and add `shift` to the differential diagonal.
    pub fn assemble(&mut self, blocks: &JacobianBlocks, shift: f64) -> Result<&CscMatrix<f64>, DaeError> {
        self.matrix.values_mut().iter_mut().for_each(|v| *v = 0.0);
        let n_diff = self.n_diff;
        copy_block(&blocks.ode_x, &mut self.matrix, 0, 0, &mut self.work)?;
        copy_block(&blocks.alg_x, &mut self.matrix, n_diff, 0, &mut self.work)?;
        copy_block(&blocks.ode_z, &mut self.matrix, 0, n_diff, &mut self.work)?;
        copy_block(&blocks.alg_z, &mut self.matrix, n_diff, n_diff, &mut self.work)?;
        let values = self.matrix.values_mut();
        for &k in &self.diag {
            values[k] += shift;
        }
        Ok(&self.matrix)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;
    use nalgebra_sparse::convert::serial::convert_csc_dense;

    use super::*;

    #[test]
    fn assembles_blocks_with_shifted_diagonal() {
        let pattern = JacobianPattern::from_csc_parts(
            1,
            1,
            (vec![0, 0], vec![]),
            (vec![0, 1], vec![0]),
            (vec![0, 1], vec![0]),
            (vec![0, 1], vec![0]),
        )
        .unwrap();
        let mut assembly = JacobianAssembly::new(&pattern).unwrap();
        // ode_x is empty but the diagonal is always stored
        assert_eq!(assembly.matrix().nnz(), 4);

        let mut blocks = JacobianBlocks::zeros(&pattern).unwrap();
        blocks.alg_x.values_mut()[0] = -1.0;
        blocks.ode_z.values_mut()[0] = -2.0;
        blocks.alg_z.values_mut()[0] = 1.0;
        let m = convert_csc_dense(assembly.assemble(&blocks, -10.0).unwrap());
        let expected = DMatrix::from_row_slice(2, 2, &[-10.0, -2.0, -1.0, 1.0]);
        assert_eq!(m, expected);

        // values are rebuilt from scratch, not accumulated
        let m = convert_csc_dense(assembly.assemble(&blocks, 3.0).unwrap());
        assert_eq!(m[(0, 0)], 3.0);
        assert_eq!(m[(1, 1)], 1.0);
    }

    #[test]
    fn dense_pattern_is_fully_stored() {
        let pattern = JacobianPattern::dense(2, 1);
        let assembly = JacobianAssembly::new(&pattern).unwrap();
        assert_eq!(assembly.nrows(), 3);
        assert_eq!(assembly.matrix().nnz(), 9);
    }
}
