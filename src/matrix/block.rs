use nalgebra_sparse::CscMatrix;

use crate::error::{DaeError, MatrixError};

/// Copy the nonzeros of `src` into `dst`, with `src[0, 0]` landing on
/// `dst[row_offset, col_offset]`.
///
/// Only entries that already exist in the sparsity pattern of `dst` are written, any
/// entry of `src` outside that pattern is dropped. Entries of `dst` inside the block but
/// absent from `src` are set to zero.
///
/// `work` is a dense scratch buffer of at least `src.nrows()` entries. It is left zeroed on
/// return, so the same buffer can be reused for every block of an assembly.
pub fn copy_block(
    src: &CscMatrix<f64>,
    dst: &mut CscMatrix<f64>,
    row_offset: usize,
    col_offset: usize,
    work: &mut [f64],
) -> Result<(), DaeError> {
    let (nrows, ncols) = (src.nrows(), src.ncols());
    if row_offset + nrows > dst.nrows() || col_offset + ncols > dst.ncols() {
        return Err(MatrixError::BlockOutOfBounds {
            block: (nrows, ncols),
            offset: (row_offset, col_offset),
            target: (dst.nrows(), dst.ncols()),
        }
        .into());
    }
    if work.len() < nrows {
        return Err(MatrixError::WorkBufferTooSmall {
            expected: nrows,
            found: work.len(),
        }
        .into());
    }
    let row_end = row_offset + nrows;
    let src_offsets = src.col_offsets();
    let src_rows = src.row_indices();
    let src_values = src.values();
    let (dst_offsets, dst_rows, dst_values) = dst.csc_data_mut();
    for j in 0..ncols {
        let src_range = src_offsets[j]..src_offsets[j + 1];

        // scatter
        for k in src_range.clone() {
            work[src_rows[k]] = src_values[k];
        }

        let jd = j + col_offset;
        for k in dst_offsets[jd]..dst_offsets[jd + 1] {
            let i = dst_rows[k];
            if i >= row_offset && i < row_end {
                dst_values[k] = work[i - row_offset];
            }
        }

        // gather back to zero
        for k in src_range {
            work[src_rows[k]] = 0.0;
        }
    }
    Ok(())
}
