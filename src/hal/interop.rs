//! Matrix views of host tensors through `faer`.
//!
//! A tensor collapses into a column-major matrix if it is rank-1, or if all but its slowest
//! axis are packed: the faster axes become the rows and the slowest axis the columns. Views are
//! borrowed for the duration of a closure and never outlive the tensor's memory.

use faer::mat::{MatMut, MatRef};

use crate::loom::{
    layout,
    num::Scalar,
    tensor::{Tensor, TensorError, TensorUntyped},
};

/// Rows, columns and column stride of the matrix a tensor collapses into.
fn mat_layout(tensor: &TensorUntyped) -> Result<(usize, usize, usize), TensorError> {
    if tensor.is_empty() {
        return Err(TensorError::NotViewable("empty tensors have no data"));
    }
    let shape = tensor.shape();
    let strides = tensor.strides();
    match shape.len() {
        1 if strides[0] == 1 => Ok((shape[0], 1, shape[0])),
        1 => Ok((1, shape[0], strides[0])),
        n if tensor.is_chw_packed() => Ok((
            layout::product(&shape[..n - 1]),
            shape[n - 1],
            strides[n - 1],
        )),
        _ => Err(TensorError::NotViewable(
            "only rank-1 and CHW-packed tensors collapse into matrices",
        )),
    }
}

impl<T: Scalar> Tensor<T> {
    /// Calls `f` with a matrix view of the tensor.
    pub fn with_mat<R>(&self, f: impl FnOnce(MatRef<'_, T>) -> R) -> Result<R, TensorError> {
        let (rows, cols, col_stride) = mat_layout(self)?;
        self.read(|data| {
            f(MatRef::from_column_major_slice_with_stride(
                data, rows, cols, col_stride,
            ))
        })
    }

    /// Calls `f` with a mutable matrix view of the tensor.
    pub fn with_mat_mut<R>(&self, f: impl FnOnce(MatMut<'_, T>) -> R) -> Result<R, TensorError> {
        let (rows, cols, col_stride) = mat_layout(self)?;
        self.write(|data| {
            f(MatMut::from_column_major_slice_with_stride_mut(
                data, rows, cols, col_stride,
            ))
        })
    }

    /// A packed `[rows, cols]` host tensor holding a copy of `mat`.
    pub fn from_mat(mat: MatRef<'_, T>) -> Result<Self, TensorError> {
        let (rows, cols) = (mat.nrows(), mat.ncols());
        let data: Vec<T> = (0..cols)
            .flat_map(|j| (0..rows).map(move |i| mat[(i, j)]))
            .collect();
        Self::from_slice(&[rows, cols], &data)
    }
}
