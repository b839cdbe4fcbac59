use std::ops::Range;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    ErrorKind, ensure_debug,
    device::Device,
    grid::{GridError, ProcessGrid},
    layout::{self, DimType},
    num::{Scalar, TypeInfo},
    sync::ComputeStream,
    tensor::{Tensor, TensorError, TensorUntyped},
};

#[derive(Debug, Error)]
pub enum DistError {
    #[error("resizing local data with custom strides is not supported")]
    UnsupportedNonContiguous,
    #[error(
        "distribution error: {shape} tensor axes, {distribution} distributions, {grid} grid axes"
    )]
    Distribution {
        shape: usize,
        distribution: usize,
        grid: usize,
    },
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl DistError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DistError::UnsupportedNonContiguous => ErrorKind::Unsupported,
            DistError::Distribution { .. } => ErrorKind::Precondition,
            DistError::Grid(err) => err.kind(),
            DistError::Tensor(err) => err.kind(),
        }
    }
}

/// How one tensor axis is split over the matching grid axis.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Distribution {
    /// Contiguous, balanced blocks: the first `n % p` coordinates get one extra index.
    #[default]
    Block,
    /// Every coordinate holds the whole axis.
    Replicated,
    /// Only coordinate 0 holds the axis.
    Single,
}

impl Distribution {
    /// Global indices held at grid coordinate `coord` of a grid axis of extent `procs`.
    pub fn indices(self, len: usize, procs: usize, coord: usize) -> Range<usize> {
        match self {
            Distribution::Block => {
                let (size, rest) = (len / procs, len % procs);
                let start = coord * size + coord.min(rest);
                let end = start + size + usize::from(coord < rest);
                start..end
            }
            Distribution::Replicated => 0..len,
            Distribution::Single if coord == 0 => 0..len,
            Distribution::Single => 0..0,
        }
    }
}

/// A globally shaped tensor, of which this process holds one local share.
///
/// Tensor axis `i` is distributed over grid axis `i`.
#[derive(Debug)]
pub struct DistTensor<T> {
    shape: Vec<usize>,
    dim_types: Vec<DimType>,
    grid: ProcessGrid,
    distribution: Vec<Distribution>,
    local: Tensor<T>,
}

impl<T: Scalar> DistTensor<T> {
    pub fn new(
        grid: ProcessGrid,
        shape: &[usize],
        dim_types: &[DimType],
        distribution: &[Distribution],
        stream: ComputeStream,
        lazy: bool,
    ) -> Result<Self, DistError> {
        let local = TensorUntyped::new(TypeInfo::of::<T>(), &[], stream, lazy)?.try_into_typed()?;
        let mut tensor = Self {
            shape: vec![],
            dim_types: vec![],
            grid,
            distribution: vec![],
            local,
        };
        tensor.resize(shape, dim_types, distribution)?;
        Ok(tensor)
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn dim_types(&self) -> &[DimType] {
        &self.dim_types
    }

    #[inline]
    pub fn grid(&self) -> &ProcessGrid {
        &self.grid
    }

    #[inline]
    pub fn distribution(&self) -> &[Distribution] {
        &self.distribution
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.local.device()
    }

    #[inline]
    pub fn local_tensor(&self) -> &Tensor<T> {
        &self.local
    }

    #[inline]
    pub fn local_tensor_mut(&mut self) -> &mut Tensor<T> {
        &mut self.local
    }

    #[inline]
    pub fn local_shape(&self) -> &[usize] {
        self.local.shape()
    }

    /// Checks if the global tensor has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        layout::numel(&self.shape) == 0
    }

    /// Checks if this process holds no elements.
    #[inline]
    pub fn is_local_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Global indices held by this process along `axis`.
    pub fn global_indices(&self, axis: usize) -> Range<usize> {
        let coords = self.grid.coords();
        self.distribution[axis].indices(self.shape[axis], self.grid.shape()[axis], coords[axis])
    }

    fn compute_local_shape(
        grid: &ProcessGrid,
        shape: &[usize],
        distribution: &[Distribution],
    ) -> Vec<usize> {
        let coords = grid.coords();
        shape
            .iter()
            .zip(distribution)
            .zip(grid.shape().iter().zip(coords))
            .map(|((&len, &dist), (&procs, coord))| dist.indices(len, procs, coord).len())
            .collect()
    }

    /// Changes the global layout, resizing the local share to packed strides.
    pub fn resize(
        &mut self,
        shape: &[usize],
        dim_types: &[DimType],
        distribution: &[Distribution],
    ) -> Result<(), DistError> {
        self.resize_with_local_strides(shape, dim_types, distribution, None)
    }

    /// Like [`resize`](Self::resize); only packed local strides are supported.
    pub fn resize_with_local_strides(
        &mut self,
        shape: &[usize],
        dim_types: &[DimType],
        distribution: &[Distribution],
        local_strides: Option<&[usize]>,
    ) -> Result<(), DistError> {
        ensure_debug!(
            distribution.len() == shape.len() && self.grid.ndim() == shape.len(),
            DistError::Distribution {
                shape: shape.len(),
                distribution: distribution.len(),
                grid: self.grid.ndim(),
            }
        );
        let local_shape = Self::compute_local_shape(&self.grid, shape, distribution);
        if let Some(strides) = local_strides {
            if !layout::is_contiguous(&local_shape, strides) {
                return Err(DistError::UnsupportedNonContiguous);
            }
        }
        log::debug!(
            "[rank {}] resize distributed tensor to {shape:?}, local {local_shape:?}",
            self.grid.rank()
        );
        self.local.resize(&local_shape, dim_types, None)?;
        self.shape = shape.to_vec();
        self.dim_types = dim_types.to_vec();
        self.distribution = distribution.to_vec();
        Ok(())
    }

    /// Allocates the local share.
    #[inline]
    pub fn ensure(&mut self) -> Result<(), DistError> {
        Ok(self.local.ensure()?)
    }

    /// Drops all elements. The grid is kept.
    pub fn empty(&mut self) {
        self.shape.clear();
        self.dim_types.clear();
        self.distribution.clear();
        self.local.empty();
    }
}
