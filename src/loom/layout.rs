//! Shape and stride algebra for strided, column-major tensors.
//!
//! Axis 0 is the fastest varying one. Strides are counted in elements.

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Semantic role of an axis. Purely informational; never checked by arithmetic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DimType {
    #[default]
    Any,
    Scalar,
    Sample,
    Channel,
    Filter,
    Spatial,
    Sequence,
}

/// Returns the product of `shape`. The product of an empty shape is `1`.
#[inline]
pub fn product(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Exclusive prefix products: `out[i] = shape[0] * .. * shape[i - 1]`.
pub fn prefix_product(shape: &[usize]) -> Vec<usize> {
    shape
        .iter()
        .scan(1, |acc, &n| {
            let out = *acc;
            *acc *= n;
            Some(out)
        })
        .collect()
}

/// Strides of a fully packed tensor of `shape`.
#[inline]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    prefix_product(shape)
}

/// Number of elements in a tensor of `shape`. Rank-0 shapes hold no elements.
#[inline]
pub fn numel(shape: &[usize]) -> usize {
    match shape.is_empty() {
        true => 0,
        false => product(shape),
    }
}

/// Number of elements spanned from the first to the last element, inclusive.
///
/// For packed tensors this equals [`numel`]; otherwise it is an upper bound of the memory
/// touched by the tensor.
pub fn extent_from_strides(shape: &[usize], strides: &[usize]) -> usize {
    if numel(shape) == 0 {
        return 0;
    }
    1 + shape
        .iter()
        .zip(strides)
        .map(|(&n, &s)| (n - 1) * s)
        .sum::<usize>()
}

/// Checks if the tensor is fully packed.
///
/// Axes of extent `1` never move the offset, so their strides are ignored.
pub fn is_contiguous(shape: &[usize], strides: &[usize]) -> bool {
    let mut expected = 1;
    for (&n, &s) in shape.iter().zip(strides) {
        if n != 1 && s != expected {
            return false;
        }
        expected *= n;
    }
    true
}

/// Checks if all but the slowest axis are packed, so that the tensor collapses into a matrix
/// with the slowest axis as its columns.
pub fn is_chw_packed(shape: &[usize], strides: &[usize]) -> bool {
    match shape.len() {
        0 => true,
        n => is_contiguous(&shape[..n - 1], &strides[..n - 1]),
    }
}

/// Checks if `index` addresses an element inside `shape`.
#[inline]
pub fn is_index_in_shape(index: &[usize], shape: &[usize]) -> bool {
    index.len() == shape.len() && index.iter().zip(shape).all(|(&i, &n)| i < n)
}

/// Element offset of `index`.
#[inline]
pub fn offset(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(&i, &s)| i * s).sum()
}

/// Advances `index` to the next element in column-major order.
///
/// Returns `false` after wrapping past the last element, leaving `index` at all zeros.
pub fn next_scalar_index(index: &mut [usize], shape: &[usize]) -> bool {
    for (i, &n) in index.iter_mut().zip(shape) {
        *i += 1;
        if *i < n {
            return true;
        }
        *i = 0;
    }
    false
}

/// Calls `f` on every index of `shape`, in column-major order.
pub fn for_ndim(shape: &[usize], mut f: impl FnMut(&[usize])) {
    if numel(shape) == 0 {
        return;
    }
    let mut index = vec![0; shape.len()];
    loop {
        f(&index);
        if !next_scalar_index(&mut index, shape) {
            break;
        }
    }
}
