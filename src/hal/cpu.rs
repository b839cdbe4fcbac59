//! Host kernels. Every kernel runs to completion before returning.

use crate::loom::{
    layout,
    num::{Cast, Scalar},
    tensor::{Tensor, TensorError},
};

/// Writes `value` to every element of a host tensor.
pub fn fill<T: Scalar>(tensor: &Tensor<T>, value: T) -> Result<(), TensorError> {
    if tensor.is_empty() {
        return Ok(());
    }
    let shape = tensor.shape();
    let strides = tensor.strides();
    let contiguous = tensor.is_contiguous();

    tensor.write(|data| match contiguous {
        #[cfg(not(feature = "rayon"))]
        true => data.fill(value),
        #[cfg(feature = "rayon")]
        true => {
            use rayon::prelude::*;
            data.par_iter_mut().for_each(|x| *x = value);
        }
        false => layout::for_ndim(shape, |index| data[layout::offset(index, strides)] = value),
    })
}

/// Writes zero to every element of a host tensor.
#[inline]
pub fn zero<T: Scalar>(tensor: &Tensor<T>) -> Result<(), TensorError> {
    fill(tensor, T::zero())
}

/// Converts every element of `src` into `dst`. Both tensors must have the same shape.
pub fn cast<T: Cast, U: Cast>(dst: &Tensor<U>, src: &Tensor<T>) -> Result<(), TensorError> {
    if dst.shape() != src.shape() {
        return Err(TensorError::Shape {
            expected: dst.numel(),
            actual: src.numel(),
        });
    }
    if src.is_empty() {
        return Ok(());
    }

    // gather first: `dst` may alias the memory of `src`
    let input = src.to_vec()?;
    let shape = dst.shape();
    let strides = dst.strides();
    let contiguous = dst.is_contiguous();

    dst.write(|data| match contiguous {
        #[cfg(not(feature = "rayon"))]
        true => {
            use itertools::Itertools;

            data.iter_mut()
                .zip_eq(input)
                .for_each(|(y, x)| *y = x.cast());
        }
        #[cfg(feature = "rayon")]
        true => {
            use rayon::prelude::*;

            data.par_iter_mut()
                .zip_eq(input.into_par_iter())
                .for_each(|(y, x)| *y = x.cast());
        }
        false => {
            let mut input = input.into_iter();
            layout::for_ndim(shape, |index| {
                if let Some(x) = input.next() {
                    data[layout::offset(index, strides)] = x.cast();
                }
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::*;
    use crate::loom::{layout::DimType, num::TypeInfo, sync::ComputeStream, tensor::TensorUntyped};

    #[test]
    fn test_fill_strided() -> Result<(), Box<dyn std::error::Error>> {
        let tensor = TensorUntyped::with_layout(
            TypeInfo::of::<i32>(),
            &[2, 3],
            &[DimType::Any; 2],
            Some(&[1, 3]),
            ComputeStream::Cpu,
            false,
        )?
        .try_into_typed::<i32>()?;
        fill(&tensor, 7)?;
        assert_eq!(tensor.to_vec()?, vec![7; 6]);
        // the gaps between columns are left alone
        tensor.read(|data| assert_eq!(data, &[7, 7, 0, 7, 7, 0, 7, 7]))?;

        zero(&tensor)?;
        assert_eq!(tensor.to_vec()?, vec![0; 6]);
        Ok(())
    }

    #[test]
    fn test_fill_contiguous() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<f32> = (0..1000).map(|_| fastrand::f32()).collect();
        let tensor = Tensor::from_slice(&[10, 100], &data)?;
        zero(&tensor)?;
        assert!(tensor.to_vec()?.into_iter().all(|x| x == 0.0));
        Ok(())
    }

    #[test]
    fn test_cast() -> Result<(), Box<dyn std::error::Error>> {
        let src = Tensor::from_slice(&[2, 2], &[1.5f32, -2.0, 3.25, 1e10])?;
        let dst = Tensor::<i32>::new_on(&[2, 2], ComputeStream::Cpu, false)?;
        cast(&dst, &src)?;
        assert_eq!(dst.to_vec()?, vec![1, -2, 3, i32::MAX]);

        let half = Tensor::<f16>::new_on(&[2, 2], ComputeStream::Cpu, false)?;
        cast(&half, &src)?;
        assert_eq!(half.get(&[1, 0])?, f16::from_f32(-2.0));

        let wrong = Tensor::<f64>::new_on(&[4], ComputeStream::Cpu, false)?;
        assert!(matches!(cast(&wrong, &src), Err(TensorError::Shape { .. })));
        Ok(())
    }
}
