//! Tensor API methods and their routing to kernels.
//!
//! Methods on compile-time known element types are routed statically by device
//! ([`fill`]). Methods on untyped tensors dispatch on the runtime element types: native
//! types index a dense table, other compute types are looked up by `<method>_<device>` in the
//! process-wide registry ([`zero`], [`cast`]). Kernels for extension types are added with
//! [`register_compute_kernels`].

use std::sync::LazyLock;

use crate::{
    hal::{cpu, gpu},
    loom::{
        device::Device,
        dispatch::{
            DispatchEntry, DispatchError, DispatchKey, DispatchOn, do_dispatch, register_dispatch_fn,
        },
        num::{Cast, Scalar, TypeInfo, register_compute_type},
        tensor::{Tensor, TensorError, TensorUntyped},
    },
};

type Kernel<T> = fn(&Tensor<T>) -> Result<(), TensorError>;
type CastKernel<U, T> = fn(&Tensor<U>, &Tensor<T>) -> Result<(), TensorError>;

static ZERO_CPU: LazyLock<[DispatchEntry; 4]> = LazyLock::new(|| {
    crate::native_dispatch_table!(
        crate = crate;
        1, cpu::zero::<{T0}> as fn(&Tensor<{T0}>) -> Result<(), TensorError>
    )
});

static ZERO_GPU: LazyLock<[DispatchEntry; 4]> = LazyLock::new(|| {
    crate::native_dispatch_table!(
        crate = crate;
        1, gpu::zero::<{T0}> as fn(&Tensor<{T0}>) -> Result<(), TensorError>
    )
});

/// Indexed by the (destination, source) native key.
static CAST_CPU: LazyLock<[DispatchEntry; 16]> = LazyLock::new(|| {
    crate::native_dispatch_table!(
        crate = crate;
        2, cpu::cast::<{T1}, {T0}> as fn(&Tensor<{T0}>, &Tensor<{T1}>) -> Result<(), TensorError>
    )
});

/// Unwraps errors raised by kernels of this module.
fn kernel_error(err: DispatchError) -> TensorError {
    match err {
        DispatchError::Kernel(err) => match err.downcast::<TensorError>() {
            Ok(err) => *err,
            Err(err) => DispatchError::Kernel(err).into(),
        },
        err => err.into(),
    }
}

/// Writes `value` to every element, allocating the tensor if needed.
pub fn fill<T: Scalar>(tensor: &mut Tensor<T>, value: T) -> Result<(), TensorError> {
    tensor.ensure()?;
    match tensor.device() {
        Device::Cpu => cpu::fill(tensor, value),
        Device::Gpu => gpu::fill(tensor, value),
    }
}

/// Writes zero to every element, allocating the tensor if needed. Tensors of non-compute
/// types are rejected before any allocation.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(dtype = %tensor.dtype())))]
pub fn zero(tensor: &mut TensorUntyped) -> Result<(), TensorError> {
    let on = DispatchOn::new([tensor.dtype()])?;
    tensor.ensure()?;
    if tensor.is_empty() {
        return Ok(());
    }
    let tensor: &TensorUntyped = tensor;
    let result = match tensor.device() {
        Device::Cpu => do_dispatch(&*ZERO_CPU, "zero_cpu", &on, &[tensor]),
        Device::Gpu => do_dispatch(&*ZERO_GPU, "zero_gpu", &on, &[tensor]),
    };
    result.map_err(kernel_error)
}

/// Converts the elements of a host tensor to `dtype`, into a new packed tensor.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(from = %src.dtype(), to = %dtype)))]
pub fn cast(src: &TensorUntyped, dtype: TypeInfo) -> Result<TensorUntyped, TensorError> {
    if src.device() != Device::Cpu {
        return Err(TensorError::Unsupported("casting device tensors"));
    }
    let on = DispatchOn::new([dtype, src.dtype()])?;
    let dst = TensorUntyped::with_layout(
        dtype,
        src.shape(),
        src.dim_types(),
        None,
        src.stream().clone(),
        false,
    )?;
    if src.is_empty() {
        return Ok(dst);
    }
    do_dispatch(&*CAST_CPU, "cast_cpu", &on, &[&dst, src]).map_err(kernel_error)?;
    Ok(dst)
}

fn register_cast<U: Cast, T: Cast>() {
    let key = DispatchKey::new([TypeInfo::of::<U>().token(), TypeInfo::of::<T>().token()]);
    register_dispatch_fn("cast_cpu", key, cpu::cast::<T, U> as CastKernel<U, T>);
}

/// Makes `T` a compute type and registers its kernels for every method of this module,
/// including casts from and to every native type.
pub fn register_compute_kernels<T: Cast>() -> TypeInfo {
    let info = register_compute_type::<T>();
    if info.is_native() {
        return info;
    }
    log::debug!("register kernels of {info}");

    let key = DispatchKey::new([info.token()]);
    register_dispatch_fn("zero_cpu", key, cpu::zero::<T> as Kernel<T>);
    register_dispatch_fn("zero_gpu", key, gpu::zero::<T> as Kernel<T>);

    register_cast::<T, T>();
    macro_rules! register_native_casts {
        ($($ty:ty),+) => {
            $(
                register_cast::<T, $ty>();
                register_cast::<$ty, T>();
            )+
        };
    }
    register_native_casts!(f32, f64, i32, u32);
    info
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::*;
    use crate::loom::{
        dispatch::{has_dispatch_entry, unregister_dispatch_fn},
        layout::DimType,
        num::{Zero, impl_bytemuck},
        sync::ComputeStream,
    };

    #[test]
    fn test_fill_and_zero() -> Result<(), Box<dyn std::error::Error>> {
        let mut tensor = Tensor::<u32>::new(&[3, 3], Device::Cpu)?;
        fill(&mut tensor, 4)?;
        assert_eq!(tensor.to_vec()?, vec![4; 9]);

        let mut tensor = tensor.into_untyped();
        zero(&mut tensor)?;
        assert_eq!(tensor.try_into_typed::<u32>()?.to_vec()?, vec![0; 9]);

        // lazy tensors are allocated on the way
        let mut lazy = TensorUntyped::new(TypeInfo::of::<f64>(), &[2], ComputeStream::Cpu, true)?;
        zero(&mut lazy)?;
        assert!(lazy.is_ensured());

        let mut storage = TensorUntyped::new(TypeInfo::of::<u8>(), &[2], ComputeStream::Cpu, true)?;
        assert!(matches!(
            zero(&mut storage),
            Err(TensorError::Dispatch(DispatchError::NonComputeType(_)))
        ));
        assert!(!storage.is_ensured());
        assert!(storage.buffer().is_none());
        Ok(())
    }

    #[test]
    fn test_cast_native() -> Result<(), Box<dyn std::error::Error>> {
        let src = TensorUntyped::with_layout(
            TypeInfo::of::<f64>(),
            &[2, 2],
            &[DimType::Sample, DimType::Channel],
            Some(&[1, 3]),
            ComputeStream::Cpu,
            false,
        )?
        .try_into_typed::<f64>()?;
        src.write(|data| data.copy_from_slice(&[0.5, 1.5, -1.0, 2.5, 3.5]))?;

        let dst = cast(&src, TypeInfo::of::<i32>())?;
        assert_eq!(dst.dtype(), TypeInfo::of::<i32>());
        assert!(dst.is_contiguous());
        assert_eq!(dst.dim_types(), src.dim_types());
        assert_eq!(dst.try_into_typed::<i32>()?.to_vec()?, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_f16_kernels() -> Result<(), Box<dyn std::error::Error>> {
        let info = register_compute_kernels::<f16>();
        let key = DispatchKey::new([info.token()]);
        assert!(has_dispatch_entry("zero_cpu", key));

        let src = Tensor::from_slice(&[3], &[1.0f32, 2.0, 3.0])?;
        let half = cast(&src, info)?;
        assert_eq!(half.dtype(), info);
        let back = cast(&half, TypeInfo::of::<f32>())?;
        assert_eq!(back.try_into_typed::<f32>()?.to_vec()?, vec![1.0, 2.0, 3.0]);

        let mut half = half;
        zero(&mut half)?;
        assert_eq!(half.try_into_typed::<f16>()?.to_vec()?, vec![f16::ZERO; 3]);
        Ok(())
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    #[repr(C)]
    struct Fixed(i32);

    impl_bytemuck!(Fixed);

    impl Zero for Fixed {
        fn zero() -> Self {
            Self(0)
        }
    }

    impl Scalar for Fixed {}

    impl Cast for Fixed {
        fn to_f64(self) -> f64 {
            self.0 as f64 / 256.0
        }

        fn from_f64(value: f64) -> Self {
            Self((value * 256.0) as i32)
        }
    }

    #[test]
    fn test_extension_kernels() -> Result<(), Box<dyn std::error::Error>> {
        let src = Tensor::from_slice(&[2], &[1.5f32, -0.25])?;
        assert!(matches!(
            cast(&src, TypeInfo::of::<Fixed>()),
            Err(TensorError::Dispatch(DispatchError::NonComputeType(_)))
        ));

        let info = register_compute_kernels::<Fixed>();
        let fixed = cast(&src, info)?.try_into_typed::<Fixed>()?;
        assert_eq!(fixed.to_vec()?, vec![Fixed(384), Fixed(-64)]);

        let key = DispatchKey::new([TypeInfo::of::<f32>().token(), info.token()]);
        unregister_dispatch_fn("cast_cpu", key);
        assert!(matches!(
            cast(&fixed, TypeInfo::of::<f32>()),
            Err(TensorError::Dispatch(DispatchError::NotFound { .. }))
        ));
        Ok(())
    }
}
