//! Copies between tensors, distributed tensors and devices.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::loom::{
    buffer::{Storage, copy_buffer_bytes},
    device::{Device, DeviceError},
    dist::{DistError, DistTensor},
    grid::GridError,
    num::{Scalar, TypeInfo},
    sync::ComputeStream,
    tensor::{TensorError, TensorUntyped},
};

/// Copies `src` into `dst`, giving `dst` the layout of `src`.
///
/// An empty `src` empties `dst`. Non-contiguous tensors move every element between the first
/// and the last one, gaps included. Element types must match.
///
/// On failure `dst` may already be resized, with unspecified contents.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub fn copy(dst: &mut TensorUntyped, src: &TensorUntyped) -> Result<(), TensorError> {
    if src.is_empty() {
        dst.empty();
        return Ok(());
    }
    if dst.dtype() != src.dtype() {
        return Err(TensorError::UnsupportedConversion(src.dtype(), dst.dtype()));
    }

    dst.resize(src.shape(), src.dim_types(), Some(src.strides()))?;
    dst.ensure()?;

    let count = match src.is_contiguous() {
        true => src.numel(),
        false => src.extent(),
    };
    log::trace!(
        "copy {count} elements of {}: {} -> {}",
        src.dtype(),
        src.device(),
        dst.device()
    );
    copy_buffer_bytes(
        dst.buffer(),
        dst.stream(),
        src.buffer(),
        src.stream(),
        count * src.dtype().size(),
    )?;
    Ok(())
}

/// Hashes the arguments of a distributed copy that must agree across processes.
fn fingerprint<T: Scalar, U: Scalar>(dst: &DistTensor<T>, src: &DistTensor<U>) -> u64 {
    let mut hasher = FxHasher::default();
    src.shape().hash(&mut hasher);
    src.dim_types().hash(&mut hasher);
    src.distribution().hash(&mut hasher);
    src.grid().shape().hash(&mut hasher);
    TypeInfo::of::<U>().token().hash(&mut hasher);
    TypeInfo::of::<T>().token().hash(&mut hasher);
    dst.grid().shape().hash(&mut hasher);
    hasher.finish()
}

/// Copies the distributed tensor `src` into `dst`.
///
/// This is a collective call: every member of the grid must make it with matching arguments.
/// The grids must be congruent; `dst` keeps its grid and takes the shape, axis tags and
/// distribution of `src`. Processes holding no share of `src` copy nothing.
#[cfg_attr(
    feature = "trace",
    tracing::instrument(skip_all, fields(rank = src.grid().rank()))
)]
pub fn dist_copy<T: Scalar, U: Scalar>(
    dst: &mut DistTensor<T>,
    src: &DistTensor<U>,
) -> Result<(), DistError> {
    if !dst.grid().is_congruent_to(src.grid()) {
        return Err(GridError::NotCongruent.into());
    }
    let comm = src.grid().comm();
    if comm.consistency_checks() {
        comm.check_consistent(fingerprint(dst, src))?;
    }

    if src.is_empty() {
        dst.empty();
        return Ok(());
    }
    let (src_type, dst_type) = (TypeInfo::of::<U>(), TypeInfo::of::<T>());
    if src_type != dst_type {
        return Err(TensorError::UnsupportedConversion(src_type, dst_type).into());
    }

    let local = src.local_tensor();
    dst.resize_with_local_strides(
        src.shape(),
        src.dim_types(),
        src.distribution(),
        Some(local.strides()),
    )?;
    if src.is_local_empty() {
        log::debug!("[rank {}] no local share to copy", comm.rank());
        return Ok(());
    }
    dst.ensure()?;
    copy(dst.local_tensor_mut(), local)?;
    Ok(())
}

/// Returns a tensor with the contents of `src` that lives on `device`.
///
/// - Already on `device`: a view of `src`, moved to `stream` if given.
/// - Unified memory: a view of `src` tagged with `device`.
/// - Otherwise: a new tensor holding a copy. Copies to the host are complete on return.
pub fn make_accessible_on_device(
    src: &TensorUntyped,
    device: Device,
    stream: Option<ComputeStream>,
) -> Result<TensorUntyped, TensorError> {
    if src.device() == device {
        let mut view = src.view();
        if let Some(stream) = stream {
            view.set_stream(stream)?;
        }
        return Ok(view);
    }

    let stream = match stream {
        Some(stream) => stream,
        None => ComputeStream::new(device).map_err(|err| match err {
            DeviceError::GpuUnavailable => DeviceError::UnknownDevice(device),
            err => err,
        })?,
    };
    let unified = [src.stream(), &stream]
        .iter()
        .filter_map(|stream| stream.context())
        .all(|context| context.is_unified_memory());
    let host_storage = src
        .buffer()
        .is_none_or(|buffer| matches!(buffer.storage(), Storage::Host(_)));
    if unified && host_storage {
        log::trace!("view {} tensor on {device} through unified memory", src.device());
        return Ok(src.view_on(device, stream));
    }

    let mut dst = TensorUntyped::with_layout(
        src.dtype(),
        src.shape(),
        src.dim_types(),
        Some(src.strides()),
        stream,
        true,
    )?;
    copy(&mut dst, src)?;
    if device.is_synchronous() {
        src.stream().wait_for_this()?;
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::loom::{
        ErrorKind,
        device::{GpuBuilder, init_default_gpu},
        dist::Distribution,
        grid::{Comm, LocalWorld, ProcessGrid},
        layout::DimType,
        tensor::Tensor,
    };

    #[test]
    fn test_copy_empty() -> Result<(), Box<dyn std::error::Error>> {
        let src = Tensor::<f32>::new_on(&[0, 3], ComputeStream::Cpu, false)?;
        let mut dst = Tensor::from_slice(&[2, 2], &[1.0f32, 2.0, 3.0, 4.0])?.into_untyped();
        copy(&mut dst, &src)?;
        assert!(dst.is_empty());
        assert!(dst.buffer().is_none());
        Ok(())
    }

    #[test]
    fn test_copy_contiguous() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let src = Tensor::from_slice(&[4, 4], &data)?;
        let mut dst = TensorUntyped::new(TypeInfo::of::<f32>(), &[], ComputeStream::Cpu, true)?;
        copy(&mut dst, &src)?;

        let dst = dst.try_into_typed::<f32>()?;
        assert_eq!(dst.shape(), &[4, 4]);
        assert!(dst.is_contiguous());
        assert_eq!(dst.to_vec()?, data);

        let data: Vec<i32> = (0..15).map(|_| fastrand::i32(..)).collect();
        let src = Tensor::from_slice(&[3, 5], &data)?;
        let mut dst = Tensor::<i32>::new(&[1], Device::Cpu)?.into_untyped();
        copy(&mut dst, &src)?;
        assert_eq!(dst.shape(), src.shape());
        assert_eq!(dst.strides(), src.strides());
        assert_eq!(dst.try_into_typed::<i32>()?.to_vec()?, data);
        Ok(())
    }

    #[test]
    fn test_copy_strided() -> Result<(), Box<dyn std::error::Error>> {
        let src = TensorUntyped::with_layout(
            TypeInfo::of::<u32>(),
            &[2, 2],
            &[DimType::Channel, DimType::Sample],
            Some(&[1, 3]),
            ComputeStream::Cpu,
            false,
        )?
        .try_into_typed::<u32>()?;
        src.write(|data| data.copy_from_slice(&[1, 2, 0, 3, 4]))?;

        let mut dst = TensorUntyped::new(TypeInfo::of::<u32>(), &[], ComputeStream::Cpu, true)?;
        copy(&mut dst, &src)?;
        assert_eq!(dst.strides(), &[1, 3]);
        assert_eq!(dst.dim_types(), src.dim_types());
        assert_eq!(dst.try_into_typed::<u32>()?.to_vec()?, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_unsupported_conversion() -> Result<(), Box<dyn std::error::Error>> {
        let src = Tensor::from_slice(&[2], &[1.0f64, 2.0])?;
        let mut dst = Tensor::from_slice(&[2], &[0.0f32, 0.0])?.into_untyped();
        let err = copy(&mut dst, &src).err().ok_or("conversion must fail")?;
        assert!(matches!(err, TensorError::UnsupportedConversion(from, to)
            if from == TypeInfo::of::<f64>() && to == TypeInfo::of::<f32>()));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        // nothing was reinterpreted
        assert_eq!(dst.try_into_typed::<f32>()?.to_vec()?, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_same_device_view() -> Result<(), Box<dyn std::error::Error>> {
        let src = Tensor::from_slice(&[3], &[1u32, 2, 3])?;
        let view = make_accessible_on_device(&src, Device::Cpu, None)?;
        assert!(view.is_view());
        assert!(Arc::ptr_eq(
            src.buffer().ok_or("no buffer")?,
            view.buffer().ok_or("no buffer")?
        ));

        let view = make_accessible_on_device(&src, Device::Cpu, Some(ComputeStream::Cpu))?;
        assert_eq!(view.stream(), &ComputeStream::Cpu);
        Ok(())
    }

    fn dist_tensor<T: Scalar>(
        comm: &Comm,
        grid_shape: &[usize],
        shape: &[usize],
    ) -> Result<DistTensor<T>, DistError> {
        let grid = ProcessGrid::new(comm.clone(), grid_shape)?;
        DistTensor::new(
            grid,
            shape,
            &vec![DimType::Any; shape.len()],
            &vec![Distribution::Block; shape.len()],
            ComputeStream::Cpu,
            false,
        )
    }

    #[test]
    fn test_dist_copy_not_congruent() -> Result<(), Box<dyn std::error::Error>> {
        let comms = LocalWorld::new(4).build();
        let src = dist_tensor::<f32>(&comms[0], &[2, 2], &[4, 4])?;
        let mut dst = dist_tensor::<f32>(&comms[0], &[4, 1], &[4, 4])?;
        dst.local_tensor().write(|x| x.fill(5.0))?;
        let buffer = dst.local_tensor().buffer().cloned().ok_or("no buffer")?;

        assert!(matches!(
            dist_copy(&mut dst, &src),
            Err(DistError::Grid(GridError::NotCongruent))
        ));
        assert!(Arc::ptr_eq(
            &buffer,
            dst.local_tensor().buffer().ok_or("no buffer")?
        ));
        assert_eq!(dst.shape(), &[4, 4]);
        assert!(dst.local_tensor().to_vec()?.into_iter().all(|x| x == 5.0));
        Ok(())
    }

    #[test]
    fn test_dist_copy() {
        let comms = LocalWorld::new(2).build();
        let global: Vec<f64> = (0..15).map(|x| x as f64).collect();

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| {
                    let global = &global;
                    scope.spawn(move || -> Result<_, Box<dyn std::error::Error + Send + Sync>> {
                        // 5 x 3 split over a 2 x 1 grid: rows 0..3 and 3..5
                        let src = dist_tensor::<f64>(comm, &[2, 1], &[5, 3])?;
                        let rows = src.global_indices(0);
                        let local: Vec<f64> = (0..3)
                            .flat_map(|col| rows.clone().map(move |row| global[row + 5 * col]))
                            .collect();
                        src.local_tensor().write(|x| x.copy_from_slice(&local))?;

                        let mut dst = dist_tensor::<f64>(comm, &[2, 1], &[1, 1])?;
                        dist_copy(&mut dst, &src)?;
                        assert_eq!(dst.shape(), &[5, 3]);
                        Ok((rows, dst.local_tensor().to_vec()?, local))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread panicked"))
                .collect()
        });

        for result in results {
            let (rows, actual, expected) = result.expect("distributed copy failed");
            assert_eq!(actual.len(), rows.len() * 3);
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn test_dist_copy_local_empty() -> Result<(), Box<dyn std::error::Error>> {
        // 1 x 2 grid with a 3 x 1 tensor: rank 1 holds no columns
        let comms = LocalWorld::new(2).build();
        let src = dist_tensor::<i32>(&comms[1], &[1, 2], &[3, 1])?;
        let mut dst = dist_tensor::<i32>(&comms[1], &[1, 2], &[2, 2])?;
        assert!(src.is_local_empty());
        dist_copy(&mut dst, &src)?;
        assert_eq!(dst.shape(), &[3, 1]);
        assert!(dst.is_local_empty());
        Ok(())
    }

    #[test]
    fn test_dist_copy_errors() -> Result<(), Box<dyn std::error::Error>> {
        let comm = Comm::single();
        let src = dist_tensor::<u32>(&comm, &[1], &[4])?;
        let mut dst = dist_tensor::<f32>(&comm, &[1], &[4])?;
        assert!(matches!(
            dist_copy(&mut dst, &src),
            Err(DistError::Tensor(TensorError::UnsupportedConversion(..)))
        ));

        let empty = dist_tensor::<u32>(&comm, &[1], &[0])?;
        let mut dst = dist_tensor::<u32>(&comm, &[1], &[4])?;
        dist_copy(&mut dst, &empty)?;
        assert!(dst.is_empty());
        Ok(())
    }

    #[test]
    fn test_dist_copy_strided_local_data() -> Result<(), Box<dyn std::error::Error>> {
        let comm = Comm::single();
        let mut src = dist_tensor::<f32>(&comm, &[1, 1], &[3, 2])?;
        src.local_tensor_mut()
            .resize(&[3, 2], &[DimType::Any; 2], Some(&[1, 4]))?;
        assert!(!src.local_tensor().is_contiguous());

        let mut dst = dist_tensor::<f32>(&comm, &[1, 1], &[2, 2])?;
        dst.local_tensor().write(|x| x.fill(5.0))?;
        let buffer = dst.local_tensor().buffer().cloned().ok_or("no buffer")?;

        let err = dist_copy(&mut dst, &src).err().ok_or("strided copy must fail")?;
        assert!(matches!(err, DistError::UnsupportedNonContiguous));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(dst.shape(), &[2, 2]);
        assert!(Arc::ptr_eq(
            &buffer,
            dst.local_tensor().buffer().ok_or("no buffer")?
        ));
        assert_eq!(dst.local_tensor().to_vec()?, vec![5.0; 4]);
        Ok(())
    }

    #[test]
    fn test_dist_copy_consistency_check() {
        let comms = LocalWorld::new(2).consistency_checks(true).build();
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| {
                    scope.spawn(move || {
                        // the ranks disagree on the global shape
                        let len = 4 + comm.rank();
                        let src = dist_tensor::<f32>(comm, &[2], &[len])?;
                        let mut dst = dist_tensor::<f32>(comm, &[2], &[len])?;
                        dist_copy(&mut dst, &src)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread panicked"))
                .collect()
        });
        assert!(results.iter().all(|result| matches!(
            result,
            Err(DistError::Grid(GridError::Inconsistent { .. }))
        )));
    }

    #[tokio::test]
    async fn test_gpu_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let Ok(context) = init_default_gpu().await else {
            log::warn!("no GPU adapter, skipping");
            return Ok(());
        };
        let gpu = ComputeStream::on_context(context.clone());

        let data: Vec<f32> = (0..12).map(|_| fastrand::f32()).collect();
        let src = Tensor::from_slice(&[4, 3], &data)?;
        let on_gpu = make_accessible_on_device(&src, Device::Gpu, Some(gpu.clone()))?;
        assert_eq!(on_gpu.device(), Device::Gpu);
        let shared = Arc::ptr_eq(
            src.buffer().ok_or("no buffer")?,
            on_gpu.buffer().ok_or("no buffer")?,
        );
        assert_eq!(on_gpu.is_view(), context.is_unified_memory());
        assert_eq!(shared, context.is_unified_memory());

        let back = make_accessible_on_device(&on_gpu, Device::Cpu, None)?;
        assert_eq!(back.device(), Device::Cpu);
        assert_eq!(back.try_into_typed::<f32>()?.to_vec()?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_unified_memory_view() -> Result<(), Box<dyn std::error::Error>> {
        let Ok(builder) = GpuBuilder::request_default().await else {
            log::warn!("no GPU adapter, skipping");
            return Ok(());
        };
        let context = builder.unified_memory(true).build().await?;
        assert!(context.is_unified_memory());
        let gpu = ComputeStream::on_context(context);

        let data: Vec<u32> = (0..6).collect();
        let src = Tensor::from_slice(&[2, 3], &data)?;
        let view = make_accessible_on_device(&src, Device::Gpu, Some(gpu.clone()))?;
        assert!(view.is_view());
        assert_eq!(view.device(), Device::Gpu);
        assert_ne!(view.device(), src.device());
        assert_eq!(view.stream(), &gpu);
        let buffer = src.buffer().ok_or("no buffer")?;
        assert!(Arc::ptr_eq(buffer, view.buffer().ok_or("no buffer")?));

        // and back to the host without a copy
        let back = make_accessible_on_device(&view, Device::Cpu, None)?;
        assert!(back.is_view());
        assert_eq!(back.device(), Device::Cpu);
        assert!(Arc::ptr_eq(buffer, back.buffer().ok_or("no buffer")?));
        assert_eq!(back.try_into_typed::<u32>()?.to_vec()?, data);
        Ok(())
    }
}
