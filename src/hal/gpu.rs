//! GPU kernels. Work is enqueued on the queue of the tensor's context and completes
//! asynchronously; wait on the tensor's stream to observe it from the host.
//!
//! Tensors viewed onto the GPU of a unified memory system keep host storage, and are handled
//! by the host kernels.

use crate::{
    hal::cpu,
    loom::{
        buffer::Storage,
        device::{DeviceError, GpuContext},
        layout,
        num::Scalar,
        tensor::{Tensor, TensorError},
    },
};

const ALIGN: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

fn gpu_storage<T: Scalar>(
    tensor: &Tensor<T>,
) -> Result<Option<(&GpuContext, &wgpu::Buffer)>, TensorError> {
    let buffer = tensor.buffer().ok_or(TensorError::NotEnsured)?;
    match buffer.storage() {
        Storage::Host(_) => Ok(None),
        Storage::Gpu { context, buffer } => {
            if let Some(stream) = tensor.stream().context() {
                if stream.id() != context.id() {
                    return Err(DeviceError::ContextMismatch.into());
                }
            }
            Ok(Some((context.as_ref(), buffer)))
        }
    }
}

/// Writes `value` to every element.
pub fn fill<T: Scalar>(tensor: &Tensor<T>, value: T) -> Result<(), TensorError> {
    if tensor.is_empty() {
        return Ok(());
    }
    let Some((context, buffer)) = gpu_storage(tensor)? else {
        return cpu::fill(tensor, value);
    };
    let queue = context.queue();
    let size = size_of::<T>();

    if tensor.is_contiguous() {
        let data = vec![value; tensor.numel()];
        let mut bytes = bytemuck::cast_slice::<T, u8>(&data).to_vec();
        bytes.resize(bytes.len().div_ceil(ALIGN) * ALIGN, 0);
        queue.write_buffer(buffer, 0, &bytes);
        return Ok(());
    }

    if size % ALIGN != 0 {
        return Err(TensorError::Unsupported(
            "strided GPU writes of elements narrower than 4 bytes",
        ));
    }
    // write runs along axis 0 when it is packed, single elements otherwise
    let shape = tensor.shape();
    let strides = tensor.strides();
    let (run, outer_shape, outer_strides) = match strides.first() {
        Some(&1) => (shape[0], &shape[1..], &strides[1..]),
        _ => (1, shape, strides),
    };
    let data = vec![value; run];
    let bytes: &[u8] = bytemuck::cast_slice(&data);
    layout::for_ndim(outer_shape, |index| {
        let offset = layout::offset(index, outer_strides) * size;
        queue.write_buffer(buffer, offset as u64, bytes);
    });
    Ok(())
}

/// Writes zero to every element.
pub fn zero<T: Scalar>(tensor: &Tensor<T>) -> Result<(), TensorError> {
    if tensor.is_empty() {
        return Ok(());
    }
    let Some((context, buffer)) = gpu_storage(tensor)? else {
        return cpu::zero(tensor);
    };
    if !tensor.is_contiguous() {
        return fill(tensor, T::zero());
    }
    let mut encoder = context
        .device()
        .create_command_encoder(&Default::default());
    encoder.clear_buffer(buffer, 0, None);
    context.queue().submit(Some(encoder.finish()));
    Ok(())
}
