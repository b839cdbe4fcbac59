use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytemuck::Pod;

use super::{
    device::{Device, DeviceError, GpuContext},
    ensure_debug,
    num::impl_bytemuck,
    sync::{ComputeStream, create_multi_sync},
};

/// Allocation unit of host buffers; aligned for every element type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Block(pub [u8; 16]);

impl_bytemuck!(Block);

/// Rounds `size` up to the copy alignment of GPU buffers.
#[inline]
fn align_copy(size: usize) -> usize {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    size.div_ceil(align) * align
}

/// Where the bytes of a [`RawBuffer`] live.
#[derive(Debug)]
pub enum Storage {
    Host(RwLock<Box<[Block]>>),
    Gpu {
        context: Arc<GpuContext>,
        buffer: wgpu::Buffer,
    },
}

/// An untyped allocation, shared by every tensor viewing it.
#[derive(Debug)]
pub struct RawBuffer {
    storage: Storage,
    size: usize,
}

impl RawBuffer {
    /// A zeroed host allocation of `size` bytes.
    pub fn new_host(size: usize) -> Self {
        let blocks = vec![Block::default(); size.div_ceil(size_of::<Block>())];
        log::trace!("allocate {size} bytes on host");
        Self {
            storage: Storage::Host(RwLock::new(blocks.into_boxed_slice())),
            size,
        }
    }

    /// A zeroed GPU allocation of `size` bytes.
    pub fn new_gpu(context: Arc<GpuContext>, size: usize) -> Self {
        let buffer = context.device().create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: align_copy(size) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        log::trace!("allocate {size} bytes on GPU context {:?}", context.id());
        Self {
            storage: Storage::Gpu { context, buffer },
            size,
        }
    }

    /// Allocates `size` bytes on the device of `stream`.
    pub fn alloc(stream: &ComputeStream, size: usize) -> Self {
        match stream.context() {
            None => Self::new_host(size),
            Some(context) => Self::new_gpu(context.clone(), size),
        }
    }

    /// Requested size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The device the memory resides on.
    #[inline]
    pub fn device(&self) -> Device {
        match self.storage {
            Storage::Host(_) => Device::Cpu,
            Storage::Gpu { .. } => Device::Gpu,
        }
    }

    #[inline]
    pub fn gpu_buffer(&self) -> Option<(&Arc<GpuContext>, &wgpu::Buffer)> {
        match &self.storage {
            Storage::Host(_) => None,
            Storage::Gpu { context, buffer } => Some((context, buffer)),
        }
    }

    fn host(&self) -> Result<&RwLock<Box<[Block]>>, DeviceError> {
        match &self.storage {
            Storage::Host(blocks) => Ok(blocks),
            Storage::Gpu { .. } => Err(DeviceError::Mismatch {
                expected: Device::Cpu,
                actual: Device::Gpu,
            }),
        }
    }

    fn read_blocks(&self) -> Result<RwLockReadGuard<'_, Box<[Block]>>, DeviceError> {
        Ok(self.host()?.read().expect("failed to lock host buffer"))
    }

    fn write_blocks(&self) -> Result<RwLockWriteGuard<'_, Box<[Block]>>, DeviceError> {
        Ok(self.host()?.write().expect("failed to lock host buffer"))
    }

    /// Reads host memory as a slice of `T`.
    pub fn read_host<T: Pod, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R, DeviceError> {
        let blocks = self.read_blocks()?;
        let len = self.size / size_of::<T>() * size_of::<T>();
        let bytes: &[u8] = bytemuck::cast_slice(&blocks[..]);
        Ok(f(bytemuck::cast_slice(&bytes[..len])))
    }

    /// Writes host memory as a slice of `T`.
    pub fn write_host<T: Pod, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R, DeviceError> {
        let mut blocks = self.write_blocks()?;
        let len = self.size / size_of::<T>() * size_of::<T>();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut blocks[..]);
        Ok(f(bytemuck::cast_slice_mut(&mut bytes[..len])))
    }
}

/// Copies `count` elements of `T` from `src` to `dst`. See [`copy_buffer_bytes`].
#[inline]
pub fn copy_buffer<T: Pod>(
    dst: Option<&Arc<RawBuffer>>,
    dst_stream: &ComputeStream,
    src: Option<&Arc<RawBuffer>>,
    src_stream: &ComputeStream,
    count: usize,
) -> Result<(), DeviceError> {
    copy_buffer_bytes(dst, dst_stream, src, src_stream, count * size_of::<T>())
}

/// Copies the first `size` bytes of `src` to `dst`.
///
/// - host to host: copied before returning.
/// - host to GPU: enqueued on the queue of the destination.
/// - GPU to host: enqueued on the queue of the source; the destination is written once
///   `src_stream` is waited on from the host, and that wait reports a failed download.
/// - GPU to GPU: ordered after the work of both streams, on the same context only.
///
/// GPU sides may move up to 3 extra bytes of padding.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(size = size)))]
pub fn copy_buffer_bytes(
    dst: Option<&Arc<RawBuffer>>,
    dst_stream: &ComputeStream,
    src: Option<&Arc<RawBuffer>>,
    src_stream: &ComputeStream,
    size: usize,
) -> Result<(), DeviceError> {
    if size == 0 {
        return Ok(());
    }
    let (Some(dst), Some(src)) = (dst, src) else {
        return Err(DeviceError::NullBuffer);
    };
    ensure_debug!(
        size <= dst.size() && size <= src.size(),
        DeviceError::OutOfBounds {
            size,
            capacity: dst.size().min(src.size()),
        }
    );
    log::trace!(
        "copy {size} bytes: {} ({src_stream}) -> {} ({dst_stream})",
        src.device(),
        dst.device()
    );

    match (&dst.storage, &src.storage) {
        (Storage::Host(_), Storage::Host(_)) => {
            if Arc::ptr_eq(dst, src) {
                return Ok(());
            }
            let input = src.read_blocks()?;
            let mut output = dst.write_blocks()?;
            let input: &[u8] = bytemuck::cast_slice(&input[..]);
            let output: &mut [u8] = bytemuck::cast_slice_mut(&mut output[..]);
            output[..size].copy_from_slice(&input[..size]);
            Ok(())
        }
        (Storage::Gpu { context, buffer }, Storage::Host(_)) => {
            ensure_debug!(
                dst_stream.context().is_none_or(|c| c.id() == context.id()),
                DeviceError::ContextMismatch
            );
            let input = src.read_blocks()?;
            let input: &[u8] = bytemuck::cast_slice(&input[..]);
            // host blocks are 16-byte granular, so the padded range is in bounds
            context
                .queue()
                .write_buffer(buffer, 0, &input[..align_copy(size)]);
            Ok(())
        }
        (Storage::Host(_), Storage::Gpu { context, buffer }) => {
            ensure_debug!(
                src_stream.context().is_none_or(|c| c.id() == context.id()),
                DeviceError::ContextMismatch
            );
            let output = dst.clone();
            // failures surface on the next host wait on the context
            let reporter = Arc::downgrade(context);
            let slice = buffer.slice(..align_copy(size) as u64);
            wgpu::util::DownloadBuffer::read_buffer(
                context.device(),
                context.queue(),
                &slice,
                move |data| {
                    let result = data.map_err(DeviceError::from).and_then(|data| {
                        output.write_host::<u8, _>(|output| {
                            output[..size].copy_from_slice(&data[..size]);
                        })
                    });
                    if let Err(err) = result {
                        log::error!("failed to download buffer: {err}");
                        if let Some(context) = reporter.upgrade() {
                            context.report_failure(err);
                        }
                    }
                },
            );
            Ok(())
        }
        (
            Storage::Gpu {
                context: dst_context,
                buffer: output,
            },
            Storage::Gpu {
                context: src_context,
                buffer: input,
            },
        ) => {
            if dst_context.id() != src_context.id() {
                log::warn!(
                    "GPU to GPU copy across contexts {:?} and {:?}",
                    src_context.id(),
                    dst_context.id()
                );
                return Err(DeviceError::UnknownDeviceCombination(
                    Device::Gpu,
                    Device::Gpu,
                ));
            }
            if Arc::ptr_eq(dst, src) {
                return Ok(());
            }
            let _multi = create_multi_sync(dst_stream, &[src_stream])?;
            let mut encoder = dst_context
                .device()
                .create_command_encoder(&Default::default());
            encoder.copy_buffer_to_buffer(input, 0, output, 0, align_copy(size) as u64);
            dst_context.queue().submit(Some(encoder.finish()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::device::init_default_gpu;

    #[test]
    fn test_host_copy() -> Result<(), Box<dyn std::error::Error>> {
        let src = Arc::new(RawBuffer::new_host(5 * size_of::<u32>()));
        src.write_host::<u32, _>(|data| data.copy_from_slice(&[1, 2, 3, 4, 5]))?;
        let dst = Arc::new(RawBuffer::new_host(5 * size_of::<u32>()));

        let cpu = ComputeStream::Cpu;
        copy_buffer::<u32>(Some(&dst), &cpu, Some(&src), &cpu, 3)?;
        let data = dst.read_host::<u32, _>(|data| data.to_vec())?;
        assert_eq!(data, vec![1, 2, 3, 0, 0]);

        // self-copies are no-ops
        copy_buffer::<u32>(Some(&src), &cpu, Some(&src), &cpu, 5)?;
        Ok(())
    }

    #[test]
    fn test_null_buffers() -> Result<(), Box<dyn std::error::Error>> {
        let cpu = ComputeStream::Cpu;
        copy_buffer::<f32>(None, &cpu, None, &cpu, 0)?;
        let src = Arc::new(RawBuffer::new_host(16));
        assert!(matches!(
            copy_buffer::<f32>(None, &cpu, Some(&src), &cpu, 4),
            Err(DeviceError::NullBuffer)
        ));
        Ok(())
    }

    #[test]
    fn test_host_views() -> Result<(), Box<dyn std::error::Error>> {
        let buffer = RawBuffer::new_host(6);
        assert_eq!(buffer.device(), Device::Cpu);
        assert_eq!(buffer.read_host::<u16, _>(|data| data.len())?, 3);
        assert_eq!(buffer.read_host::<u32, _>(|data| data.len())?, 1);
        assert!(buffer.gpu_buffer().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_gpu_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let Ok(context) = init_default_gpu().await else {
            log::warn!("no GPU adapter, skipping");
            return Ok(());
        };
        let cpu = ComputeStream::Cpu;
        let gpu = ComputeStream::on_context(context.clone());

        let data: Vec<f32> = (0..7).map(|x| x as f32).collect();
        let host = Arc::new(RawBuffer::new_host(data.len() * 4));
        host.write_host::<f32, _>(|x| x.copy_from_slice(&data))?;

        let a = Arc::new(RawBuffer::alloc(&gpu, data.len() * 4));
        let b = Arc::new(RawBuffer::alloc(&gpu, data.len() * 4));
        assert_eq!(a.device(), Device::Gpu);
        copy_buffer::<f32>(Some(&a), &gpu, Some(&host), &cpu, data.len())?;
        copy_buffer::<f32>(Some(&b), &gpu, Some(&a), &gpu, data.len())?;

        let back = Arc::new(RawBuffer::new_host(data.len() * 4));
        copy_buffer::<f32>(Some(&back), &cpu, Some(&b), &gpu, data.len())?;
        gpu.wait_for_this()?;
        assert_eq!(back.read_host::<f32, _>(|x| x.to_vec())?, data);
        Ok(())
    }
}
