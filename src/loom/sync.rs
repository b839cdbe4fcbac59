//! Ordering primitives: compute streams and sync events.
//!
//! Host work is always synchronous, so every CPU stream and every CPU event is equivalent.
//! A GPU stream belongs to a [`GpuContext`]; streams of the same context share its in-order
//! queue, so ordering between them only matters across contexts and towards the host.

use std::{
    hash::{Hash, Hasher},
    sync::{Arc, Mutex},
};

use derive_more::{Deref, Display};

use super::{
    device::{Device, DeviceError, GpuContext, default_gpu},
    ensure_debug,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId;

/// Polls the device, then reports any failure of asynchronous work seen so far.
fn poll(context: &GpuContext, poll_type: wgpu::PollType) -> Result<(), DeviceError> {
    context
        .device()
        .poll(poll_type)
        .map_err(|err| DeviceError::Poll(err.to_string()))?;
    match context.take_failure() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// An ordered execution context on a GPU.
#[derive(Debug, Clone)]
pub struct GpuStream {
    context: Arc<GpuContext>,
    id: uid::Id<StreamId>,
}

impl PartialEq for GpuStream {
    fn eq(&self, other: &Self) -> bool {
        self.context.id() == other.context.id() && self.id == other.id
    }
}

impl Eq for GpuStream {}

impl Hash for GpuStream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.id().hash(state);
        self.id.hash(state);
    }
}

impl GpuStream {
    #[inline]
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    #[inline]
    pub fn id(&self) -> uid::Id<StreamId> {
        self.id
    }
}

/// A device and an ordered execution context on it.
///
/// Equality and hashing follow the identity of the underlying context, so independently
/// constructed handles to the same context are interchangeable as map keys.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Display)]
pub enum ComputeStream {
    #[default]
    #[display("cpu")]
    Cpu,
    #[display("gpu({:?}, {:?})", _0.context.id(), _0.id)]
    Gpu(GpuStream),
}

impl ComputeStream {
    /// The default stream of `device`.
    pub fn new(device: Device) -> Result<Self, DeviceError> {
        match device {
            Device::Cpu => Ok(Self::Cpu),
            Device::Gpu => {
                let context = default_gpu().ok_or(DeviceError::GpuUnavailable)?;
                Ok(Self::on_context(context))
            }
        }
    }

    /// The default stream of a GPU context.
    pub fn on_context(context: Arc<GpuContext>) -> Self {
        let id = context.default_stream();
        Self::Gpu(GpuStream { context, id })
    }

    /// The default stream of a device and queue created outside the engine. A device already
    /// known to the engine yields the stream of its existing context.
    pub fn from_wgpu(device: wgpu::Device, queue: wgpu::Queue, unified_memory: bool) -> Self {
        Self::on_context(GpuContext::from_wgpu(device, queue, unified_memory))
    }

    #[inline]
    pub fn device(&self) -> Device {
        match self {
            ComputeStream::Cpu => Device::Cpu,
            ComputeStream::Gpu(_) => Device::Gpu,
        }
    }

    #[inline]
    pub fn gpu(&self) -> Option<&GpuStream> {
        match self {
            ComputeStream::Cpu => None,
            ComputeStream::Gpu(stream) => Some(stream),
        }
    }

    /// The GPU context the stream submits to.
    #[inline]
    pub fn context(&self) -> Option<&Arc<GpuContext>> {
        self.gpu().map(GpuStream::context)
    }

    /// Records the current point of this stream into `event`.
    pub fn add_sync_point(&self, event: &SyncEvent) -> Result<(), DeviceError> {
        ensure_debug!(
            self.device() == event.device(),
            DeviceError::Mismatch {
                expected: self.device(),
                actual: event.device(),
            }
        );
        match (self, event) {
            (ComputeStream::Gpu(stream), SyncEvent::Gpu(event)) => {
                if stream.context.id() != event.context.id() {
                    return Err(DeviceError::ContextMismatch);
                }
                let index = stream.context.queue().submit(std::iter::empty());
                event
                    .index
                    .lock()
                    .expect("failed to lock sync event")
                    .replace(index);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Makes all future work on this stream wait for `other`.
    pub fn wait_for(&self, other: &impl SyncPoint) -> Result<(), DeviceError> {
        match (self.context(), other.context()) {
            // host work is always complete
            (_, None) => Ok(()),
            (Some(this), Some(that)) if this.id() == that.id() => Ok(()),
            _ => other.host_wait(),
        }
    }

    /// Blocks the host until all work submitted to this stream is done.
    pub fn wait_for_this(&self) -> Result<(), DeviceError> {
        self.host_wait()
    }
}

/// A point in some stream's work that other streams or the host can wait on.
pub trait SyncPoint {
    fn device(&self) -> Device;

    fn context(&self) -> Option<&Arc<GpuContext>>;

    /// Blocks the host until the point is reached.
    fn host_wait(&self) -> Result<(), DeviceError>;
}

impl SyncPoint for ComputeStream {
    #[inline]
    fn device(&self) -> Device {
        self.device()
    }

    #[inline]
    fn context(&self) -> Option<&Arc<GpuContext>> {
        self.context()
    }

    fn host_wait(&self) -> Result<(), DeviceError> {
        match self {
            ComputeStream::Cpu => Ok(()),
            ComputeStream::Gpu(stream) => poll(&stream.context, wgpu::PollType::Wait),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GpuEvent {
    context: Arc<GpuContext>,
    id: uid::Id<EventId>,
    index: Arc<Mutex<Option<wgpu::SubmissionIndex>>>,
}

impl PartialEq for GpuEvent {
    fn eq(&self, other: &Self) -> bool {
        self.context.id() == other.context.id() && self.id == other.id
    }
}

impl Eq for GpuEvent {}

impl Hash for GpuEvent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.context.id().hash(state);
        self.id.hash(state);
    }
}

/// A synchronization point recorded on a stream.
///
/// An event that was never recorded is already reached.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    #[default]
    Cpu,
    Gpu(GpuEvent),
}

impl SyncEvent {
    /// A fresh event on the default context of `device`.
    pub fn new(device: Device) -> Result<Self, DeviceError> {
        match device {
            Device::Cpu => Ok(Self::Cpu),
            Device::Gpu => {
                let context = default_gpu().ok_or(DeviceError::GpuUnavailable)?;
                Ok(Self::on_context(context))
            }
        }
    }

    /// A fresh event on a GPU context.
    pub fn on_context(context: Arc<GpuContext>) -> Self {
        Self::Gpu(GpuEvent {
            context,
            id: uid::Id::new(),
            index: Default::default(),
        })
    }

    #[inline]
    pub fn device(&self) -> Device {
        match self {
            SyncEvent::Cpu => Device::Cpu,
            SyncEvent::Gpu(_) => Device::Gpu,
        }
    }

    /// Blocks the host until the recorded point is reached.
    #[inline]
    pub fn wait_for_this(&self) -> Result<(), DeviceError> {
        self.host_wait()
    }
}

impl SyncPoint for SyncEvent {
    #[inline]
    fn device(&self) -> Device {
        self.device()
    }

    #[inline]
    fn context(&self) -> Option<&Arc<GpuContext>> {
        match self {
            SyncEvent::Cpu => None,
            SyncEvent::Gpu(event) => Some(&event.context),
        }
    }

    fn host_wait(&self) -> Result<(), DeviceError> {
        let SyncEvent::Gpu(event) = self else {
            return Ok(());
        };
        let index = event
            .index
            .lock()
            .expect("failed to lock sync event")
            .clone();
        match index {
            Some(index) => poll(
                &event.context,
                wgpu::PollType::WaitForSubmissionIndex(index),
            ),
            None => Ok(()),
        }
    }
}

/// Creates a stream distinct from the default one. GPU streams are created on the default
/// context.
pub fn create_new_compute_stream(device: Device) -> Result<ComputeStream, DeviceError> {
    let stream = match ComputeStream::new(device)? {
        ComputeStream::Cpu => ComputeStream::Cpu,
        ComputeStream::Gpu(GpuStream { context, .. }) => ComputeStream::Gpu(GpuStream {
            context,
            id: uid::Id::new(),
        }),
    };
    log::trace!("create compute stream {stream}");
    Ok(stream)
}

/// Releases a stream created with [`create_new_compute_stream`].
pub fn destroy_compute_stream(stream: ComputeStream) {
    log::trace!("destroy compute stream {stream}");
    drop(stream);
}

#[inline]
pub fn create_new_sync_event(device: Device) -> Result<SyncEvent, DeviceError> {
    SyncEvent::new(device)
}

#[inline]
pub fn destroy_sync_event(event: SyncEvent) {
    drop(event);
}

/// Makes every stream in `others` wait for `main`.
pub fn all_wait_on_stream(main: &ComputeStream, others: &[&ComputeStream]) -> Result<(), DeviceError> {
    others.iter().try_for_each(|other| other.wait_for(main))
}

/// Makes `main` wait for every stream in `others`.
pub fn stream_wait_on_all(main: &ComputeStream, others: &[&ComputeStream]) -> Result<(), DeviceError> {
    others.iter().try_for_each(|&other| main.wait_for(other))
}

/// Several streams merged into one synchronization unit.
///
/// Work issued on the main stream is ordered after all streams; once the unit is dropped, all
/// streams are ordered after that work.
#[derive(Debug, Deref)]
pub struct MultiSync {
    #[deref]
    main: ComputeStream,
    others: Vec<ComputeStream>,
}

impl Drop for MultiSync {
    fn drop(&mut self) {
        for other in &self.others {
            if let Err(err) = other.wait_for(&self.main) {
                log::error!("failed to join stream {other} on {}: {err}", self.main);
            }
        }
    }
}

pub fn create_multi_sync(
    main: &ComputeStream,
    others: &[&ComputeStream],
) -> Result<MultiSync, DeviceError> {
    stream_wait_on_all(main, others)?;
    let main = main.clone();
    let others = others
        .iter()
        .filter(|other| ***other != main)
        .map(|&other| other.clone())
        .collect();
    Ok(MultiSync { main, others })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::loom::device::{GpuBuilder, init_default_gpu};

    #[test]
    fn test_cpu_streams_equal() -> Result<(), Box<dyn std::error::Error>> {
        let a = ComputeStream::new(Device::Cpu)?;
        let b = create_new_compute_stream(Device::Cpu)?;
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a.clone(), 42);
        assert_eq!(map.get(&b), Some(&42));

        let event = create_new_sync_event(Device::Cpu)?;
        a.add_sync_point(&event)?;
        b.wait_for(&event)?;
        b.wait_for(&a)?;
        b.wait_for_this()?;
        event.wait_for_this()?;
        assert_eq!(event, SyncEvent::Cpu);
        destroy_sync_event(event);
        destroy_compute_stream(b);
        Ok(())
    }

    #[test]
    fn test_cpu_multi_sync() -> Result<(), Box<dyn std::error::Error>> {
        let main = ComputeStream::Cpu;
        let other = ComputeStream::Cpu;
        let multi = create_multi_sync(&main, &[&other])?;
        assert_eq!(multi.device(), Device::Cpu);
        assert!(multi.others.is_empty());
        all_wait_on_stream(&main, &[&other])?;
        Ok(())
    }

    #[tokio::test]
    async fn test_gpu_streams() -> Result<(), Box<dyn std::error::Error>> {
        let Ok(context) = init_default_gpu().await else {
            log::warn!("no GPU adapter, skipping");
            return Ok(());
        };

        let a = ComputeStream::new(Device::Gpu)?;
        let b = ComputeStream::on_context(context.clone());
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a.clone(), "default");
        assert_eq!(map.get(&b), Some(&"default"));

        let c = create_new_compute_stream(Device::Gpu)?;
        assert_ne!(a, c);
        assert_ne!(a, ComputeStream::Cpu);
        assert!(!map.contains_key(&c));

        let event = create_new_sync_event(Device::Gpu)?;
        event.wait_for_this()?;
        a.add_sync_point(&event)?;
        c.wait_for(&event)?;
        ComputeStream::Cpu.wait_for(&event)?;
        event.wait_for_this()?;

        if crate::loom::DEBUG_CHECKS {
            assert!(matches!(
                ComputeStream::Cpu.add_sync_point(&event),
                Err(DeviceError::Mismatch { .. })
            ));
        }

        {
            let multi = create_multi_sync(&a, &[&c])?;
            assert_eq!(*multi, a);
            assert_eq!(multi.others, vec![c.clone()]);
        }
        c.wait_for_this()?;
        destroy_compute_stream(c);
        Ok(())
    }

    #[tokio::test]
    async fn test_wgpu_handles_share_context() -> Result<(), Box<dyn std::error::Error>> {
        let Ok(context) = init_default_gpu().await else {
            log::warn!("no GPU adapter, skipping");
            return Ok(());
        };
        let (device, queue) = (context.device().clone(), context.queue().clone());

        let a = ComputeStream::from_wgpu(device.clone(), queue.clone(), false);
        let b = ComputeStream::from_wgpu(device, queue, false);
        assert_eq!(a, b);
        assert_eq!(a, ComputeStream::new(Device::Gpu)?);
        assert!(Arc::ptr_eq(
            a.context().ok_or("not a GPU stream")?,
            &context
        ));
        // the flag of the existing context wins
        assert_eq!(
            b.context().map(|c| c.is_unified_memory()),
            Some(context.is_unified_memory())
        );

        let mut map = HashMap::new();
        map.insert(a, 1);
        map.insert(b.clone(), 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&b), Some(&2));
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_reports_async_failure() -> Result<(), Box<dyn std::error::Error>> {
        let Ok(builder) = GpuBuilder::request_default().await else {
            log::warn!("no GPU adapter, skipping");
            return Ok(());
        };
        let context = builder.build().await?;
        let stream = ComputeStream::on_context(context.clone());

        context.report_failure(DeviceError::Map(wgpu::BufferAsyncError));
        context.report_failure(DeviceError::NullBuffer);
        assert!(matches!(stream.wait_for_this(), Err(DeviceError::Map(_))));
        // reported once
        stream.wait_for_this()?;
        Ok(())
    }
}
