use std::sync::{Arc, Mutex, OnceLock, Weak};

use thiserror::Error;

use super::DeviceError;
use crate::loom::sync::StreamId;

static DEFAULT_GPU: OnceLock<Arc<GpuContext>> = OnceLock::new();

/// Every live context, so that a device maps to exactly one context.
static CONTEXTS: Mutex<Vec<Weak<GpuContext>>> = Mutex::new(Vec::new());

/// Returns the process-wide GPU context, if one is installed.
#[inline]
pub fn default_gpu() -> Option<Arc<GpuContext>> {
    DEFAULT_GPU.get().cloned()
}

/// Builds a GPU context from the default adapter and installs it, unless one is installed.
/// Returns the installed context.
pub async fn init_default_gpu() -> Result<Arc<GpuContext>, GpuBuildError> {
    if let Some(context) = default_gpu() {
        return Ok(context);
    }
    let context = GpuBuilder::request_default().await?.build().await?;
    Ok(context.install())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuContextId;

/// Checks if an adapter shares physical memory with the host.
#[inline]
pub fn is_unified_memory_adapter(info: &wgpu::AdapterInfo) -> bool {
    matches!(
        info.device_type,
        wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::Cpu
    )
}

/// A WebGPU device and its queue.
///
/// All streams of a context submit to the same in-order queue; they differ in identity only.
#[derive(Debug)]
pub struct GpuContext {
    /// The unique identifier of the context.
    id: uid::Id<GpuContextId>,
    /// Handle to a WebGPU compute device.
    device: wgpu::Device,
    /// The WebGPU command queue.
    queue: wgpu::Queue,
    /// Whether host and device share physical memory.
    unified_memory: bool,
    /// The stream handed out by [`ComputeStream::new`](crate::loom::sync::ComputeStream::new).
    default_stream: uid::Id<StreamId>,
    /// The first failure of asynchronous work not yet reported to a waiting host.
    failure: Mutex<Option<DeviceError>>,
}

impl GpuContext {
    /// Wraps a device and queue created elsewhere.
    ///
    /// A device that already backs a live context resolves to that context, which keeps its
    /// own queue and unified memory flag.
    pub fn from_wgpu(
        device: wgpu::Device,
        queue: wgpu::Queue,
        unified_memory: bool,
    ) -> Arc<Self> {
        let mut contexts = CONTEXTS.lock().expect("failed to lock GPU contexts");
        contexts.retain(|context| context.strong_count() > 0);
        let existing = contexts
            .iter()
            .filter_map(Weak::upgrade)
            .find(|context| context.device == device);
        if let Some(context) = existing {
            log::trace!("resolve device to GPU context {:?}", context.id);
            return context;
        }

        let context = Arc::new(Self {
            id: uid::Id::new(),
            device,
            queue,
            unified_memory,
            default_stream: uid::Id::new(),
            failure: Mutex::new(None),
        });
        contexts.push(Arc::downgrade(&context));
        context
    }

    #[inline]
    pub fn id(&self) -> uid::Id<GpuContextId> {
        self.id
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    #[inline]
    pub fn is_unified_memory(&self) -> bool {
        self.unified_memory
    }

    #[inline]
    pub fn default_stream(&self) -> uid::Id<StreamId> {
        self.default_stream
    }

    /// Records a failure of asynchronous work. Only the first one is kept until taken.
    pub(crate) fn report_failure(&self, err: DeviceError) {
        let mut failure = self.failure.lock().expect("failed to lock GPU context");
        match failure.as_ref() {
            Some(first) => log::error!("GPU context {:?}: {err} after {first}", self.id),
            None => *failure = Some(err),
        }
    }

    /// Takes the pending failure, if any.
    pub(crate) fn take_failure(&self) -> Option<DeviceError> {
        self.failure
            .lock()
            .expect("failed to lock GPU context")
            .take()
    }

    /// Makes this the process-wide GPU context. If another context won the race, that one is
    /// kept and returned instead.
    pub fn install(self: Arc<Self>) -> Arc<Self> {
        let installed = DEFAULT_GPU.get_or_init(|| self.clone());
        if Arc::ptr_eq(installed, &self) {
            log::info!("install GPU context {:?}", self.id);
        }
        installed.clone()
    }
}

pub struct GpuBuilder {
    pub adapter: wgpu::Adapter,
    pub features: wgpu::Features,
    pub limits: wgpu::Limits,
    pub unified_memory: Option<bool>,
}

#[derive(Debug, Error)]
pub enum GpuBuildError {
    #[error("failed to request adaptor")]
    RequestAdapterError(#[from] wgpu::RequestAdapterError),
    #[error("failed to request device")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
}

impl GpuBuilder {
    pub fn new(adapter: wgpu::Adapter) -> Self {
        Self {
            adapter,
            features: wgpu::Features::empty(),
            limits: Default::default(),
            unified_memory: None,
        }
    }

    /// Requests the default high-performance adapter.
    pub async fn request_default() -> Result<Self, GpuBuildError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await?;
        Ok(Self::new(adapter))
    }

    pub async fn build(self) -> Result<Arc<GpuContext>, GpuBuildError> {
        let Self {
            adapter,
            features,
            limits,
            unified_memory,
        } = self;

        let info = adapter.get_info();
        let unified_memory = unified_memory.unwrap_or(is_unified_memory_adapter(&info));

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: features,
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let context = GpuContext::from_wgpu(device, queue, unified_memory);
        log::info!(
            "create GPU context {:?} on {} ({:?}, unified memory: {unified_memory})",
            context.id,
            info.name,
            info.backend
        );
        Ok(context)
    }

    pub fn limits(mut self, limits: wgpu::Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn features(mut self, features: wgpu::Features) -> Self {
        self.features = features;
        self
    }

    /// Overrides the unified memory detection, which otherwise trusts the adapter type.
    pub fn unified_memory(mut self, unified_memory: bool) -> Self {
        self.unified_memory = Some(unified_memory);
        self
    }
}
