use std::{marker::PhantomData, sync::Arc};

use derive_more::{Deref, DerefMut, Display};
use thiserror::Error;

use super::{
    ErrorKind,
    buffer::RawBuffer,
    device::{Device, DeviceError},
    dispatch::DispatchError,
    ensure_debug,
    layout::{self, DimType},
    num::{HasTypeInfo, Scalar, TypeInfo},
    sync::ComputeStream,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("conversion from {0} to {1} is not supported")]
    UnsupportedConversion(TypeInfo, TypeInfo),
    #[error("cannot resize a view")]
    ResizeView,
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("tensor memory is not ensured")]
    NotEnsured,
    #[error("tensor shape error: expected {expected} elements, got {actual}")]
    Shape { expected: usize, actual: usize },
    #[error("tensor rank error: shape has {shape} axes, got {actual}")]
    Rank { shape: usize, actual: usize },
    #[error("index {index:?} is out of shape {shape:?}")]
    Index { index: Vec<usize>, shape: Vec<usize> },
    #[error("tensor memory is not accessible from host: it resides on {0}")]
    NotHost(Device),
    #[error("tensor is not viewable as a matrix: {0}")]
    NotViewable(&'static str),
    #[error("tensor type error: data type {0} mismatches {1}")]
    Type(TypeInfo, TypeInfo),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl TensorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TensorError::UnsupportedConversion(..)
            | TensorError::ResizeView
            | TensorError::Unsupported(_) => ErrorKind::Unsupported,
            TensorError::Device(err) => err.kind(),
            TensorError::Dispatch(err) => err.kind(),
            _ => ErrorKind::Precondition,
        }
    }
}

/// Whether a tensor owns its buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Ownership {
    /// Owns the buffer; may reallocate it.
    #[default]
    Exclusive,
    /// Shares the buffer of another tensor; never reallocates it.
    View,
}

/// A strided tensor with a runtime element type.
///
/// Memory is allocated on [`ensure`](Self::ensure), or at construction for non-lazy tensors,
/// and is released once the last tensor viewing it is gone. Tensors with no elements never
/// hold memory.
#[derive(Debug)]
pub struct TensorUntyped {
    shape: Vec<usize>,
    dim_types: Vec<DimType>,
    strides: Vec<usize>,
    dtype: TypeInfo,
    device: Device,
    stream: ComputeStream,
    buffer: Option<Arc<RawBuffer>>,
    ownership: Ownership,
    lazy: bool,
}

impl TensorUntyped {
    /// A packed tensor on the device of `stream`, with all axes of [`DimType::Any`].
    pub fn new(
        dtype: TypeInfo,
        shape: &[usize],
        stream: ComputeStream,
        lazy: bool,
    ) -> Result<Self, TensorError> {
        let dim_types = vec![DimType::Any; shape.len()];
        Self::with_layout(dtype, shape, &dim_types, None, stream, lazy)
    }

    /// A tensor with explicit axis tags and optional strides. Strides default to packed.
    pub fn with_layout(
        dtype: TypeInfo,
        shape: &[usize],
        dim_types: &[DimType],
        strides: Option<&[usize]>,
        stream: ComputeStream,
        lazy: bool,
    ) -> Result<Self, TensorError> {
        let mut tensor = Self {
            shape: vec![],
            dim_types: vec![],
            strides: vec![],
            dtype,
            device: stream.device(),
            stream,
            buffer: None,
            ownership: Ownership::Exclusive,
            lazy,
        };
        tensor.resize(shape, dim_types, strides)?;
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
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[inline]
    pub fn dtype(&self) -> TypeInfo {
        self.dtype
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn stream(&self) -> &ComputeStream {
        &self.stream
    }

    #[inline]
    pub fn buffer(&self) -> Option<&Arc<RawBuffer>> {
        self.buffer.as_ref()
    }

    #[inline]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    #[inline]
    pub fn is_view(&self) -> bool {
        self.ownership == Ownership::View
    }

    #[inline]
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn numel(&self) -> usize {
        layout::numel(&self.shape)
    }

    /// Number of elements between the first and the last one, inclusive.
    #[inline]
    pub fn extent(&self) -> usize {
        layout::extent_from_strides(&self.shape, &self.strides)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        layout::is_contiguous(&self.shape, &self.strides)
    }

    #[inline]
    pub fn is_chw_packed(&self) -> bool {
        layout::is_chw_packed(&self.shape, &self.strides)
    }

    /// Checks if the memory of a non-empty tensor is allocated.
    #[inline]
    pub fn is_ensured(&self) -> bool {
        self.is_empty() || self.buffer.is_some()
    }

    /// Changes the layout. The buffer is released if the layout differs; a non-lazy tensor
    /// allocates a new one immediately.
    ///
    /// Views may only be "resized" to their current shape and strides.
    pub fn resize(
        &mut self,
        shape: &[usize],
        dim_types: &[DimType],
        strides: Option<&[usize]>,
    ) -> Result<(), TensorError> {
        ensure_debug!(
            dim_types.len() == shape.len(),
            TensorError::Rank {
                shape: shape.len(),
                actual: dim_types.len(),
            }
        );
        let strides = match strides {
            Some(strides) => {
                ensure_debug!(
                    strides.len() == shape.len(),
                    TensorError::Rank {
                        shape: shape.len(),
                        actual: strides.len(),
                    }
                );
                strides.to_vec()
            }
            None => layout::contiguous_strides(shape),
        };

        let same = self.shape == shape && self.strides == strides;
        if self.is_view() {
            return match same {
                true => {
                    self.dim_types = dim_types.to_vec();
                    Ok(())
                }
                false => Err(TensorError::ResizeView),
            };
        }
        if !same {
            self.buffer = None;
        }
        self.shape = shape.to_vec();
        self.dim_types = dim_types.to_vec();
        self.strides = strides;

        if !self.lazy {
            self.ensure()?;
        }
        Ok(())
    }

    /// Allocates memory for all elements if not yet allocated.
    pub fn ensure(&mut self) -> Result<(), TensorError> {
        if self.is_ensured() {
            return Ok(());
        }
        if self.is_view() {
            return Err(TensorError::NotEnsured);
        }
        let size = self.extent() * self.dtype.size();
        self.buffer = Some(Arc::new(RawBuffer::alloc(&self.stream, size)));
        Ok(())
    }

    /// Drops all elements, leaving a rank-0 tensor that owns nothing.
    pub fn empty(&mut self) {
        self.shape.clear();
        self.dim_types.clear();
        self.strides.clear();
        self.buffer = None;
        self.ownership = Ownership::Exclusive;
    }

    /// A tensor sharing this tensor's memory.
    pub fn view(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            dim_types: self.dim_types.clone(),
            strides: self.strides.clone(),
            dtype: self.dtype,
            device: self.device,
            stream: self.stream.clone(),
            buffer: self.buffer.clone(),
            ownership: Ownership::View,
            lazy: self.lazy,
        }
    }

    /// A view tagged with another device. Only meaningful on unified memory systems.
    pub(crate) fn view_on(&self, device: Device, stream: ComputeStream) -> Self {
        Self {
            device,
            stream,
            ..self.view()
        }
    }

    /// Changes the stream future work on this tensor is issued on.
    pub fn set_stream(&mut self, stream: ComputeStream) -> Result<(), TensorError> {
        ensure_debug!(
            stream.device() == self.device,
            DeviceError::Mismatch {
                expected: self.device,
                actual: stream.device(),
            }
        );
        self.stream = stream;
        Ok(())
    }

    /// Converts the untyped tensor to a typed one. Returns error if type mismatches.
    pub fn try_into_typed<T: Scalar>(self) -> Result<Tensor<T>, TensorError> {
        let info = TypeInfo::of::<T>();
        if self.dtype != info {
            return Err(TensorError::Type(self.dtype, info));
        }
        Ok(Tensor {
            tensor: self,
            phantom: PhantomData,
        })
    }
}

impl HasTypeInfo for TensorUntyped {
    #[inline]
    fn type_info(&self) -> TypeInfo {
        self.dtype
    }
}

/// A statically typed tensor. Good to fit into typed APIs.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub struct Tensor<T> {
    #[deref]
    #[deref_mut]
    tensor: TensorUntyped,
    phantom: PhantomData<T>,
}

impl<T: Scalar> HasTypeInfo for Tensor<T> {
    #[inline]
    fn type_info(&self) -> TypeInfo {
        self.tensor.dtype
    }
}

impl<T: Scalar> Tensor<T> {
    /// A lazily allocated packed tensor on the default stream of `device`.
    pub fn new(shape: &[usize], device: Device) -> Result<Self, TensorError> {
        let stream = ComputeStream::new(device)?;
        Self::new_on(shape, stream, true)
    }

    pub fn new_on(shape: &[usize], stream: ComputeStream, lazy: bool) -> Result<Self, TensorError> {
        TensorUntyped::new(TypeInfo::of::<T>(), shape, stream, lazy)?.try_into_typed()
    }

    /// A packed host tensor holding `data` in column-major order.
    pub fn from_slice(shape: &[usize], data: &[T]) -> Result<Self, TensorError> {
        let expected = layout::numel(shape);
        if data.len() != expected {
            return Err(TensorError::Shape {
                expected,
                actual: data.len(),
            });
        }
        let tensor = Self::new_on(shape, ComputeStream::Cpu, false)?;
        tensor.write(|x| x.copy_from_slice(data))?;
        Ok(tensor)
    }

    /// Transform the tensor into an untyped one.
    #[inline]
    pub fn into_untyped(self) -> TensorUntyped {
        self.tensor
    }

    /// A typed tensor sharing this tensor's memory.
    pub fn view(&self) -> Self {
        Self {
            tensor: self.tensor.view(),
            phantom: PhantomData,
        }
    }

    fn host_buffer(&self) -> Result<Option<&Arc<RawBuffer>>, TensorError> {
        if self.is_empty() {
            return Ok(None);
        }
        let buffer = self.buffer().ok_or(TensorError::NotEnsured)?;
        match buffer.device() {
            Device::Cpu => Ok(Some(buffer)),
            device => Err(TensorError::NotHost(device)),
        }
    }

    /// Reads the host memory spanned by the tensor, indexed by strides.
    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R, TensorError> {
        let extent = self.extent();
        match self.host_buffer()? {
            Some(buffer) => Ok(buffer.read_host(|data: &[T]| f(&data[..extent]))?),
            None => Ok(f(&[])),
        }
    }

    /// Writes the host memory spanned by the tensor, indexed by strides.
    pub fn write<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R, TensorError> {
        let extent = self.extent();
        match self.host_buffer()? {
            Some(buffer) => Ok(buffer.write_host(|data: &mut [T]| f(&mut data[..extent]))?),
            None => Ok(f(&mut [])),
        }
    }

    /// Gathers the elements in column-major order.
    pub fn to_vec(&self) -> Result<Vec<T>, TensorError> {
        self.read(|data| {
            let mut output = Vec::with_capacity(self.numel());
            layout::for_ndim(&self.shape, |index| {
                output.push(data[layout::offset(index, &self.strides)])
            });
            output
        })
    }

    pub fn get(&self, index: &[usize]) -> Result<T, TensorError> {
        if !layout::is_index_in_shape(index, &self.shape) {
            return Err(TensorError::Index {
                index: index.to_vec(),
                shape: self.shape.clone(),
            });
        }
        let offset = layout::offset(index, &self.strides);
        self.read(|data| data[offset])
    }
}
