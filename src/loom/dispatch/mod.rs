//! Routing of generic operations to type-specific kernels.
//!
//! There are two paths:
//! 1. When every dispatched type is native, the [`NativeDispatchKey`] directly indexes a dense
//!    table built with [`native_dispatch_table!`](crate::native_dispatch_table).
//! 2. Otherwise, the kernel is looked up by operation name and [`DispatchKey`] in a
//!    [`DispatchRegistry`], which is how callers add support for their own element types.

use std::error::Error;

use thiserror::Error;

use super::{ErrorKind, num::TypeInfo};

mod entry;
mod key;
mod registry;

pub use entry::{DispatchEntry, DispatchFn};
pub use key::{
    BITS_PER_NATIVE_TYPE, BITS_PER_TYPE, DispatchKey, MAX_DISPATCH_TYPES,
    MAX_NATIVE_DISPATCH_TYPES, NativeDispatchKey,
};
pub use registry::{
    DispatchOn, DispatchRegistry, call_dispatch_entry, do_dispatch, get_dispatch_entry,
    has_dispatch_entry, register_dispatch_fn, unregister_dispatch_fn,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no dispatch entry for `{name}` with key {key}")]
    NotFound { name: String, key: DispatchKey },
    #[error("cannot dispatch on non-compute type {0}")]
    NonComputeType(TypeInfo),
    #[error("type {0} is not native")]
    NonNativeType(TypeInfo),
    #[error("{count} types do not fit in a dispatch key (max {max})")]
    TooManyTypes { count: usize, max: usize },
    #[error("dispatch arity mismatch: expected {expected} arguments, got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("dispatch argument {index} is not a `{expected}`")]
    ArgType { index: usize, expected: &'static str },
    #[error("native key {key} is out of the dispatch table of length {len}")]
    TableIndex { key: usize, len: usize },
    #[error("kernel error: {0}")]
    Kernel(Box<dyn Error + Send + Sync>),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::NonNativeType(_)
            | DispatchError::Arity { .. }
            | DispatchError::ArgType { .. } => ErrorKind::Precondition,
            _ => ErrorKind::Fatal,
        }
    }
}
