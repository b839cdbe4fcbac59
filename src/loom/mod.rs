//! The `loom` module provides the foundational abstractions of the array engine.
//! It defines how dense arrays are laid out in memory, how they are split across a grid of
//! processes, how raw memory moves between the host and accelerators, and how generic
//! operations are routed to type- and device-specific kernels.
//!
//! ## Key Components
//! 1. **Numerical System**:
//!    - Element types and their runtime [`TypeInfo`](num::TypeInfo) tokens.
//!    - A process-wide type registry separating native compute types from extension types.
//!
//! 2. **Dispatch**:
//!    - Packed dispatch keys (native and general encodings).
//!    - Dense native dispatch tables and a name/key registry for extension types.
//!
//! 3. **Device Abstraction**:
//!    - Host and WebGPU devices, compute streams and sync events.
//!    - Device-pair-aware buffer copies.
//!
//! 4. **Tensors**:
//!    - Strided local tensors with lazily allocated, shareable buffers.
//!    - Distributed tensors over a process grid.
//!
//! ## Execution Model
//! Host work is synchronous and always ordered. Device work is enqueued on a
//! [`ComputeStream`](sync::ComputeStream) and returns immediately; ordering across streams is
//! only established through explicit sync points.

pub mod buffer;
pub mod device;
pub mod dispatch;
pub mod dist;
pub mod grid;
pub mod layout;
pub mod num;
pub mod sync;
pub mod tensor;

use derive_more::Display;

/// Whether precondition checks are performed.
///
/// Checks are always on in debug builds; release builds only check with the `strict` feature.
pub const DEBUG_CHECKS: bool = cfg!(any(debug_assertions, feature = "strict"));

/// Returns early with the given error if precondition checks are enabled and `cond` fails.
macro_rules! ensure_debug {
    ($cond:expr, $err:expr) => {
        if $crate::loom::DEBUG_CHECKS && !($cond) {
            return Err($err.into());
        }
    };
}

pub(crate) use ensure_debug;

/// Classification of errors raised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// Unsupported configuration; stops the operation and is never recovered locally.
    Fatal,
    /// Violation of a caller contract, only detected with [`DEBUG_CHECKS`].
    Precondition,
    /// A recognized operation that is not implemented.
    Unsupported,
}

/// Installs a `tracing` subscriber printing spans and events to stdout.
#[cfg(feature = "trace")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
