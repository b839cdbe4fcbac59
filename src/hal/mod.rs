//! Operations built on top of [`loom`](crate::loom).
//!
//! - [`copy`]: tensor copies, distributed copies and device accessibility views.
//! - [`ops`]: the dispatched API methods and their routing.
//! - [`cpu`] and [`gpu`]: per-device kernels behind [`ops`].
//! - `interop`: matrix views through `faer` (feature `faer`).

pub mod copy;
pub mod cpu;
pub mod gpu;
#[cfg(feature = "faer")]
pub mod interop;
pub mod ops;
