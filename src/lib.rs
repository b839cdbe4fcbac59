//! `dihydro` is a distributed, device-aware N-dimensional array engine.
//!
//! The crate is split in two layers:
//! - [`loom`]: element types, kernel dispatch, devices and streams, buffers, local and
//!   distributed tensors.
//! - [`hal`]: operations built on top of `loom`, such as tensor copies, device accessibility
//!   views and the dispatched API methods.

extern crate self as dihydro;

pub mod hal;
pub mod loom;

pub use dihydro_derive::native_dispatch_table;
