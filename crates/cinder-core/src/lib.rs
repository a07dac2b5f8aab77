//! # cinder-core
//!
//! GPU compute resource management for a host process: device contexts,
//! asynchronous execution streams, and device/unified memory allocations,
//! each with explicit lifetime and ownership rules.
//!
//! The vendor driver is consumed abstractly through the
//! [`Driver`](cinder_driver::Driver) capability trait; `cinder-driver`
//! ships an in-process emulation backend that the test suite runs against.
//!
//! - [`Device`] opens a context on one GPU and is the entry point for
//!   allocation, pinning, and stream creation; [`DeviceSet`] coordinates
//!   several from one host thread.
//! - [`DevicePtr`] and [`UnifiedPtr`] own allocations and free them exactly
//!   once, on [`release`](DevicePtr::release) or drop; [`BatchView`] is the
//!   explicit non-owning alias.
//! - [`Stream`] owns an asynchronous queue plus its per-queue
//!   compute-library handles; work enqueued through it becomes observable
//!   only after [`sync`](Stream::sync).
//! - [`MismatchPolicy`] draws the line between hard failures and the legacy
//!   warn-and-proceed compatibility behavior.
//!
//! A single host thread drives the API; concurrency lives device-side in
//! the streams, and cross-queue ordering exists only where a sync point
//! creates it.

pub mod context;
pub mod device;
pub mod devices;
pub mod dtype;
pub mod error;
pub mod fill;
pub mod libs;
pub mod memory;
pub mod pinned;
pub mod shape;
pub mod stream;

pub use context::Context;
pub use device::{Device, DeviceConfig, DeviceQuery};
pub use devices::DeviceSet;
pub use dtype::{DType, Element};
pub use error::{Error, MismatchPolicy, Result};
pub use fill::{Fill, HostSlice, Scalar};
pub use libs::{Blas, Fft};
pub use memory::{BatchView, DevicePtr, UnifiedPtr};
pub use pinned::PinnedHostRegistry;
pub use shape::Shape;
pub use stream::Stream;

/// Convenience re-exports for common cinder-core types.
///
/// ```rust
/// use cinder_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::Device;
    pub use crate::DeviceConfig;
    pub use crate::DeviceSet;
    pub use crate::DevicePtr;
    pub use crate::DType;
    pub use crate::Error;
    pub use crate::Fill;
    pub use crate::MismatchPolicy;
    pub use crate::Result;
    pub use crate::Scalar;
    pub use crate::Shape;
    pub use crate::Stream;
    pub use crate::UnifiedPtr;
}
