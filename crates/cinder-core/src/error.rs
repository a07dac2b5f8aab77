//! Error taxonomy and the advisory/hard-failure policy.

use cinder_driver::{DType, DriverError};

use crate::shape::Shape;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced to callers.
///
/// Programmer errors the source design treated as fatal (double release,
/// destroying a pushed context, destroying a stream with in-flight work) do
/// not appear here: ownership and drop ordering make them unrepresentable.
/// Teardown-path anomalies are logged and teardown continues.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed construction arguments.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Context creation failed for the given device id.
    #[error("device {device_id} unavailable: {source}")]
    DeviceUnavailable {
        device_id: u32,
        #[source]
        source: DriverError,
    },

    /// Device allocation failed.
    #[error("allocation of {nbytes} bytes failed: {source}")]
    Allocation {
        nbytes: usize,
        #[source]
        source: DriverError,
    },

    /// A copy's resolved byte count exceeds the destination's capacity.
    /// Always a hard failure, never silently truncated.
    #[error("copy of {requested} bytes exceeds destination capacity of {capacity} bytes")]
    DestinationTooSmall { requested: usize, capacity: usize },

    /// Transpose invoked on a shape that is not exactly 2-dimensional.
    #[error("operation requires a 2-dimensional shape, got rank {ndim}")]
    UnsupportedRank { ndim: usize },

    /// Element types differ where the active policy requires them to match.
    #[error("dtype mismatch: {left} vs {right}")]
    DtypeMismatch { left: DType, right: DType },

    /// Shapes differ where the active policy requires them to match.
    #[error("shape mismatch: {left} vs {right}")]
    ShapeMismatch { left: Shape, right: Shape },

    /// Source and destination byte extents differ under the strict policy.
    #[error("source extent of {src} bytes does not match destination extent of {dst} bytes")]
    ExtentMismatch { src: usize, dst: usize },

    /// The operation is not defined for the handle's element type.
    #[error("{op} is unsupported for dtype {dtype}")]
    UnsupportedDtype { op: &'static str, dtype: DType },

    /// A host buffer was handed to an asynchronous copy without being
    /// page-locked through the pinned registry first.
    #[error("host buffer at {addr:#x} is not page-locked for asynchronous transfer")]
    UnpinnedHostBuffer { addr: usize },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Governs the boundary between advisory conditions and hard failures.
///
/// The source design warned and proceeded on dtype/shape mismatches,
/// truncating to the smaller extent, and let unpinned buffers reach the
/// async copy paths. [`MismatchPolicy::Permissive`] reproduces that behavior
/// as an explicit opt-in compatibility shim; truncation runs over
/// `min(src, dst)` flat elements in row-major order, with rank given no
/// special meaning. [`MismatchPolicy::Strict`] is the default and turns
/// every such condition into a hard error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MismatchPolicy {
    #[default]
    Strict,
    Permissive,
}

impl MismatchPolicy {
    pub fn is_strict(&self) -> bool {
        matches!(self, MismatchPolicy::Strict)
    }
}
