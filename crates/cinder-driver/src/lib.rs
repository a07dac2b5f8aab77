//! # cinder-driver
//!
//! The opaque device-driver capability surface that `cinder-core` consumes.
//!
//! Everything the resource-management core needs from a native GPU driver is
//! expressed as one object-safe trait, [`Driver`]: context create/destroy and
//! the thread-local current-context stack, device and unified memory
//! allocation, synchronous and stream-qualified copies and memsets, host
//! page-locking, stream lifecycle and synchronization, device introspection
//! and reset, elementwise/transpose/conjugate compute kernels parameterized
//! by element type, and per-queue BLAS/FFT library handles.
//!
//! Handles crossing this boundary ([`RawCtx`], [`RawStream`], [`DevAddr`],
//! [`RawBlas`], [`RawFft`]) are opaque `u64` newtypes; the core never
//! interprets them. The one implementation in-tree, [`host::HostDriver`],
//! emulates device memory and per-stream FIFO queues in process memory so
//! the core's lifetime, ordering, and numeric contracts can be exercised
//! without vendor hardware.

pub mod host;

use std::fmt;

/// Element types the driver kernels are parameterized by.
///
/// The `depth` attribute (1 for real, 2 for complex) matches how the native
/// kernels distinguish component counts; the component type is the scalar
/// the complex variants are built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE 754 real
    F32,
    /// 64-bit IEEE 754 real
    F64,
    /// Complex of two f32 components
    C32,
    /// Complex of two f64 components
    C64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::C32 => 8,
            DType::C64 => 16,
        }
    }

    /// Component count: 1 for real types, 2 for complex types.
    pub fn depth(&self) -> usize {
        match self {
            DType::F32 | DType::F64 => 1,
            DType::C32 | DType::C64 => 2,
        }
    }

    /// The scalar component type (f32-backed or f64-backed).
    pub fn component(&self) -> DType {
        match self {
            DType::F32 | DType::C32 => DType::F32,
            DType::F64 | DType::C64 => DType::F64,
        }
    }

    /// Whether this is a complex type.
    pub fn is_complex(&self) -> bool {
        self.depth() == 2
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::C32 => write!(f, "c32"),
            DType::C64 => write!(f, "c64"),
        }
    }
}

/// Opaque native context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCtx(pub u64);

/// Opaque native stream (queue) handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawStream(pub u64);

/// Opaque dense-linear-algebra library handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBlas(pub u64);

/// Opaque transform library handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawFft(pub u64);

/// Opaque device memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevAddr(pub u64);

/// Raw host pointer handed to asynchronous copies.
///
/// The pointed-to buffer must be page-locked and must stay alive (and, for
/// device-to-host copies, unread) until the next synchronization point on
/// the qualifying stream. The driver may touch it at any time in between.
#[derive(Debug, Clone, Copy)]
pub struct HostPtr(pub *mut u8);

// The pointer is only dereferenced by the driver while the caller upholds
// the pinned-buffer contract; it moves between threads as an address, not
// as an access path.
unsafe impl Send for HostPtr {}

/// A unified allocation: one set of bytes addressable both as a device
/// address and through a stable host pointer.
#[derive(Debug, Clone, Copy)]
pub struct UnifiedAlloc {
    pub addr: DevAddr,
    pub host: HostPtr,
}

/// In-place elementwise kernel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EwOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Static device identity, as reported by the native property query.
#[derive(Debug, Clone)]
pub struct DeviceProps {
    pub name: String,
}

/// Device memory report. `free` reflects system-wide usage, not just the
/// calling process, so `free < total` holds even with zero live allocations.
#[derive(Debug, Clone, Copy)]
pub struct MemInfo {
    pub free: u64,
    pub total: u64,
}

/// Driver-level failures.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no device with id {0}")]
    InvalidDevice(u32),

    #[error("device allocation of {nbytes} bytes failed")]
    OutOfMemory { nbytes: usize },

    #[error("stale or unknown {0} handle")]
    InvalidHandle(&'static str),

    #[error("driver call failed: {0}")]
    Failure(String),
}

/// The native driver capability set.
///
/// Consumed as `Arc<dyn Driver>`. Every call takes the context it operates
/// under explicitly; the driver maintains the thread-local current-context
/// stack that `ctx_push`/`ctx_pop` manipulate, and operations on memory or
/// streams assume their owning context is current.
///
/// Stream-qualified operations (`stream: Some(..)`) enqueue and return;
/// their effects are observable only after `stream_sync` on that stream or
/// `device_sync`. A `stream` of `None` targets the default queue.
pub trait Driver: Send + Sync + fmt::Debug {
    // --- context ---

    fn ctx_create(&self, device_id: u32) -> Result<RawCtx, DriverError>;
    fn ctx_destroy(&self, ctx: RawCtx) -> Result<(), DriverError>;
    fn ctx_push(&self, ctx: RawCtx) -> Result<(), DriverError>;
    fn ctx_pop(&self, ctx: RawCtx) -> Result<(), DriverError>;

    // --- memory ---

    fn mem_alloc(&self, ctx: RawCtx, nbytes: usize) -> Result<DevAddr, DriverError>;
    fn mem_alloc_unified(&self, ctx: RawCtx, nbytes: usize) -> Result<UnifiedAlloc, DriverError>;
    fn mem_free(&self, ctx: RawCtx, addr: DevAddr) -> Result<(), DriverError>;

    fn memcpy_h2d(&self, ctx: RawCtx, dst: DevAddr, src: &[u8]) -> Result<(), DriverError>;
    fn memcpy_d2h(&self, ctx: RawCtx, dst: &mut [u8], src: DevAddr) -> Result<(), DriverError>;
    fn memcpy_d2d(
        &self,
        ctx: RawCtx,
        dst: DevAddr,
        src: DevAddr,
        nbytes: usize,
    ) -> Result<(), DriverError>;

    /// Extent-described copy of a 3-dimensional region totalling `nbytes`.
    fn memcpy_3d(
        &self,
        ctx: RawCtx,
        dst: DevAddr,
        src: DevAddr,
        extent: [u32; 3],
        nbytes: usize,
    ) -> Result<(), DriverError>;

    /// # Safety
    ///
    /// `src` must point to `nbytes` of page-locked host memory that outlives
    /// the next synchronization point on `stream`.
    unsafe fn memcpy_h2d_async(
        &self,
        ctx: RawCtx,
        dst: DevAddr,
        src: HostPtr,
        nbytes: usize,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    /// # Safety
    ///
    /// `dst` must point to `nbytes` of page-locked host memory that outlives
    /// the next synchronization point on `stream`; the bytes are unspecified
    /// until then.
    unsafe fn memcpy_d2h_async(
        &self,
        ctx: RawCtx,
        dst: HostPtr,
        src: DevAddr,
        nbytes: usize,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    fn memcpy_d2d_async(
        &self,
        ctx: RawCtx,
        dst: DevAddr,
        src: DevAddr,
        nbytes: usize,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    fn memset(&self, ctx: RawCtx, addr: DevAddr, value: u8, nbytes: usize)
        -> Result<(), DriverError>;
    fn memset_async(
        &self,
        ctx: RawCtx,
        addr: DevAddr,
        value: u8,
        nbytes: usize,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    /// Page-lock `nbytes` of host memory starting at `addr`.
    fn mem_pin(&self, addr: usize, nbytes: usize) -> Result<(), DriverError>;
    /// Release a page-lock previously installed at `addr`.
    fn mem_unpin(&self, addr: usize) -> Result<(), DriverError>;

    // --- streams & synchronization ---

    fn stream_create(&self, ctx: RawCtx) -> Result<RawStream, DriverError>;
    fn stream_destroy(&self, ctx: RawCtx, stream: RawStream) -> Result<(), DriverError>;
    fn stream_sync(&self, ctx: RawCtx, stream: RawStream) -> Result<(), DriverError>;
    /// Block until all work on the device, default queue included, is done.
    fn device_sync(&self, ctx: RawCtx) -> Result<(), DriverError>;
    fn device_reset(&self, device_id: u32) -> Result<(), DriverError>;

    // --- introspection ---

    fn device_count(&self) -> usize;
    fn device_props(&self, device_id: u32) -> Result<DeviceProps, DriverError>;
    fn mem_info(&self, ctx: RawCtx) -> Result<MemInfo, DriverError>;

    // --- compute kernels ---

    /// In-place `dst op= src` over `len` elements.
    fn ew_vec(
        &self,
        ctx: RawCtx,
        op: EwOp,
        dst: DevAddr,
        src: DevAddr,
        len: usize,
        dtype: DType,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    /// In-place `dst op= value` over `len` elements; `value` is one element
    /// of `dtype` in native byte order.
    fn ew_scalar(
        &self,
        ctx: RawCtx,
        op: EwOp,
        dst: DevAddr,
        value: &[u8],
        len: usize,
        dtype: DType,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    /// In-place transpose of a `rows × cols` row-major matrix.
    fn transpose(
        &self,
        ctx: RawCtx,
        addr: DevAddr,
        rows: usize,
        cols: usize,
        dtype: DType,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    /// In-place complex conjugation over `len` elements. Only defined for
    /// complex dtypes.
    fn conjugate(
        &self,
        ctx: RawCtx,
        addr: DevAddr,
        len: usize,
        dtype: DType,
        stream: Option<RawStream>,
    ) -> Result<(), DriverError>;

    // --- compute libraries ---

    fn blas_create(&self, ctx: RawCtx, stream: Option<RawStream>) -> Result<RawBlas, DriverError>;
    fn blas_destroy(&self, ctx: RawCtx, handle: RawBlas) -> Result<(), DriverError>;

    /// `y += alpha * x` over `n` elements, enqueued on the handle's stream.
    fn blas_axpy(
        &self,
        ctx: RawCtx,
        handle: RawBlas,
        n: usize,
        alpha: &[u8],
        x: DevAddr,
        y: DevAddr,
        dtype: DType,
    ) -> Result<(), DriverError>;

    /// `x *= alpha` over `n` elements, enqueued on the handle's stream.
    fn blas_scal(
        &self,
        ctx: RawCtx,
        handle: RawBlas,
        n: usize,
        alpha: &[u8],
        x: DevAddr,
        dtype: DType,
    ) -> Result<(), DriverError>;

    /// Euclidean norm of `n` elements of `x`, returned on the host. Blocks:
    /// drains the handle's stream before computing, matching
    /// host-pointer-mode library semantics.
    fn blas_nrm2(
        &self,
        ctx: RawCtx,
        handle: RawBlas,
        n: usize,
        x: DevAddr,
        dtype: DType,
    ) -> Result<f64, DriverError>;

    fn fft_create(&self, ctx: RawCtx, stream: Option<RawStream>) -> Result<RawFft, DriverError>;
    fn fft_destroy(&self, ctx: RawCtx, handle: RawFft) -> Result<(), DriverError>;
}
