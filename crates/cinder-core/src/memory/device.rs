//! Owning handle over a device-exclusive allocation.

use std::sync::Arc;

use bytemuck::Zeroable;
use cinder_driver::{DevAddr, EwOp, HostPtr, RawStream};
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::dtype::{DType, Element};
use crate::error::{Error, MismatchPolicy, Result};
use crate::fill::{Fill, Scalar};
use crate::pinned::PinnedHostRegistry;
use crate::shape::Shape;
use crate::stream::Stream;

/// An owned device allocation plus its shape, element type, and byte size.
///
/// Allocation happens eagerly at construction; the memory is freed exactly
/// once, either by [`release`](DevicePtr::release) or on drop. The handle is
/// not `Clone`: each live `DevicePtr` owns a unique, non-aliased allocation
/// (the non-owning [`BatchView`](crate::memory::BatchView) is the explicit
/// aliasing escape hatch).
///
/// An optional affinity stream tags the handle at allocation time; async
/// operations that are not given an explicit stream target it, and it is a
/// weak reference in the ownership sense: the handle does not keep the
/// stream alive.
///
/// Synchronous operations block until the device completes them. The
/// `*_async` operations enqueue and return; their results are observable
/// only after a synchronization point on the relevant stream.
pub struct DevicePtr {
    ctx: Arc<Context>,
    pinned: Arc<PinnedHostRegistry>,
    addr: DevAddr,
    shape: Shape,
    dtype: DType,
    nbytes: usize,
    stream: Option<RawStream>,
    policy: MismatchPolicy,
    released: bool,
}

/// `min(src, requested)`, then a hard containment check against the
/// destination. Oversized copies are never silently truncated.
pub(crate) fn resolve_copy_bytes(
    src_nbytes: usize,
    requested: Option<usize>,
    dst_capacity: usize,
) -> Result<usize> {
    let n = requested.map_or(src_nbytes, |r| r.min(src_nbytes));
    if n > dst_capacity {
        return Err(Error::DestinationTooSmall {
            requested: n,
            capacity: dst_capacity,
        });
    }
    Ok(n)
}

impl DevicePtr {
    pub(crate) fn alloc(
        ctx: Arc<Context>,
        pinned: Arc<PinnedHostRegistry>,
        shape: Shape,
        dtype: DType,
        fill: Option<Fill<'_>>,
        stream: Option<RawStream>,
        policy: MismatchPolicy,
    ) -> Result<Self> {
        let nbytes = shape.numel() * dtype.size_of();
        let addr = ctx.with_current(|| {
            ctx.driver()
                .mem_alloc(ctx.raw(), nbytes)
                .map_err(|source| Error::Allocation { nbytes, source })
        })?;
        debug!(%shape, %dtype, nbytes, "device allocation");
        let mut this = Self {
            ctx,
            pinned,
            addr,
            shape,
            dtype,
            nbytes,
            stream,
            policy,
            released: false,
        };
        // On a fill failure the partially-built handle drops and frees.
        if let Some(fill) = fill {
            this.apply_fill(fill)?;
        }
        Ok(this)
    }

    fn apply_fill(&mut self, fill: Fill<'_>) -> Result<()> {
        match fill {
            Fill::Scalar(v) => {
                let elem = v.encode(self.dtype)?;
                let mut staged = vec![0u8; self.nbytes];
                for chunk in staged.chunks_exact_mut(elem.len()) {
                    chunk.copy_from_slice(&elem);
                }
                let _guard = self.ctx.current()?;
                self.ctx
                    .driver()
                    .memcpy_h2d(self.ctx.raw(), self.addr, &staged)?;
                Ok(())
            }
            Fill::Host(src) => {
                self.check_dtype(src.dtype())?;
                self.check_extent(src.nbytes())?;
                let bytes = src.as_bytes();
                let n = self.nbytes.min(bytes.len());
                let _guard = self.ctx.current()?;
                self.ctx
                    .driver()
                    .memcpy_h2d(self.ctx.raw(), self.addr, &bytes[..n])?;
                Ok(())
            }
            Fill::Ptr(src) => {
                self.check_dtype(src.dtype)?;
                self.check_shape(&src.shape)?;
                let n = src.nbytes.min(self.nbytes);
                let _guard = self.ctx.current()?;
                self.ctx
                    .driver()
                    .memcpy_d2d(self.ctx.raw(), self.addr, src.addr, n)?;
                Ok(())
            }
            Fill::Unified(src) => {
                self.check_dtype(src.dtype())?;
                self.check_shape(src.shape())?;
                let n = src.nbytes().min(self.nbytes);
                let _guard = self.ctx.current()?;
                self.ctx
                    .driver()
                    .memcpy_d2d(self.ctx.raw(), self.addr, src.addr(), n)?;
                Ok(())
            }
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Total element count.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// The opaque device address. Useful for raw `Device` copy helpers and
    /// library calls; the address must not outlive this handle.
    pub fn addr(&self) -> DevAddr {
        self.addr
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn check_dtype(&self, other: DType) -> Result<()> {
        if self.dtype == other {
            return Ok(());
        }
        if self.policy.is_strict() {
            return Err(Error::DtypeMismatch {
                left: self.dtype,
                right: other,
            });
        }
        warn!(left = %self.dtype, right = %other, "dtype mismatch; proceeding over the smaller extent");
        Ok(())
    }

    fn check_shape(&self, other: &Shape) -> Result<()> {
        if self.shape == *other {
            return Ok(());
        }
        if self.policy.is_strict() {
            return Err(Error::ShapeMismatch {
                left: self.shape.clone(),
                right: other.clone(),
            });
        }
        warn!(left = %self.shape, right = %other, "shape mismatch; proceeding over the smaller extent");
        Ok(())
    }

    fn check_extent(&self, src_nbytes: usize) -> Result<()> {
        if src_nbytes == self.nbytes {
            return Ok(());
        }
        if self.policy.is_strict() {
            return Err(Error::ExtentMismatch {
                src: src_nbytes,
                dst: self.nbytes,
            });
        }
        warn!(
            src = src_nbytes,
            dst = self.nbytes,
            "extent mismatch; proceeding over the smaller extent"
        );
        Ok(())
    }

    fn require_pinned(&self, addr: usize, nbytes: usize) -> Result<()> {
        if self.pinned.covers(addr, nbytes) {
            return Ok(());
        }
        if self.policy.is_strict() {
            return Err(Error::UnpinnedHostBuffer { addr });
        }
        warn!(addr, "async copy against an unpinned host buffer");
        Ok(())
    }

    // --- in-place elementwise arithmetic ---

    fn ew(&mut self, op: EwOp, b: &DevicePtr) -> Result<()> {
        self.check_dtype(b.dtype)?;
        self.check_shape(&b.shape)?;
        let len = self.numel().min(b.numel());
        let _guard = self.ctx.current()?;
        self.ctx.driver().ew_vec(
            self.ctx.raw(),
            op,
            self.addr,
            b.addr,
            len,
            self.dtype,
            self.stream,
        )?;
        Ok(())
    }

    fn ew_scalar(&mut self, op: EwOp, v: Scalar) -> Result<()> {
        let value = v.encode(self.dtype)?;
        let _guard = self.ctx.current()?;
        self.ctx.driver().ew_scalar(
            self.ctx.raw(),
            op,
            self.addr,
            &value,
            self.numel(),
            self.dtype,
            self.stream,
        )?;
        Ok(())
    }

    /// In-place `self += b`, enqueued on the affinity stream if one is set.
    pub fn add(&mut self, b: &DevicePtr) -> Result<()> {
        self.ew(EwOp::Add, b)
    }

    /// In-place `self -= b`.
    pub fn sub(&mut self, b: &DevicePtr) -> Result<()> {
        self.ew(EwOp::Sub, b)
    }

    /// In-place `self *= b`, elementwise.
    pub fn mul(&mut self, b: &DevicePtr) -> Result<()> {
        self.ew(EwOp::Mul, b)
    }

    /// In-place `self /= b`, elementwise.
    pub fn div(&mut self, b: &DevicePtr) -> Result<()> {
        self.ew(EwOp::Div, b)
    }

    /// In-place `self += v`, broadcast.
    pub fn add_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Add, v.into())
    }

    /// In-place `self -= v`, broadcast.
    pub fn sub_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Sub, v.into())
    }

    /// In-place `self *= v`, broadcast.
    pub fn mul_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Mul, v.into())
    }

    /// In-place `self /= v`, broadcast.
    pub fn div_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Div, v.into())
    }

    // --- shape-changing operations ---

    /// In-place transpose of a 2-D matrix; the shape tuple reverses.
    /// Fails with [`Error::UnsupportedRank`] on any other rank.
    pub fn transpose(&mut self) -> Result<()> {
        let transposed = self.shape.transposed()?;
        let (rows, cols) = (self.shape.dims()[0], self.shape.dims()[1]);
        let _guard = self.ctx.current()?;
        self.ctx.driver().transpose(
            self.ctx.raw(),
            self.addr,
            rows,
            cols,
            self.dtype,
            self.stream,
        )?;
        self.shape = transposed;
        Ok(())
    }

    /// In-place complex conjugation.
    ///
    /// On real element types this is a hard error under the strict policy;
    /// under the permissive policy it reproduces the legacy behavior of
    /// warning and leaving the memory untouched.
    pub fn conj(&mut self) -> Result<()> {
        if !self.dtype.is_complex() {
            if self.policy.is_strict() {
                return Err(Error::UnsupportedDtype {
                    op: "conjugate",
                    dtype: self.dtype,
                });
            }
            warn!(dtype = %self.dtype, "conjugate on a real dtype is a no-op");
            return Ok(());
        }
        let _guard = self.ctx.current()?;
        self.ctx.driver().conjugate(
            self.ctx.raw(),
            self.addr,
            self.numel(),
            self.dtype,
            self.stream,
        )?;
        Ok(())
    }

    /// The complex conjugate in a new allocation; `self` is unchanged.
    pub fn conjugated(&self) -> Result<DevicePtr> {
        let mut out = DevicePtr::alloc(
            self.ctx.clone(),
            self.pinned.clone(),
            self.shape.clone(),
            self.dtype,
            Some(Fill::Ptr(self)),
            self.stream,
            self.policy,
        )?;
        out.conj()?;
        Ok(out)
    }

    // --- copies ---

    /// Device-to-device copy. `nbytes` defaults to the source size and is
    /// clamped to `min(src.nbytes, nbytes)`; a resolved count larger than
    /// the destination fails with [`Error::DestinationTooSmall`].
    pub fn d2d(src: &DevicePtr, dst: &mut DevicePtr, nbytes: Option<usize>) -> Result<()> {
        let n = resolve_copy_bytes(src.nbytes, nbytes, dst.nbytes)?;
        // Peer copies run under the source context.
        let _guard = src.ctx.current()?;
        src.ctx
            .driver()
            .memcpy_d2d(src.ctx.raw(), dst.addr, src.addr, n)?;
        Ok(())
    }

    /// Asynchronous [`d2d`](DevicePtr::d2d); the stream defaults to the
    /// source's affinity stream.
    pub fn d2d_async(
        src: &DevicePtr,
        dst: &mut DevicePtr,
        stream: Option<&Stream>,
        nbytes: Option<usize>,
    ) -> Result<()> {
        let n = resolve_copy_bytes(src.nbytes, nbytes, dst.nbytes)?;
        let raw = stream.map(Stream::raw).or(src.stream);
        let _guard = src.ctx.current()?;
        src.ctx
            .driver()
            .memcpy_d2d_async(src.ctx.raw(), dst.addr, src.addr, n, raw)?;
        Ok(())
    }

    /// Synchronous device-to-host copy of `min(self.nbytes, arr)` bytes.
    pub fn to_host<T: Element>(&self, arr: &mut [T]) -> Result<()> {
        self.check_dtype(T::DTYPE)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(arr);
        let n = self.nbytes.min(bytes.len());
        let _guard = self.ctx.current()?;
        self.ctx
            .driver()
            .memcpy_d2h(self.ctx.raw(), &mut bytes[..n], self.addr)?;
        Ok(())
    }

    /// The full contents in a freshly allocated host vector.
    pub fn to_host_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::DtypeMismatch {
                left: self.dtype,
                right: T::DTYPE,
            });
        }
        let mut out = vec![T::zeroed(); self.numel()];
        self.to_host(&mut out)?;
        Ok(out)
    }

    /// Synchronous host-to-device copy of `min(self.nbytes, arr)` bytes.
    pub fn to_device<T: Element>(&mut self, arr: &[T]) -> Result<()> {
        self.check_dtype(T::DTYPE)?;
        let bytes: &[u8] = bytemuck::cast_slice(arr);
        let n = self.nbytes.min(bytes.len());
        let _guard = self.ctx.current()?;
        self.ctx
            .driver()
            .memcpy_h2d(self.ctx.raw(), self.addr, &bytes[..n])?;
        Ok(())
    }

    /// Enqueue a device-to-host copy and return without waiting.
    ///
    /// `arr` must be pinned through the device's registry, must stay alive,
    /// and must not be read until the stream is synchronized. An unpinned
    /// buffer is a hard error under the strict policy.
    pub fn to_host_async<T: Element>(&self, arr: &mut [T], stream: Option<&Stream>) -> Result<()> {
        self.check_dtype(T::DTYPE)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(arr);
        let n = self.nbytes.min(bytes.len());
        self.require_pinned(bytes.as_ptr() as usize, n)?;
        let raw = stream.map(Stream::raw).or(self.stream);
        let _guard = self.ctx.current()?;
        // SAFETY: the range was just checked against the pinned registry;
        // the caller upholds the liveness contract until the sync point.
        unsafe {
            self.ctx.driver().memcpy_d2h_async(
                self.ctx.raw(),
                HostPtr(bytes.as_mut_ptr()),
                self.addr,
                n,
                raw,
            )?;
        }
        Ok(())
    }

    /// Enqueue a host-to-device copy and return without waiting.
    ///
    /// Same pinning and liveness contract as
    /// [`to_host_async`](DevicePtr::to_host_async); additionally `arr` must
    /// not be mutated until the stream is synchronized.
    pub fn to_device_async<T: Element>(&mut self, arr: &[T], stream: Option<&Stream>) -> Result<()> {
        self.check_dtype(T::DTYPE)?;
        let bytes: &[u8] = bytemuck::cast_slice(arr);
        let n = self.nbytes.min(bytes.len());
        self.require_pinned(bytes.as_ptr() as usize, n)?;
        let raw = stream.map(Stream::raw).or(self.stream);
        let _guard = self.ctx.current()?;
        // SAFETY: as above; the driver only reads from the host range.
        unsafe {
            self.ctx.driver().memcpy_h2d_async(
                self.ctx.raw(),
                self.addr,
                HostPtr(bytes.as_ptr() as *mut u8),
                n,
                raw,
            )?;
        }
        Ok(())
    }

    /// Set every byte to zero.
    pub fn zero(&mut self) -> Result<()> {
        let _guard = self.ctx.current()?;
        self.ctx
            .driver()
            .memset(self.ctx.raw(), self.addr, 0, self.nbytes)?;
        Ok(())
    }

    /// Enqueue a zeroing memset; the stream defaults to the affinity stream.
    pub fn zero_async(&mut self, stream: Option<&Stream>) -> Result<()> {
        let raw = stream.map(Stream::raw).or(self.stream);
        let _guard = self.ctx.current()?;
        self.ctx
            .driver()
            .memset_async(self.ctx.raw(), self.addr, 0, self.nbytes, raw)?;
        Ok(())
    }

    // --- lifetime ---

    fn free(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let _guard = self.ctx.current()?;
        self.ctx.driver().mem_free(self.ctx.raw(), self.addr)?;
        debug!(nbytes = self.nbytes, "device allocation freed");
        Ok(())
    }

    /// Free the allocation now. Consumes the handle, so a second release or
    /// a use-after-release cannot be expressed.
    pub fn release(mut self) -> Result<()> {
        self.free()
    }
}

impl Drop for DevicePtr {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            error!(%e, "device allocation free failed");
        }
    }
}

impl std::fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePtr")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("nbytes", &self.nbytes)
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_driver::host::HostDriver;
    use cinder_driver::Driver;
    use num_complex::Complex32;

    struct Fixture {
        driver: Arc<HostDriver>,
        ctx: Arc<Context>,
        pinned: Arc<PinnedHostRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = Arc::new(HostDriver::new(1));
            let dyn_driver: Arc<dyn Driver> = driver.clone();
            let ctx = Context::create(dyn_driver.clone(), 0).unwrap();
            let pinned = Arc::new(PinnedHostRegistry::new(dyn_driver));
            Self {
                driver,
                ctx,
                pinned,
            }
        }

        fn alloc(
            &self,
            dims: &[usize],
            dtype: DType,
            fill: Option<Fill<'_>>,
            policy: MismatchPolicy,
        ) -> Result<DevicePtr> {
            DevicePtr::alloc(
                self.ctx.clone(),
                self.pinned.clone(),
                Shape::new(dims).unwrap(),
                dtype,
                fill,
                None,
                policy,
            )
        }
    }

    #[test]
    fn scalar_fill_broadcasts_all_dtypes() {
        let fx = Fixture::new();

        let p = fx
            .alloc(&[3, 4], DType::F32, Some(Fill::scalar(2.5f32)), MismatchPolicy::Strict)
            .unwrap();
        assert!(p.to_host_vec::<f32>().unwrap().iter().all(|&v| v == 2.5));

        let p = fx
            .alloc(&[6], DType::F64, Some(Fill::scalar(-1.0f64)), MismatchPolicy::Strict)
            .unwrap();
        assert!(p.to_host_vec::<f64>().unwrap().iter().all(|&v| v == -1.0));

        let c = Complex32::new(3.0, 5.0);
        let p = fx
            .alloc(&[2, 2], DType::C32, Some(Fill::scalar(c)), MismatchPolicy::Strict)
            .unwrap();
        assert!(p.to_host_vec::<Complex32>().unwrap().iter().all(|&v| v == c));
    }

    #[test]
    fn host_fill_roundtrip() {
        let fx = Fixture::new();
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let p = fx
            .alloc(
                &[2, 3],
                DType::F32,
                Some(Fill::host(&data[..])),
                MismatchPolicy::Strict,
            )
            .unwrap();
        assert_eq!(p.to_host_vec::<f32>().unwrap(), data);
    }

    #[test]
    fn strict_rejects_mismatched_host_fill() {
        let fx = Fixture::new();
        let short = [1.0f32, 2.0];
        let e = fx
            .alloc(
                &[2, 3],
                DType::F32,
                Some(Fill::host(&short[..])),
                MismatchPolicy::Strict,
            )
            .unwrap_err();
        assert!(matches!(e, Error::ExtentMismatch { src: 8, dst: 24 }));

        let wrong_type = [1.0f64, 2.0];
        let e = fx
            .alloc(
                &[2],
                DType::F32,
                Some(Fill::host(&wrong_type[..])),
                MismatchPolicy::Strict,
            )
            .unwrap_err();
        assert!(matches!(e, Error::DtypeMismatch { .. }));
    }

    #[test]
    fn permissive_fill_copies_smaller_extent() {
        let fx = Fixture::new();
        let short = [7.0f32, 8.0];
        let p = fx
            .alloc(
                &[4],
                DType::F32,
                Some(Fill::host(&short[..])),
                MismatchPolicy::Permissive,
            )
            .unwrap();
        assert_eq!(p.to_host_vec::<f32>().unwrap(), [7.0, 8.0, 0.0, 0.0]);
    }

    #[test]
    fn add_then_sub_roundtrips() {
        let fx = Fixture::new();
        let a0 = [1.5f32, -2.0, 3.25, 0.0];
        let mut a = fx
            .alloc(&[4], DType::F32, Some(Fill::host(&a0[..])), MismatchPolicy::Strict)
            .unwrap();
        let b = fx
            .alloc(&[4], DType::F32, Some(Fill::scalar(10.0f32)), MismatchPolicy::Strict)
            .unwrap();
        a.add(&b).unwrap();
        a.sub(&b).unwrap();
        assert_eq!(a.to_host_vec::<f32>().unwrap(), a0);
    }

    #[test]
    fn scalar_arithmetic() {
        let fx = Fixture::new();
        let mut a = fx
            .alloc(&[3], DType::F64, Some(Fill::scalar(6.0f64)), MismatchPolicy::Strict)
            .unwrap();
        a.div_scalar(2.0f64).unwrap();
        a.add_scalar(1.0f64).unwrap();
        assert_eq!(a.to_host_vec::<f64>().unwrap(), [4.0, 4.0, 4.0]);
    }

    #[test]
    fn strict_arithmetic_rejects_shape_mismatch() {
        let fx = Fixture::new();
        let mut a = fx
            .alloc(&[4], DType::F32, None, MismatchPolicy::Strict)
            .unwrap();
        let b = fx
            .alloc(&[2, 2], DType::F32, None, MismatchPolicy::Strict)
            .unwrap();
        assert!(matches!(a.add(&b), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn permissive_arithmetic_clamps_to_smaller_extent() {
        let fx = Fixture::new();
        let mut a = fx
            .alloc(
                &[4],
                DType::F32,
                Some(Fill::scalar(1.0f32)),
                MismatchPolicy::Permissive,
            )
            .unwrap();
        let b = fx
            .alloc(
                &[2],
                DType::F32,
                Some(Fill::scalar(10.0f32)),
                MismatchPolicy::Permissive,
            )
            .unwrap();
        a.add(&b).unwrap();
        assert_eq!(a.to_host_vec::<f32>().unwrap(), [11.0, 11.0, 1.0, 1.0]);
    }

    #[test]
    fn d2d_resolves_and_bounds_byte_count() {
        let fx = Fixture::new();
        let src = fx
            .alloc(&[4], DType::F32, Some(Fill::scalar(9.0f32)), MismatchPolicy::Strict)
            .unwrap();
        let mut dst = fx
            .alloc(&[4], DType::F32, None, MismatchPolicy::Strict)
            .unwrap();
        DevicePtr::d2d(&src, &mut dst, None).unwrap();
        assert_eq!(dst.to_host_vec::<f32>().unwrap(), [9.0; 4]);

        let mut small = fx
            .alloc(&[2], DType::F32, None, MismatchPolicy::Strict)
            .unwrap();
        let e = DevicePtr::d2d(&src, &mut small, None).unwrap_err();
        assert!(matches!(
            e,
            Error::DestinationTooSmall {
                requested: 16,
                capacity: 8
            }
        ));
        // An explicit in-bounds byte count is fine.
        DevicePtr::d2d(&src, &mut small, Some(8)).unwrap();
        assert_eq!(small.to_host_vec::<f32>().unwrap(), [9.0, 9.0]);
    }

    #[test]
    fn transpose_twice_restores_layout() {
        let fx = Fixture::new();
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut p = fx
            .alloc(
                &[2, 3],
                DType::F32,
                Some(Fill::host(&data[..])),
                MismatchPolicy::Strict,
            )
            .unwrap();
        p.transpose().unwrap();
        assert_eq!(p.shape().dims(), &[3, 2]);
        assert_eq!(
            p.to_host_vec::<f32>().unwrap(),
            [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
        p.transpose().unwrap();
        assert_eq!(p.shape().dims(), &[2, 3]);
        assert_eq!(p.to_host_vec::<f32>().unwrap(), data);
    }

    #[test]
    fn transpose_requires_rank_2() {
        let fx = Fixture::new();
        let mut p = fx
            .alloc(&[4], DType::F32, None, MismatchPolicy::Strict)
            .unwrap();
        assert!(matches!(
            p.transpose(),
            Err(Error::UnsupportedRank { ndim: 1 })
        ));
        let mut p = fx
            .alloc(&[2, 2, 2], DType::F32, None, MismatchPolicy::Strict)
            .unwrap();
        assert!(matches!(
            p.transpose(),
            Err(Error::UnsupportedRank { ndim: 3 })
        ));
    }

    #[test]
    fn conj_policy_split_on_real_dtypes() {
        let fx = Fixture::new();
        let mut strict = fx
            .alloc(&[2], DType::F32, Some(Fill::scalar(1.0f32)), MismatchPolicy::Strict)
            .unwrap();
        assert!(matches!(
            strict.conj(),
            Err(Error::UnsupportedDtype {
                op: "conjugate",
                ..
            })
        ));

        let mut permissive = fx
            .alloc(
                &[2],
                DType::F32,
                Some(Fill::scalar(1.0f32)),
                MismatchPolicy::Permissive,
            )
            .unwrap();
        permissive.conj().unwrap();
        assert_eq!(permissive.to_host_vec::<f32>().unwrap(), [1.0, 1.0]);
    }

    #[test]
    fn conjugated_leaves_source_untouched() {
        let fx = Fixture::new();
        let v = Complex32::new(1.0, 2.0);
        let src = fx
            .alloc(&[3], DType::C32, Some(Fill::scalar(v)), MismatchPolicy::Strict)
            .unwrap();
        let out = src.conjugated().unwrap();
        assert!(out
            .to_host_vec::<Complex32>()
            .unwrap()
            .iter()
            .all(|&x| x == v.conj()));
        assert!(src.to_host_vec::<Complex32>().unwrap().iter().all(|&x| x == v));
    }

    #[test]
    fn zero_clears_all_bytes() {
        let fx = Fixture::new();
        let mut p = fx
            .alloc(&[8], DType::F32, Some(Fill::scalar(5.0f32)), MismatchPolicy::Strict)
            .unwrap();
        p.zero().unwrap();
        assert_eq!(p.to_host_vec::<f32>().unwrap(), [0.0; 8]);
    }

    #[test]
    fn release_frees_exactly_once() {
        let fx = Fixture::new();
        let p = fx
            .alloc(&[16], DType::F64, None, MismatchPolicy::Strict)
            .unwrap();
        assert_eq!(fx.driver.allocation_count(), 1);
        p.release().unwrap();
        assert_eq!(fx.driver.allocation_count(), 0);
    }

    #[test]
    fn drop_frees_allocation() {
        let fx = Fixture::new();
        {
            let _p = fx
                .alloc(&[16], DType::F64, None, MismatchPolicy::Strict)
                .unwrap();
            assert_eq!(fx.driver.allocation_count(), 1);
        }
        assert_eq!(fx.driver.allocation_count(), 0);
    }

    #[test]
    fn strict_async_copy_requires_pinned_host_buffer() {
        let fx = Fixture::new();
        let mut p = fx
            .alloc(&[4], DType::F32, None, MismatchPolicy::Strict)
            .unwrap();
        let data = [1.0f32; 4];
        let e = p.to_device_async(&data, None).unwrap_err();
        assert!(matches!(e, Error::UnpinnedHostBuffer { .. }));

        fx.pinned.pin(&data).unwrap();
        p.to_device_async(&data, None).unwrap();
        assert_eq!(p.to_host_vec::<f32>().unwrap(), data);
    }
}
