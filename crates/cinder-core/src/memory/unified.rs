//! Owning handle over a unified (host-visible) allocation.

use std::ops::{Add, Div, Mul, Sub};
use std::sync::Arc;

use cinder_driver::{DevAddr, EwOp, HostPtr};
use num_complex::{Complex32, Complex64};
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::dtype::{DType, Element};
use crate::error::{Error, MismatchPolicy, Result};
use crate::fill::{Fill, Scalar};
use crate::memory::device::resolve_copy_bytes;
use crate::shape::Shape;

/// One allocation addressable from both sides: device code sees a device
/// address, host code sees the same bytes as a typed slice.
///
/// There are no explicit host↔device copy calls on this handle; elementwise
/// arithmetic, fills, transpose, and conjugation all run directly on the
/// host view, and the device consumes the same bytes. Copying between two
/// unified handles still goes through the native device copy path, since
/// they are distinct physical backings.
///
/// There is no automatic coherence barrier: if device-side work may be
/// writing this allocation, the caller must synchronize the relevant queue
/// before touching the host view.
pub struct UnifiedPtr {
    ctx: Arc<Context>,
    addr: DevAddr,
    host: HostPtr,
    shape: Shape,
    dtype: DType,
    nbytes: usize,
    policy: MismatchPolicy,
    released: bool,
}

fn ew_typed<T>(op: EwOp, dst: &mut [T], src: &[T])
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T>,
{
    let n = dst.len().min(src.len());
    for i in 0..n {
        dst[i] = match op {
            EwOp::Add => dst[i] + src[i],
            EwOp::Sub => dst[i] - src[i],
            EwOp::Mul => dst[i] * src[i],
            EwOp::Div => dst[i] / src[i],
        };
    }
}

fn ew_scalar_typed<T>(op: EwOp, dst: &mut [T], v: T)
where
    T: Copy + Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T>,
{
    for d in dst.iter_mut() {
        *d = match op {
            EwOp::Add => *d + v,
            EwOp::Sub => *d - v,
            EwOp::Mul => *d * v,
            EwOp::Div => *d / v,
        };
    }
}

fn elems<T: bytemuck::Pod>(bytes: &[u8], len: usize) -> &[T] {
    let n = len.min(bytes.len() / std::mem::size_of::<T>());
    bytemuck::cast_slice(&bytes[..n * std::mem::size_of::<T>()])
}

fn elems_mut<T: bytemuck::Pod>(bytes: &mut [u8], len: usize) -> &mut [T] {
    let n = len.min(bytes.len() / std::mem::size_of::<T>());
    bytemuck::cast_slice_mut(&mut bytes[..n * std::mem::size_of::<T>()])
}

fn ew_bytes(op: EwOp, dst: &mut [u8], src: &[u8], len: usize, dtype: DType) {
    match dtype {
        DType::F32 => ew_typed(op, elems_mut::<f32>(dst, len), elems::<f32>(src, len)),
        DType::F64 => ew_typed(op, elems_mut::<f64>(dst, len), elems::<f64>(src, len)),
        DType::C32 => ew_typed(
            op,
            elems_mut::<Complex32>(dst, len),
            elems::<Complex32>(src, len),
        ),
        DType::C64 => ew_typed(
            op,
            elems_mut::<Complex64>(dst, len),
            elems::<Complex64>(src, len),
        ),
    }
}

fn ew_scalar_bytes(op: EwOp, dst: &mut [u8], value: &[u8], len: usize, dtype: DType) {
    match dtype {
        DType::F32 => ew_scalar_typed(
            op,
            elems_mut::<f32>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
        DType::F64 => ew_scalar_typed(
            op,
            elems_mut::<f64>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
        DType::C32 => ew_scalar_typed(
            op,
            elems_mut::<Complex32>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
        DType::C64 => ew_scalar_typed(
            op,
            elems_mut::<Complex64>(dst, len),
            bytemuck::pod_read_unaligned(value),
        ),
    }
}

impl UnifiedPtr {
    pub(crate) fn alloc(
        ctx: Arc<Context>,
        shape: Shape,
        dtype: DType,
        fill: Option<Fill<'_>>,
        policy: MismatchPolicy,
    ) -> Result<Self> {
        let nbytes = shape.numel() * dtype.size_of();
        let ua = ctx.with_current(|| {
            ctx.driver()
                .mem_alloc_unified(ctx.raw(), nbytes)
                .map_err(|source| Error::Allocation { nbytes, source })
        })?;
        debug!(%shape, %dtype, nbytes, "unified allocation");
        let mut this = Self {
            ctx,
            addr: ua.addr,
            host: ua.host,
            shape,
            dtype,
            nbytes,
            policy,
            released: false,
        };
        if let Some(fill) = fill {
            this.apply_fill(fill)?;
        }
        Ok(this)
    }

    fn apply_fill(&mut self, fill: Fill<'_>) -> Result<()> {
        match fill {
            Fill::Scalar(v) => {
                let elem = v.encode(self.dtype)?;
                for chunk in self.bytes_mut().chunks_exact_mut(elem.len()) {
                    chunk.copy_from_slice(&elem);
                }
                Ok(())
            }
            Fill::Host(src) => {
                self.check_dtype(src.dtype())?;
                self.check_extent(src.nbytes())?;
                let src_bytes = src.as_bytes();
                let n = self.nbytes.min(src_bytes.len());
                self.bytes_mut()[..n].copy_from_slice(&src_bytes[..n]);
                Ok(())
            }
            // Fills from another allocation go through the native copy path.
            Fill::Ptr(src) => {
                self.check_dtype(src.dtype())?;
                self.check_shape(src.shape())?;
                let n = src.nbytes().min(self.nbytes);
                let _guard = self.ctx.current()?;
                self.ctx
                    .driver()
                    .memcpy_d2d(self.ctx.raw(), self.addr, src.addr(), n)?;
                Ok(())
            }
            Fill::Unified(src) => {
                self.check_dtype(src.dtype)?;
                self.check_shape(&src.shape)?;
                let n = src.nbytes.min(self.nbytes);
                let _guard = self.ctx.current()?;
                self.ctx
                    .driver()
                    .memcpy_d2d(self.ctx.raw(), self.addr, src.addr, n)?;
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

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub(crate) fn addr(&self) -> DevAddr {
        self.addr
    }

    // The driver hands back an allocation aligned for any supported element
    // type, so the raw-parts casts below are always in bounds and aligned.

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.host.0 as *const u8, self.nbytes) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.host.0, self.nbytes) }
    }

    /// The host view as a typed slice. The element type must match exactly.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if T::DTYPE != self.dtype {
            return Err(Error::DtypeMismatch {
                left: self.dtype,
                right: T::DTYPE,
            });
        }
        Ok(unsafe { std::slice::from_raw_parts(self.host.0 as *const T, self.numel()) })
    }

    /// The mutable host view as a typed slice.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        if T::DTYPE != self.dtype {
            return Err(Error::DtypeMismatch {
                left: self.dtype,
                right: T::DTYPE,
            });
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.host.0 as *mut T, self.numel()) })
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

    // --- in-place elementwise arithmetic, on the host view ---

    fn ew(&mut self, op: EwOp, b: &UnifiedPtr) -> Result<()> {
        self.check_dtype(b.dtype)?;
        self.check_shape(&b.shape)?;
        let len = self.numel().min(b.numel());
        let dtype = self.dtype;
        // Both views alias process memory; stage the source so a permissive
        // self-overlapping layout cannot tear.
        let src = b.bytes().to_vec();
        ew_bytes(op, self.bytes_mut(), &src, len, dtype);
        Ok(())
    }

    fn ew_scalar(&mut self, op: EwOp, v: Scalar) -> Result<()> {
        let value = v.encode(self.dtype)?;
        let len = self.numel();
        let dtype = self.dtype;
        ew_scalar_bytes(op, self.bytes_mut(), &value, len, dtype);
        Ok(())
    }

    /// In-place `self += b` on the host view.
    pub fn add(&mut self, b: &UnifiedPtr) -> Result<()> {
        self.ew(EwOp::Add, b)
    }

    /// In-place `self -= b`.
    pub fn sub(&mut self, b: &UnifiedPtr) -> Result<()> {
        self.ew(EwOp::Sub, b)
    }

    /// In-place `self *= b`, elementwise.
    pub fn mul(&mut self, b: &UnifiedPtr) -> Result<()> {
        self.ew(EwOp::Mul, b)
    }

    /// In-place `self /= b`, elementwise.
    pub fn div(&mut self, b: &UnifiedPtr) -> Result<()> {
        self.ew(EwOp::Div, b)
    }

    pub fn add_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Add, v.into())
    }

    pub fn sub_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Sub, v.into())
    }

    pub fn mul_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Mul, v.into())
    }

    pub fn div_scalar(&mut self, v: impl Into<Scalar>) -> Result<()> {
        self.ew_scalar(EwOp::Div, v.into())
    }

    /// In-place 2-D transpose on the host view; the shape tuple reverses.
    pub fn transpose(&mut self) -> Result<()> {
        let transposed = self.shape.transposed()?;
        let (rows, cols) = (self.shape.dims()[0], self.shape.dims()[1]);
        let esize = self.dtype.size_of();
        let src = self.bytes().to_vec();
        let dst = self.bytes_mut();
        for r in 0..rows {
            for c in 0..cols {
                let from = (r * cols + c) * esize;
                let to = (c * rows + r) * esize;
                dst[to..to + esize].copy_from_slice(&src[from..from + esize]);
            }
        }
        self.shape = transposed;
        Ok(())
    }

    /// In-place complex conjugation on the host view. Same policy split as
    /// the device handle on real element types.
    pub fn conj(&mut self) -> Result<()> {
        match self.dtype {
            DType::C32 => {
                let len = self.numel();
                for v in elems_mut::<Complex32>(self.bytes_mut(), len) {
                    *v = v.conj();
                }
            }
            DType::C64 => {
                let len = self.numel();
                for v in elems_mut::<Complex64>(self.bytes_mut(), len) {
                    *v = v.conj();
                }
            }
            dtype => {
                if self.policy.is_strict() {
                    return Err(Error::UnsupportedDtype {
                        op: "conjugate",
                        dtype,
                    });
                }
                warn!(%dtype, "conjugate on a real dtype is a no-op");
            }
        }
        Ok(())
    }

    /// Device-to-device copy between two unified handles, through the native
    /// copy path. Same byte-count resolution and containment rule as
    /// [`DevicePtr::d2d`](crate::memory::DevicePtr::d2d).
    pub fn d2d(src: &UnifiedPtr, dst: &mut UnifiedPtr, nbytes: Option<usize>) -> Result<()> {
        let n = resolve_copy_bytes(src.nbytes, nbytes, dst.nbytes)?;
        let _guard = src.ctx.current()?;
        src.ctx
            .driver()
            .memcpy_d2d(src.ctx.raw(), dst.addr, src.addr, n)?;
        Ok(())
    }

    fn free(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let _guard = self.ctx.current()?;
        self.ctx.driver().mem_free(self.ctx.raw(), self.addr)?;
        debug!(nbytes = self.nbytes, "unified allocation freed");
        Ok(())
    }

    /// Free the allocation now; consumes the handle.
    pub fn release(mut self) -> Result<()> {
        self.free()
    }
}

impl Drop for UnifiedPtr {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            error!(%e, "unified allocation free failed");
        }
    }
}

impl std::fmt::Debug for UnifiedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedPtr")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("nbytes", &self.nbytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_driver::host::HostDriver;
    use cinder_driver::Driver;

    fn ctx() -> Arc<Context> {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new(1));
        Context::create(driver, 0).unwrap()
    }

    fn alloc(
        ctx: &Arc<Context>,
        dims: &[usize],
        dtype: DType,
        fill: Option<Fill<'_>>,
    ) -> UnifiedPtr {
        UnifiedPtr::alloc(
            ctx.clone(),
            Shape::new(dims).unwrap(),
            dtype,
            fill,
            MismatchPolicy::Strict,
        )
        .unwrap()
    }

    #[test]
    fn host_view_roundtrip() {
        let c = ctx();
        let mut p = alloc(&c, &[2, 2], DType::F32, None);
        p.as_mut_slice::<f32>()
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(p.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn view_dtype_is_exact() {
        let c = ctx();
        let p = alloc(&c, &[4], DType::F32, None);
        assert!(matches!(
            p.as_slice::<f64>(),
            Err(Error::DtypeMismatch { .. })
        ));
    }

    #[test]
    fn scalar_fill_and_arithmetic_on_host_view() {
        let c = ctx();
        let mut a = alloc(&c, &[6], DType::F64, Some(Fill::scalar(3.0f64)));
        let b = alloc(&c, &[6], DType::F64, Some(Fill::scalar(1.5f64)));
        a.add(&b).unwrap();
        a.mul_scalar(2.0f64).unwrap();
        assert!(a.as_slice::<f64>().unwrap().iter().all(|&v| v == 9.0));
    }

    #[test]
    fn transpose_on_host_view() {
        let c = ctx();
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut p = alloc(&c, &[2, 3], DType::F32, Some(Fill::host(&data[..])));
        p.transpose().unwrap();
        assert_eq!(p.shape().dims(), &[3, 2]);
        assert_eq!(
            p.as_slice::<f32>().unwrap(),
            &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }

    #[test]
    fn conj_on_complex_view() {
        let c = ctx();
        let v = Complex32::new(2.0, -3.0);
        let mut p = alloc(&c, &[3], DType::C32, Some(Fill::scalar(v)));
        p.conj().unwrap();
        assert!(p
            .as_slice::<Complex32>()
            .unwrap()
            .iter()
            .all(|&x| x == v.conj()));
    }

    #[test]
    fn d2d_between_unified_handles() {
        let c = ctx();
        let src = alloc(&c, &[4], DType::F32, Some(Fill::scalar(7.0f32)));
        let mut dst = alloc(&c, &[4], DType::F32, None);
        UnifiedPtr::d2d(&src, &mut dst, None).unwrap();
        assert_eq!(dst.as_slice::<f32>().unwrap(), &[7.0; 4]);

        let mut small = alloc(&c, &[2], DType::F32, None);
        assert!(matches!(
            UnifiedPtr::d2d(&src, &mut small, None),
            Err(Error::DestinationTooSmall { .. })
        ));
    }

    #[test]
    fn unified_fill_from_device_handle() {
        let c = ctx();
        let driver = c.driver().clone();
        let pinned = Arc::new(crate::pinned::PinnedHostRegistry::new(driver));
        let dev = crate::memory::DevicePtr::alloc(
            c.clone(),
            pinned,
            Shape::new(&[4]).unwrap(),
            DType::F32,
            Some(Fill::scalar(5.0f32)),
            None,
            MismatchPolicy::Strict,
        )
        .unwrap();
        let uni = UnifiedPtr::alloc(
            c.clone(),
            Shape::new(&[4]).unwrap(),
            DType::F32,
            Some(Fill::ptr(&dev)),
            MismatchPolicy::Strict,
        )
        .unwrap();
        assert_eq!(uni.as_slice::<f32>().unwrap(), &[5.0; 4]);
    }
}
