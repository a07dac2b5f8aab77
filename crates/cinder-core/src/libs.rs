//! Per-queue compute-library handles.
//!
//! The dense-linear-algebra and transform libraries are instantiated once
//! per context for the default queue and once per stream for each explicit
//! queue, so enqueued library calls land on the right queue without the
//! caller re-specifying it. Only the lifecycle and the three entry points
//! the linear-algebra library is actually exercised through live here;
//! everything else about the numeric libraries is out of scope.

use std::sync::Arc;

use cinder_driver::{RawBlas, RawFft, RawStream};
use tracing::{debug, error};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::fill::Scalar;
use crate::memory::DevicePtr;

/// Dense-linear-algebra library handle bound to one queue.
pub struct Blas {
    ctx: Arc<Context>,
    raw: RawBlas,
    stream: Option<RawStream>,
}

impl Blas {
    pub(crate) fn create(ctx: Arc<Context>, stream: Option<RawStream>) -> Result<Self> {
        let raw = ctx.with_current(|| Ok(ctx.driver().blas_create(ctx.raw(), stream)?))?;
        debug!(?stream, "blas handle created");
        Ok(Self { ctx, raw, stream })
    }

    /// The queue this handle's calls are enqueued on; `None` is the default
    /// queue.
    pub fn stream(&self) -> Option<RawStream> {
        self.stream
    }

    fn check_args(&self, n: usize, x: &DevicePtr, y: Option<&DevicePtr>) -> Result<()> {
        if let Some(y) = y {
            if x.dtype() != y.dtype() {
                return Err(Error::DtypeMismatch {
                    left: x.dtype(),
                    right: y.dtype(),
                });
            }
        }
        let limit = y.map_or(x.numel(), |y| x.numel().min(y.numel()));
        if n > limit {
            return Err(Error::Configuration(format!(
                "library call over {n} elements exceeds operand extent of {limit}"
            )));
        }
        Ok(())
    }

    /// Enqueue `y += alpha * x` over `n` elements.
    pub fn axpy(
        &self,
        n: usize,
        alpha: impl Into<Scalar>,
        x: &DevicePtr,
        y: &mut DevicePtr,
    ) -> Result<()> {
        self.check_args(n, x, Some(y))?;
        let alpha = alpha.into().encode(x.dtype())?;
        self.ctx.with_current(|| {
            Ok(self.ctx.driver().blas_axpy(
                self.ctx.raw(),
                self.raw,
                n,
                &alpha,
                x.addr(),
                y.addr(),
                x.dtype(),
            )?)
        })
    }

    /// Enqueue `x *= alpha` over `n` elements.
    pub fn scal(&self, n: usize, alpha: impl Into<Scalar>, x: &mut DevicePtr) -> Result<()> {
        self.check_args(n, x, None)?;
        let alpha = alpha.into().encode(x.dtype())?;
        self.ctx.with_current(|| {
            Ok(self.ctx.driver().blas_scal(
                self.ctx.raw(),
                self.raw,
                n,
                &alpha,
                x.addr(),
                x.dtype(),
            )?)
        })
    }

    /// Euclidean norm of the first `n` elements of `x`, returned on the
    /// host. Blocking: the call drains this handle's queue before the
    /// result is computed, matching host-pointer-mode library semantics.
    pub fn nrm2(&self, n: usize, x: &DevicePtr) -> Result<f64> {
        self.check_args(n, x, None)?;
        self.ctx.with_current(|| {
            Ok(self
                .ctx
                .driver()
                .blas_nrm2(self.ctx.raw(), self.raw, n, x.addr(), x.dtype())?)
        })
    }
}

impl Drop for Blas {
    fn drop(&mut self) {
        let destroyed = self
            .ctx
            .with_current(|| Ok(self.ctx.driver().blas_destroy(self.ctx.raw(), self.raw)?));
        if let Err(e) = destroyed {
            error!(%e, "blas handle destroy failed");
        }
    }
}

impl std::fmt::Debug for Blas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blas").field("stream", &self.stream).finish()
    }
}

/// Transform library handle bound to one queue. Lifecycle only; plans and
/// transforms belong to the numeric layer above this crate.
pub struct Fft {
    ctx: Arc<Context>,
    raw: RawFft,
    stream: Option<RawStream>,
}

impl Fft {
    pub(crate) fn create(ctx: Arc<Context>, stream: Option<RawStream>) -> Result<Self> {
        let raw = ctx.with_current(|| Ok(ctx.driver().fft_create(ctx.raw(), stream)?))?;
        debug!(?stream, "fft handle created");
        Ok(Self { ctx, raw, stream })
    }

    pub fn stream(&self) -> Option<RawStream> {
        self.stream
    }
}

impl Drop for Fft {
    fn drop(&mut self) {
        let destroyed = self
            .ctx
            .with_current(|| Ok(self.ctx.driver().fft_destroy(self.ctx.raw(), self.raw)?));
        if let Err(e) = destroyed {
            error!(%e, "fft handle destroy failed");
        }
    }
}

impl std::fmt::Debug for Fft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft").field("stream", &self.stream).finish()
    }
}
