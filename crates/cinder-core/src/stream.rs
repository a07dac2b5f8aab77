//! Asynchronous execution streams.

use std::sync::Arc;

use cinder_driver::RawStream;
use tracing::{debug, error};

use crate::context::Context;
use crate::dtype::{DType, Element};
use crate::error::{MismatchPolicy, Result};
use crate::fill::Fill;
use crate::libs::{Blas, Fft};
use crate::memory::DevicePtr;
use crate::pinned::PinnedHostRegistry;
use crate::shape::Shape;

/// Owns the native queue; destroys it after the library handles are gone.
struct QueueGuard {
    ctx: Arc<Context>,
    raw: RawStream,
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        let destroyed = self
            .ctx
            .with_current(|| Ok(self.ctx.driver().stream_destroy(self.ctx.raw(), self.raw)?));
        if let Err(e) = destroyed {
            error!(%e, "stream destroy failed");
        }
    }
}

/// One asynchronous execution queue bound to a device's context, with its
/// own compute-library handles scoped to the queue.
///
/// Operations enqueued here run in submission order relative to each other
/// and in no particular order relative to other streams or the default
/// queue; [`sync`](Stream::sync) is the only call that makes enqueued work
/// observably complete from the host.
///
/// Dropping a stream synchronizes it first, so the queue is never destroyed
/// with work in flight; then the library handles are released, then the
/// queue itself.
pub struct Stream {
    ctx: Arc<Context>,
    pinned: Arc<PinnedHostRegistry>,
    policy: MismatchPolicy,
    id: usize,
    blas: Blas,
    fft: Fft,
    queue: QueueGuard,
}

impl Stream {
    pub(crate) fn create(
        ctx: Arc<Context>,
        pinned: Arc<PinnedHostRegistry>,
        policy: MismatchPolicy,
        id: usize,
    ) -> Result<Self> {
        let raw = ctx.with_current(|| Ok(ctx.driver().stream_create(ctx.raw())?))?;
        // Guard the queue before creating the library handles, so a failed
        // handle creation still destroys it.
        let queue = QueueGuard {
            ctx: ctx.clone(),
            raw,
        };
        let blas = Blas::create(ctx.clone(), Some(raw))?;
        let fft = Fft::create(ctx.clone(), Some(raw))?;
        debug!(id, "stream created");
        Ok(Self {
            ctx,
            pinned,
            policy,
            id,
            blas,
            fft,
            queue,
        })
    }

    /// Ordinal id within the owning device.
    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn raw(&self) -> RawStream {
        self.queue.raw
    }

    /// The linear-algebra handle scoped to this queue.
    pub fn blas(&self) -> &Blas {
        &self.blas
    }

    /// The transform handle scoped to this queue.
    pub fn fft(&self) -> &Fft {
        &self.fft
    }

    /// Allocate through the owning device's allocator, tagged with this
    /// stream's affinity so the handle's default async operations target
    /// this queue.
    ///
    /// Allocation itself is always synchronous; batch allocations outside
    /// async regions rather than interleaving them with enqueued work.
    pub fn alloc<'a>(
        &self,
        shape: &[usize],
        dtype: DType,
        fill: impl Into<Option<Fill<'a>>>,
    ) -> Result<DevicePtr> {
        DevicePtr::alloc(
            self.ctx.clone(),
            self.pinned.clone(),
            Shape::new(shape)?,
            dtype,
            fill.into(),
            Some(self.raw()),
            self.policy,
        )
    }

    /// Block the host thread until everything enqueued on this queue has
    /// completed.
    pub fn sync(&self) -> Result<()> {
        self.ctx
            .with_current(|| Ok(self.ctx.driver().stream_sync(self.ctx.raw(), self.raw())?))
    }

    /// Enqueue a host-to-device copy on this queue.
    pub fn memcpy_h2d_async<T: Element>(&self, dst: &mut DevicePtr, src: &[T]) -> Result<()> {
        dst.to_device_async(src, Some(self))
    }

    /// Enqueue a device-to-host copy on this queue.
    pub fn memcpy_d2h_async<T: Element>(&self, dst: &mut [T], src: &DevicePtr) -> Result<()> {
        src.to_host_async(dst, Some(self))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            error!(id = self.id, %e, "stream sync failed during teardown");
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("raw", &self.queue.raw)
            .finish()
    }
}
