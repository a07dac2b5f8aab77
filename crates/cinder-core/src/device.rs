//! The device: entry point for contexts, memory, and streams.

use std::sync::Arc;

use cinder_driver::{DevAddr, DeviceProps, Driver};
use tracing::{debug, error};

use crate::context::Context;
use crate::dtype::DType;
use crate::error::{Error, MismatchPolicy, Result};
use crate::fill::Fill;
use crate::libs::{Blas, Fft};
use crate::memory::{DevicePtr, UnifiedPtr};
use crate::pinned::PinnedHostRegistry;
use crate::shape::Shape;
use crate::stream::Stream;

/// Construction parameters for a [`Device`].
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Streams to create eagerly at construction.
    pub n_streams: usize,
    /// Element type used by [`Device::alloc_default`].
    pub default_dtype: DType,
    /// Advisory/hard-failure boundary for mismatched operands. Strict by
    /// default; permissive is the legacy compatibility shim.
    pub policy: MismatchPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            n_streams: 0,
            default_dtype: DType::F32,
            policy: MismatchPolicy::Strict,
        }
    }
}

/// Read-only identity and memory report.
///
/// `free_bytes` reflects system-wide usage, not just this process's
/// allocations; `free < total` with zero live allocations is expected.
#[derive(Debug, Clone)]
pub struct DeviceQuery {
    pub name: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// One GPU: a context, the pinned-host registry, eagerly created streams,
/// and the default queue's compute-library handles.
///
/// All memory handles and streams are created through this type (or through
/// one of its streams). Teardown on drop runs in dependency order:
/// synchronize the device, unpin all registered host buffers, destroy
/// streams (each syncs itself first), destroy the default-queue library
/// handles, then destroy the context once the last handle holding it drops.
pub struct Device {
    streams: Vec<Stream>,
    blas: Blas,
    fft: Fft,
    pinned: Arc<PinnedHostRegistry>,
    props: DeviceProps,
    config: DeviceConfig,
    ctx: Arc<Context>,
}

impl Device {
    /// Open device `device_id` with the default configuration: no explicit
    /// streams, `f32` default dtype, strict mismatch policy.
    pub fn new(driver: Arc<dyn Driver>, device_id: u32) -> Result<Self> {
        Self::with_config(driver, device_id, DeviceConfig::default())
    }

    pub fn with_config(
        driver: Arc<dyn Driver>,
        device_id: u32,
        config: DeviceConfig,
    ) -> Result<Self> {
        let ctx = Context::create(driver.clone(), device_id)?;
        let props = driver
            .device_props(device_id)
            .map_err(|source| Error::DeviceUnavailable { device_id, source })?;
        let pinned = Arc::new(PinnedHostRegistry::new(driver));
        let blas = Blas::create(ctx.clone(), None)?;
        let fft = Fft::create(ctx.clone(), None)?;
        let streams = (0..config.n_streams)
            .map(|i| Stream::create(ctx.clone(), pinned.clone(), config.policy, i))
            .collect::<Result<Vec<_>>>()?;
        debug!(device_id, n_streams = config.n_streams, "device ready");
        Ok(Self {
            streams,
            blas,
            fft,
            pinned,
            props,
            config,
            ctx,
        })
    }

    pub fn id(&self) -> u32 {
        self.ctx.device_id()
    }

    pub fn name(&self) -> &str {
        &self.props.name
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn policy(&self) -> MismatchPolicy {
        self.config.policy
    }

    pub fn default_dtype(&self) -> DType {
        self.config.default_dtype
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn stream(&self, ordinal: usize) -> Option<&Stream> {
        self.streams.get(ordinal)
    }

    /// The default queue's linear-algebra handle.
    pub fn blas(&self) -> &Blas {
        &self.blas
    }

    /// The default queue's transform handle.
    pub fn fft(&self) -> &Fft {
        &self.fft
    }

    pub fn pinned(&self) -> &PinnedHostRegistry {
        &self.pinned
    }

    // --- allocation ---

    /// Allocate a device-exclusive handle. Always synchronous; an optional
    /// affinity stream is attached via [`Stream::alloc`] instead.
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
            None,
            self.config.policy,
        )
    }

    /// [`alloc`](Device::alloc) with the configured default dtype.
    pub fn alloc_default<'a>(
        &self,
        shape: &[usize],
        fill: impl Into<Option<Fill<'a>>>,
    ) -> Result<DevicePtr> {
        self.alloc(shape, self.config.default_dtype, fill)
    }

    /// Allocate a unified (host-visible) handle.
    pub fn alloc_unified<'a>(
        &self,
        shape: &[usize],
        dtype: DType,
        fill: impl Into<Option<Fill<'a>>>,
    ) -> Result<UnifiedPtr> {
        UnifiedPtr::alloc(
            self.ctx.clone(),
            Shape::new(shape)?,
            dtype,
            fill.into(),
            self.config.policy,
        )
    }

    // --- raw-address copy/set helpers ---
    //
    // For callers holding bare device addresses rather than handles. The
    // byte counts are passed straight through to the driver.

    pub fn memcpy_h2d(&self, dst: DevAddr, src: &[u8]) -> Result<()> {
        self.ctx
            .with_current(|| Ok(self.ctx.driver().memcpy_h2d(self.ctx.raw(), dst, src)?))
    }

    pub fn memcpy_d2h(&self, dst: &mut [u8], src: DevAddr) -> Result<()> {
        self.ctx
            .with_current(|| Ok(self.ctx.driver().memcpy_d2h(self.ctx.raw(), dst, src)?))
    }

    pub fn memcpy_d2d(&self, dst: DevAddr, src: DevAddr, nbytes: usize) -> Result<()> {
        self.ctx.with_current(|| {
            Ok(self
                .ctx
                .driver()
                .memcpy_d2d(self.ctx.raw(), dst, src, nbytes)?)
        })
    }

    /// Extent-described copy of a 3-dimensional region.
    pub fn memcpy_3d(
        &self,
        dst: DevAddr,
        src: DevAddr,
        extent: [u32; 3],
        nbytes: usize,
    ) -> Result<()> {
        self.ctx.with_current(|| {
            Ok(self
                .ctx
                .driver()
                .memcpy_3d(self.ctx.raw(), dst, src, extent, nbytes)?)
        })
    }

    pub fn memset(&self, addr: DevAddr, value: u8, nbytes: usize) -> Result<()> {
        self.ctx.with_current(|| {
            Ok(self
                .ctx
                .driver()
                .memset(self.ctx.raw(), addr, value, nbytes)?)
        })
    }

    // --- pinned host memory ---

    /// Page-lock a host buffer for asynchronous transfers.
    pub fn host_pin<T: bytemuck::Pod>(&self, buf: &[T]) -> Result<()> {
        self.pinned.pin(buf)
    }

    /// Release a page-lock. Advisory if the buffer was never registered.
    pub fn host_unpin<T: bytemuck::Pod>(&self, buf: &[T]) {
        self.pinned.unpin(buf)
    }

    /// Make buffers safe for streaming: pin each one. Contiguity, the other
    /// half of the original gate, is structural for slices.
    pub fn require_streamable<T: bytemuck::Pod>(&self, buffers: &[&[T]]) -> Result<()> {
        for buf in buffers {
            self.pinned.pin(buf)?;
        }
        Ok(())
    }

    // --- device-wide operations ---

    /// Identity and memory report.
    pub fn query(&self) -> Result<DeviceQuery> {
        let info = self
            .ctx
            .with_current(|| Ok(self.ctx.driver().mem_info(self.ctx.raw())?))?;
        Ok(DeviceQuery {
            name: self.props.name.clone(),
            total_bytes: info.total,
            free_bytes: info.free,
        })
    }

    /// Block the host thread until the device has completed all tasks, on
    /// every queue.
    pub fn sync(&self) -> Result<()> {
        self.ctx
            .with_current(|| Ok(self.ctx.driver().device_sync(self.ctx.raw())?))
    }

    /// Tear this device down, then reset the device's global state.
    ///
    /// Consuming `self` guarantees none of the resources this device owns
    /// survive the reset. Other `Device` instances opened on the same
    /// device id are the caller's responsibility; none may be alive.
    pub fn reset(self) -> Result<()> {
        let driver = self.ctx.driver().clone();
        let device_id = self.ctx.device_id();
        drop(self);
        driver.device_reset(device_id)?;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Teardown order: sync, unpin all, then the field drops release
        // streams, library handles, and (with the last holder) the context.
        // Each step is best-effort so later steps always run.
        if let Err(e) = self.sync() {
            error!(device_id = self.id(), %e, "device sync failed during teardown");
        }
        self.pinned.unpin_all();
        debug!(device_id = self.id(), "device torn down");
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("name", &self.props.name)
            .field("streams", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_driver::host::HostDriver;

    fn device(n_streams: usize) -> (Arc<HostDriver>, Device) {
        let driver = Arc::new(HostDriver::new(1));
        let d = Device::with_config(
            driver.clone(),
            0,
            DeviceConfig {
                n_streams,
                ..DeviceConfig::default()
            },
        )
        .unwrap();
        (driver, d)
    }

    #[test]
    fn constructs_with_eager_streams() {
        let (_driver, d) = device(3);
        assert_eq!(d.streams().len(), 3);
        assert_eq!(d.stream(2).unwrap().id(), 2);
        assert!(d.stream(3).is_none());
    }

    #[test]
    fn unknown_device_is_unavailable() {
        let driver = Arc::new(HostDriver::new(1));
        let e = Device::new(driver, 4).unwrap_err();
        assert!(matches!(e, Error::DeviceUnavailable { device_id: 4, .. }));
    }

    #[test]
    fn query_reports_headroom() {
        let (_driver, d) = device(0);
        let q = d.query().unwrap();
        assert!(!q.name.is_empty());
        assert!(q.free_bytes < q.total_bytes);
    }

    #[test]
    fn alloc_default_uses_configured_dtype() {
        let driver = Arc::new(HostDriver::new(1));
        let d = Device::with_config(
            driver,
            0,
            DeviceConfig {
                default_dtype: DType::F64,
                ..DeviceConfig::default()
            },
        )
        .unwrap();
        let p = d.alloc_default(&[4], None).unwrap();
        assert_eq!(p.dtype(), DType::F64);
    }

    #[test]
    fn raw_copy_helpers_roundtrip() {
        let (_driver, d) = device(0);
        let p = d.alloc(&[4], DType::F32, None).unwrap();
        d.memcpy_h2d(p.addr(), bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]))
            .unwrap();
        let mut out = [0.0f32; 4];
        d.memcpy_d2h(bytemuck::cast_slice_mut(&mut out), p.addr())
            .unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);

        let q = d.alloc(&[4], DType::F32, None).unwrap();
        d.memcpy_3d(q.addr(), p.addr(), [4, 1, 1], 16).unwrap();
        assert_eq!(q.to_host_vec::<f32>().unwrap(), [1.0, 2.0, 3.0, 4.0]);

        d.memset(q.addr(), 0, 16).unwrap();
        assert_eq!(q.to_host_vec::<f32>().unwrap(), [0.0; 4]);
    }

    #[test]
    fn teardown_unpins_registered_buffers() {
        let driver = Arc::new(HostDriver::new(1));
        let a = [0.0f32; 8];
        let b = [0.0f32; 8];
        {
            let d = Device::new(driver.clone(), 0).unwrap();
            d.require_streamable(&[&a, &b]).unwrap();
            assert_eq!(driver.pinned_count(), 2);
        }
        assert_eq!(driver.pinned_count(), 0);
    }

    #[test]
    fn teardown_releases_streams_and_context() {
        let driver = Arc::new(HostDriver::new(1));
        {
            let d = Device::with_config(
                driver.clone(),
                0,
                DeviceConfig {
                    n_streams: 2,
                    ..DeviceConfig::default()
                },
            )
            .unwrap();
            let _p = d.alloc(&[16], DType::F32, None).unwrap();
        }
        // Handles dropped with the scope; nothing survives.
        assert_eq!(driver.allocation_count(), 0);
    }

    #[test]
    fn reset_consumes_the_device() {
        let (driver, d) = device(1);
        let _p = d.alloc(&[4], DType::F32, None);
        drop(_p);
        d.reset().unwrap();
        assert_eq!(driver.allocation_count(), 0);
    }
}
