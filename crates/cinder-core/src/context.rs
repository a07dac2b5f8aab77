//! Device contexts and the current-context guard.
//!
//! The native driver keeps a thread-local "current context" stack, and every
//! memory or stream call implicitly targets whatever is on top. That implicit
//! global is the classic multi-GPU footgun, so the relationship is explicit
//! here: driver-facing calls are methods on context-bound handles, and
//! making a context current yields an RAII [`CurrentGuard`] that restores
//! the previous context on every exit path, panics included.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cinder_driver::{Driver, RawCtx};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// One device's execution context.
///
/// Created by `Device` construction and shared as `Arc<Context>` with every
/// handle that issues driver calls under it. The native context is destroyed
/// when the last holder drops, which structurally orders it after every
/// allocation and stream release.
pub struct Context {
    driver: Arc<dyn Driver>,
    raw: RawCtx,
    device_id: u32,
    push_depth: AtomicUsize,
}

impl Context {
    pub(crate) fn create(driver: Arc<dyn Driver>, device_id: u32) -> Result<Arc<Self>> {
        let raw = driver
            .ctx_create(device_id)
            .map_err(|source| Error::DeviceUnavailable { device_id, source })?;
        debug!(device_id, "context created");
        Ok(Arc::new(Self {
            driver,
            raw,
            device_id,
            push_depth: AtomicUsize::new(0),
        }))
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub(crate) fn raw(&self) -> RawCtx {
        self.raw
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Whether this context is current on some thread right now.
    pub fn is_pushed(&self) -> bool {
        self.push_depth.load(Ordering::Relaxed) > 0
    }

    /// Make this context current until the returned guard drops.
    pub fn current(&self) -> Result<CurrentGuard<'_>> {
        self.driver.ctx_push(self.raw)?;
        self.push_depth.fetch_add(1, Ordering::Relaxed);
        Ok(CurrentGuard { ctx: self })
    }

    /// Run `f` with this context current, popping afterwards whether `f`
    /// succeeds, fails, or unwinds.
    pub fn with_current<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _guard = self.current()?;
        f()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // A live guard would keep the Arc alive through its borrow, so a
        // nonzero depth here means a guard was leaked. Rebalance the driver
        // stack before destroying; teardown is best-effort.
        let depth = self.push_depth.load(Ordering::Relaxed);
        if depth > 0 {
            error!(
                device_id = self.device_id,
                depth, "context dropped while pushed; rebalancing stack"
            );
            for _ in 0..depth {
                if let Err(e) = self.driver.ctx_pop(self.raw) {
                    error!(device_id = self.device_id, %e, "context pop failed");
                    break;
                }
            }
        }
        if let Err(e) = self.driver.ctx_destroy(self.raw) {
            error!(device_id = self.device_id, %e, "context destroy failed");
        } else {
            debug!(device_id = self.device_id, "context destroyed");
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("device_id", &self.device_id)
            .field("raw", &self.raw)
            .finish()
    }
}

/// RAII witness that a context is current on this thread.
///
/// Popping in `Drop` is what keeps the push/pop pairing balanced across
/// early returns and unwinds.
pub struct CurrentGuard<'a> {
    ctx: &'a Context,
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        self.ctx.push_depth.fetch_sub(1, Ordering::Relaxed);
        if let Err(e) = self.ctx.driver.ctx_pop(self.ctx.raw) {
            // Pop failures are teardown-path anomalies; later teardown steps
            // must still run.
            error!(device_id = self.ctx.device_id, %e, "context pop failed");
        }
    }
}
