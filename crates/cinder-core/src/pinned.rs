//! Registry of page-locked host buffers.
//!
//! Asynchronous copies DMA against host memory behind the host program's
//! back; the OS must not relocate or swap those pages while a transfer is in
//! flight. The registry tracks which buffers this device has page-locked so
//! unlock is symmetric at teardown and so the async copy paths can refuse
//! (or warn about, under the permissive policy) buffers the driver does not
//! know are locked.
//!
//! Entries are keyed by buffer identity (its address), not value.

use std::sync::Arc;

use cinder_driver::Driver;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

struct PinEntry {
    addr: usize,
    nbytes: usize,
}

pub struct PinnedHostRegistry {
    driver: Arc<dyn Driver>,
    entries: Mutex<Vec<PinEntry>>,
}

impl PinnedHostRegistry {
    pub(crate) fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Page-lock `buf` and record it.
    ///
    /// Pinning a buffer that is already registered is rejected and logged;
    /// the registry is left unchanged and no second driver-level lock is
    /// attempted.
    pub fn pin<T: bytemuck::Pod>(&self, buf: &[T]) -> Result<()> {
        let addr = buf.as_ptr() as usize;
        let nbytes = std::mem::size_of_val(buf);
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.addr == addr) {
            warn!(addr, "host buffer is already pinned; ignoring");
            return Ok(());
        }
        self.driver.mem_pin(addr, nbytes)?;
        entries.push(PinEntry { addr, nbytes });
        debug!(addr, nbytes, "host buffer pinned");
        Ok(())
    }

    /// Remove the page-lock from `buf`.
    ///
    /// An unpin with no matching entry is an advisory condition, not an
    /// error: teardown sequences must stay robust under partial failures.
    pub fn unpin<T: bytemuck::Pod>(&self, buf: &[T]) {
        let addr = buf.as_ptr() as usize;
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.addr == addr) {
            Some(i) => {
                entries.remove(i);
                if let Err(e) = self.driver.mem_unpin(addr) {
                    warn!(addr, %e, "driver unpin failed");
                }
            }
            None => warn!(addr, "buffer not found in pinned registry"),
        }
    }

    /// Drain the registry in registration order. Idempotent on an empty
    /// registry; driver failures are logged and the drain continues.
    pub fn unpin_all(&self) {
        let drained: Vec<PinEntry> = std::mem::take(&mut *self.entries.lock());
        for e in drained {
            if let Err(err) = self.driver.mem_unpin(e.addr) {
                warn!(addr = e.addr, %err, "driver unpin failed during drain");
            }
        }
    }

    /// Whether the byte range `[addr, addr + nbytes)` lies inside a
    /// registered pin. This is the gate every async host copy consults.
    pub(crate) fn covers(&self, addr: usize, nbytes: usize) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| addr >= e.addr && addr + nbytes <= e.addr + e.nbytes)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for PinnedHostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedHostRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
