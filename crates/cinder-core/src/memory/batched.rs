//! Non-owning batched (double-pointer) view over a device allocation.

use cinder_driver::DevAddr;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::memory::DevicePtr;

/// A device-side pointer table describing `batch` equally-strided sub-arrays
/// of an existing [`DevicePtr`].
///
/// Batched library routines take an array of device addresses rather than
/// one base address. This view owns only that table; the data it points
/// into stays owned by the parent handle, and the borrow makes the aliasing
/// visible: the parent cannot be released or mutably used while a view over
/// it is alive. Dropping the view frees only the table.
pub struct BatchView<'a> {
    parent: &'a DevicePtr,
    table: DevAddr,
    batch: usize,
    stride: usize,
}

impl<'a> BatchView<'a> {
    /// Build a table of `batch` addresses, each `stride` elements apart,
    /// starting at the parent's base address.
    pub fn new(parent: &'a DevicePtr, batch: usize, stride: usize) -> Result<Self> {
        if batch == 0 || stride == 0 {
            return Err(Error::Configuration(
                "batch view requires a positive batch count and stride".into(),
            ));
        }
        if batch * stride > parent.numel() {
            return Err(Error::Configuration(format!(
                "batch view of {batch} x {stride} elements exceeds parent extent of {}",
                parent.numel()
            )));
        }
        let esize = parent.dtype().size_of();
        let base = parent.addr().0;
        let entries: Vec<u64> = (0..batch)
            .map(|i| base + (i * stride * esize) as u64)
            .collect();

        let ctx = parent.context();
        let table = ctx.with_current(|| {
            let nbytes = batch * std::mem::size_of::<u64>();
            let table = ctx
                .driver()
                .mem_alloc(ctx.raw(), nbytes)
                .map_err(|source| Error::Allocation { nbytes, source })?;
            if let Err(e) = ctx
                .driver()
                .memcpy_h2d(ctx.raw(), table, bytemuck::cast_slice(&entries))
            {
                let _ = ctx.driver().mem_free(ctx.raw(), table);
                return Err(e.into());
            }
            Ok(table)
        })?;
        debug!(batch, stride, "batch view table uploaded");
        Ok(Self {
            parent,
            table,
            batch,
            stride,
        })
    }

    /// Number of sub-arrays.
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Elements between consecutive sub-array bases.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Device address of the pointer table itself.
    pub fn table_addr(&self) -> DevAddr {
        self.table
    }

    pub fn parent(&self) -> &DevicePtr {
        self.parent
    }

    /// Read the table back to the host.
    pub fn pointers(&self) -> Result<Vec<DevAddr>> {
        let ctx = self.parent.context();
        let mut raw = vec![0u64; self.batch];
        ctx.with_current(|| {
            ctx.driver()
                .memcpy_d2h(ctx.raw(), bytemuck::cast_slice_mut(&mut raw), self.table)?;
            Ok(())
        })?;
        Ok(raw.into_iter().map(DevAddr).collect())
    }
}

impl Drop for BatchView<'_> {
    fn drop(&mut self) {
        let ctx = self.parent.context();
        let freed = ctx.with_current(|| {
            ctx.driver().mem_free(ctx.raw(), self.table)?;
            Ok(())
        });
        if let Err(e) = freed {
            error!(%e, "batch view table free failed");
        }
    }
}

impl std::fmt::Debug for BatchView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchView")
            .field("batch", &self.batch)
            .field("stride", &self.stride)
            .field("dtype", &self.parent.dtype())
            .finish()
    }
}
