//! Memory handles: owning device and unified allocations, and the
//! non-owning batched view.

mod batched;
mod device;
mod unified;

pub use batched::BatchView;
pub use device::DevicePtr;
pub use unified::UnifiedPtr;
