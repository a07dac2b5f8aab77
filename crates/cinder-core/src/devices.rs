//! Ordered collections of devices for multi-GPU host programs.

use std::ops::Index;
use std::sync::Arc;

use cinder_driver::Driver;

use crate::device::{Device, DeviceConfig};
use crate::error::{Error, Result};

/// An ordered, index-addressable collection of [`Device`]s driven from a
/// single host thread.
///
/// Members tear down in order when the set drops. Cross-device ordering is
/// the caller's to arrange: each member's context is made current around
/// its own operations, so interleaving work across members is safe as long
/// as dependencies are fenced with [`sync_all`](DeviceSet::sync_all) or
/// per-device syncs.
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// Open `ids` in order. `stream_counts` is either a single count
    /// broadcast to every device or a list matched index-for-index; any
    /// other length fails with a configuration error.
    pub fn new(driver: Arc<dyn Driver>, ids: &[u32], stream_counts: &[usize]) -> Result<Self> {
        Self::with_config(driver, ids, stream_counts, DeviceConfig::default())
    }

    /// [`new`](DeviceSet::new) with a shared dtype/policy template;
    /// `template.n_streams` is ignored in favor of `stream_counts`.
    pub fn with_config(
        driver: Arc<dyn Driver>,
        ids: &[u32],
        stream_counts: &[usize],
        template: DeviceConfig,
    ) -> Result<Self> {
        if ids.is_empty() {
            return Err(Error::Configuration("device set needs at least one id".into()));
        }
        let counts: Vec<usize> = match stream_counts.len() {
            1 => vec![stream_counts[0]; ids.len()],
            n if n == ids.len() => stream_counts.to_vec(),
            n => {
                return Err(Error::Configuration(format!(
                    "{n} stream counts for {} device ids",
                    ids.len()
                )));
            }
        };
        let devices = ids
            .iter()
            .zip(counts)
            .map(|(&id, n_streams)| {
                Device::with_config(
                    driver.clone(),
                    id,
                    DeviceConfig {
                        n_streams,
                        ..template
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }

    /// Synchronize every member's queues, in order.
    pub fn sync_all(&self) -> Result<()> {
        for d in &self.devices {
            d.sync()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }
}

impl Index<usize> for DeviceSet {
    type Output = Device;

    fn index(&self, index: usize) -> &Device {
        &self.devices[index]
    }
}

impl<'a> IntoIterator for &'a DeviceSet {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.devices.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_driver::host::HostDriver;

    #[test]
    fn broadcast_stream_count() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new(3));
        let set = DeviceSet::new(driver, &[0, 1, 2], &[2]).unwrap();
        assert_eq!(set.len(), 3);
        for d in &set {
            assert_eq!(d.streams().len(), 2);
        }
    }

    #[test]
    fn per_device_stream_counts() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new(2));
        let set = DeviceSet::new(driver, &[0, 1], &[1, 3]).unwrap();
        assert_eq!(set[0].streams().len(), 1);
        assert_eq!(set[1].streams().len(), 3);
        assert_eq!(set[1].id(), 1);
    }

    #[test]
    fn length_mismatch_is_a_configuration_error() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new(3));
        let e = DeviceSet::new(driver, &[0, 1, 2], &[1, 2]).unwrap_err();
        assert!(matches!(e, Error::Configuration(_)));
    }

    #[test]
    fn empty_id_list_rejected() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new(1));
        assert!(DeviceSet::new(driver, &[], &[0]).is_err());
    }

    #[test]
    fn sync_all_covers_every_member() {
        let driver: Arc<dyn Driver> = Arc::new(HostDriver::new(2));
        let set = DeviceSet::new(driver, &[0, 1], &[1]).unwrap();
        let s0 = set[0].stream(0).unwrap();
        let s1 = set[1].stream(0).unwrap();
        let mut a = s0.alloc(&[4], crate::DType::F32, None).unwrap();
        let mut b = s1.alloc(&[4], crate::DType::F32, None).unwrap();
        a.zero_async(None).unwrap();
        b.zero_async(None).unwrap();
        set.sync_all().unwrap();
        assert_eq!(a.to_host_vec::<f32>().unwrap(), [0.0; 4]);
        assert_eq!(b.to_host_vec::<f32>().unwrap(), [0.0; 4]);
    }
}
