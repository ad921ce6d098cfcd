//! Lazily materialised device lists shared by platforms, contexts and
//! programs.

use once_cell::sync::OnceCell;

use crate::device::Device;
use crate::error::{host_err, Result};

/// Storage half of a device container: filled once, immutable afterwards.
#[derive(Default)]
pub(crate) struct DeviceCell {
    devices: OnceCell<Vec<Device>>,
}

impl DeviceCell {
    pub fn with_devices(devices: Vec<Device>) -> Self {
        DeviceCell { devices: OnceCell::with_value(devices) }
    }

    pub fn get_or_try_init(&self, fetch: impl FnOnce() -> Result<Vec<Device>>) -> Result<&[Device]> {
        self.devices.get_or_try_init(fetch).map(Vec::as_slice)
    }
}

/// Wrappers exposing an ordered device list.
pub trait DeviceContainer {
    /// All devices, fetched from the runtime on first use.
    fn devices(&self) -> Result<&[Device]>;

    fn num_devices(&self) -> Result<usize> {
        Ok(self.devices()?.len())
    }

    fn device(&self, index: usize) -> Result<&Device> {
        let devices = self.devices()?;
        devices.get(index).ok_or_else(|| {
            host_err!(
                InvalidData,
                "device index {} out of range, container has {} devices",
                index,
                devices.len()
            )
        })
    }
}
