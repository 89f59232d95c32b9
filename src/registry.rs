// Device discovery: runs driver enumeration and decodes the fixed-width list.

use serde::Serialize;
use tracing::{info, warn};

use crate::driver::DriverPort;
use crate::errors::DriverError;
use crate::wire::{decode_wide, RawDeviceItem, RawDeviceList, MAX_DEVICES};

/// One attached printer as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub id: String,
    pub dev: String,
    pub description: String,
    pub product_id: i32,
}

impl DeviceDescriptor {
    fn decode(item: &RawDeviceItem) -> Self {
        Self {
            name: decode_wide(&item.name),
            id: decode_wide(&item.id),
            dev: decode_wide(&item.dev),
            description: decode_wide(&item.description),
            product_id: item.product_id,
        }
    }
}

/// Devices in enumeration order. Never longer than `MAX_DEVICES`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DeviceList {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceList {
    /// Decodes only the entries the driver claims to have written, clamped
    /// to the array bound.
    pub fn decode(raw: &RawDeviceList) -> Self {
        if usize::try_from(raw.count).map_or(true, |n| n > MAX_DEVICES) {
            warn!(
                "Driver reported {} devices, clamping to 0..={}",
                raw.count, MAX_DEVICES
            );
        }
        Self {
            devices: raw.valid_items().iter().map(DeviceDescriptor::decode).collect(),
        }
    }

    pub fn first(&self) -> Option<&DeviceDescriptor> {
        self.devices.first()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeviceDescriptor> {
        self.devices.iter()
    }
}

impl IntoIterator for DeviceList {
    type Item = DeviceDescriptor;
    type IntoIter = std::vec::IntoIter<DeviceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    port: DriverPort,
}

impl DeviceRegistry {
    pub fn new(port: DriverPort) -> Self {
        Self { port }
    }

    pub async fn list_devices(&self) -> Result<DeviceList, DriverError> {
        let (status, raw) = self
            .port
            .call("enumerateDevices", |driver| {
                let mut raw = RawDeviceList::boxed();
                let status = driver.enumerate_devices(&mut raw);
                (status, raw)
            })
            .await?;

        if status != 0 {
            warn!("Device enumeration failed with code {}", status);
            return Err(DriverError::EnumerationFailed(status));
        }

        let devices = DeviceList::decode(&raw);
        info!("Enumerated {} printer device(s)", devices.len());
        for device in devices.iter() {
            info!(
                "  - Name: '{}', Id: '{}', Dev: '{}', Description: '{}'",
                device.name, device.id, device.dev, device.description
            );
        }
        Ok(devices)
    }
}
