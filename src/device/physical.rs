//! Physical device enumeration
//!
//! The list is built once per process. The host CPU is always present;
//! accelerator families only appear when their backend is compiled in.

use crate::backend::cpu::CpuInfo;
use crate::backend::DeviceType;
use crate::error::DenoiseResult;
use crate::invalid_argument;
use once_cell::sync::Lazy;

static PHYSICAL_DEVICES: Lazy<Vec<PhysicalDevice>> = Lazy::new(|| {
    let devices = vec![PhysicalDevice::new(DeviceType::Cpu, CpuInfo::get().device_name())];
    tracing::debug!("found {} physical devices", devices.len());
    devices
});

/// PCI location of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
}

/// One enumerable piece of hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    device_type: DeviceType,
    name: String,
    uuid: Option<[u8; 16]>,
    luid: Option<([u8; 8], u32)>,
    pci: Option<PciAddress>,
}

impl PhysicalDevice {
    /// Device without optional identifiers
    pub fn new(device_type: DeviceType, name: impl Into<String>) -> Self {
        Self {
            device_type,
            name: name.into(),
            uuid: None,
            luid: None,
            pci: None,
        }
    }

    pub fn with_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_luid(mut self, luid: [u8; 8], node_mask: u32) -> Self {
        self.luid = Some((luid, node_mask));
        self
    }

    pub fn with_pci_address(mut self, pci: PciAddress) -> Self {
        self.pci = Some(pci);
        self
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_bool(&self, name: &str) -> DenoiseResult<bool> {
        match name {
            "uuidSupported" => Ok(self.uuid.is_some()),
            "luidSupported" => Ok(self.luid.is_some()),
            "pciAddressSupported" => Ok(self.pci.is_some()),
            _ => Err(invalid_argument!("unknown physical device boolean parameter '{}'", name)),
        }
    }

    pub fn get_int(&self, name: &str) -> DenoiseResult<i32> {
        match name {
            "type" => Ok(self.device_type.as_raw()),
            "uuidSupported" | "luidSupported" | "pciAddressSupported" => {
                self.get_bool(name).map(i32::from)
            }
            "nodeMask" => self
                .luid
                .map(|(_, mask)| mask as i32)
                .ok_or_else(|| invalid_argument!("physical device has no LUID")),
            "pciDomain" | "pciBus" | "pciDevice" | "pciFunction" => {
                let pci = self
                    .pci
                    .ok_or_else(|| invalid_argument!("physical device has no PCI address"))?;
                let value = match name {
                    "pciDomain" => pci.domain,
                    "pciBus" => pci.bus,
                    "pciDevice" => pci.device,
                    _ => pci.function,
                };
                Ok(value as i32)
            }
            _ => Err(invalid_argument!("unknown physical device integer parameter '{}'", name)),
        }
    }

    pub fn get_string(&self, name: &str) -> DenoiseResult<&str> {
        match name {
            "name" => Ok(&self.name),
            _ => Err(invalid_argument!("unknown physical device string parameter '{}'", name)),
        }
    }

    /// Opaque identifiers; gated by the matching `*Supported` flag
    pub fn get_data(&self, name: &str) -> DenoiseResult<&[u8]> {
        match name {
            "uuid" => self
                .uuid
                .as_ref()
                .map(|u| u.as_slice())
                .ok_or_else(|| invalid_argument!("physical device has no UUID")),
            "luid" => self
                .luid
                .as_ref()
                .map(|(l, _)| l.as_slice())
                .ok_or_else(|| invalid_argument!("physical device has no LUID")),
            _ => Err(invalid_argument!("unknown physical device data parameter '{}'", name)),
        }
    }
}

/// All physical devices of this process
pub fn physical_devices() -> &'static [PhysicalDevice] {
    &PHYSICAL_DEVICES
}

pub fn num_physical_devices() -> usize {
    PHYSICAL_DEVICES.len()
}

/// Look up a physical device by index
pub fn physical_device(id: usize) -> DenoiseResult<&'static PhysicalDevice> {
    PHYSICAL_DEVICES
        .get(id)
        .ok_or_else(|| invalid_argument!("invalid physical device ID: {}", id))
}
