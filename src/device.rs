use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mux::{Mux, VConn};
use crate::usb::{self, UsbTransport};

/// A mux-capable device found on the bus. Returned by [`Device::enumerate`];
/// pass it to [`Device::open`] to start talking.
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub bus: u8,
    pub address: u8,
    /// 40-hex unique device identifier.
    pub uuid: String,
}

/// An opened device. Owns the mux core; dropping the handle shuts the mux
/// down and invalidates every virtual connection on it.
pub struct Device {
    desc: DeviceDesc,
    mux: Arc<Mux>,
}

impl Device {
    pub fn enumerate() -> Result<Vec<DeviceDesc>> {
        Ok(usb::scan()?
            .into_iter()
            .map(|d| DeviceDesc {
                bus: d.bus,
                address: d.address,
                uuid: d.uuid,
            })
            .collect())
    }

    pub fn open(desc: &DeviceDesc) -> Result<Device> {
        let transport = UsbTransport::open(desc.bus, desc.address)?;
        log::info!(
            "opened device {} at {}:{}",
            desc.uuid,
            desc.bus,
            desc.address
        );
        Ok(Device {
            desc: desc.clone(),
            mux: Mux::start(Box::new(transport)),
        })
    }

    pub fn open_first() -> Result<Device> {
        let descs = Device::enumerate()?;
        let first = descs.first().ok_or(Error::NoDevice)?;
        Device::open(first)
    }

    pub fn open_by_uuid(uuid: &str) -> Result<Device> {
        if uuid.len() != 40 {
            return Err(Error::InvalidArg);
        }
        let descs = Device::enumerate()?;
        let desc = descs
            .iter()
            .find(|d| d.uuid.eq_ignore_ascii_case(uuid))
            .ok_or(Error::NoDevice)?;
        Device::open(desc)
    }

    pub fn uuid(&self) -> &str {
        &self.desc.uuid
    }

    pub fn bus(&self) -> u8 {
        self.desc.bus
    }

    pub fn address(&self) -> u8 {
        self.desc.address
    }

    /// Opens a virtual connection to a service port on this device.
    pub fn connect(&self, dst_port: u16) -> Result<VConn> {
        self.mux.connect(dst_port)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.mux.shutdown();
    }
}
