use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use rusb::UsbContext;

use crate::error::{Error, Result};
use crate::util::debug::dump_buffer;

pub const APPLE_VENDOR_ID: u16 = 0x05ac;
const MUX_PRODUCT_MIN: u16 = 0x1290;
const MUX_PRODUCT_MAX: u16 = 0x1293;

const MUX_CONFIGURATION: u8 = 3;
const MUX_INTERFACE: u8 = 1;
const PROBE_TIMEOUT: Duration = Duration::from_millis(800);

/// Blocking send/recv contract the mux core consumes. Methods take `&self`
/// so the dispatcher can read while writers hold their own serialization
/// lock; libusb device handles are safe for that.
pub trait BulkChannel: Send + Sync {
    fn bulk_write(&self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Returns `Ok(0)` when the timeout expires with no data.
    fn bulk_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// A device spotted on the bus, before any interface is claimed.
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub bus: u8,
    pub address: u8,
    /// 40-hex unique identifier, read from the USB serial-number string.
    pub uuid: String,
}

/// Scans all busses for mux-capable devices.
pub fn scan() -> Result<Vec<ScannedDevice>> {
    let ctx = rusb::Context::new()?;
    let mut found = Vec::new();
    for device in ctx.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if desc.vendor_id() != APPLE_VENDOR_ID
            || desc.product_id() < MUX_PRODUCT_MIN
            || desc.product_id() > MUX_PRODUCT_MAX
        {
            continue;
        }
        let uuid = match device.open() {
            Ok(handle) => handle
                .read_serial_number_string_ascii(&desc)
                .unwrap_or_default(),
            Err(e) => {
                log::warn!(
                    "cannot open device at {}:{} to read serial: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        found.push(ScannedDevice {
            bus: device.bus_number(),
            address: device.address(),
            uuid,
        });
    }
    Ok(found)
}

pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    ep_in: u8,
    ep_out: u8,
}

impl UsbTransport {
    /// Opens the device at (bus, address), configures it for mux traffic and
    /// validates the version handshake.
    pub fn open(bus: u8, address: u8) -> Result<Self> {
        let ctx = rusb::Context::new()?;
        let device = ctx
            .devices()?
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or(Error::NoDevice)?;

        let mut handle = device.open()?;
        log::debug!("setting configuration {}...", MUX_CONFIGURATION);
        if let Err(e) = handle.set_active_configuration(MUX_CONFIGURATION) {
            // A kernel driver may hold the device; detach and retry once.
            log::debug!("set_configuration failed ({}), detaching kernel driver", e);
            match handle.detach_kernel_driver(MUX_INTERFACE) {
                Ok(()) => handle.set_active_configuration(MUX_CONFIGURATION)?,
                Err(detach_err) => {
                    log::debug!("detach_kernel_driver failed: {}", detach_err);
                    return Err(e.into());
                }
            }
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            handle.set_auto_detach_kernel_driver(true).ok();
        }
        handle.claim_interface(MUX_INTERFACE)?;

        let (ep_in, ep_out) = find_bulk_endpoints(&device)?;
        let mut transport = UsbTransport { handle, ep_in, ep_out };

        transport.drain();
        transport.version_handshake()?;
        Ok(transport)
    }

    /// Discards any bulk-in data left over from a previous session.
    fn drain(&mut self) {
        let mut buf = [0u8; 512];
        loop {
            match self.handle.read_bulk(self.ep_in, &mut buf, PROBE_TIMEOUT) {
                Ok(n) if n > 0 => {
                    log::debug!("drained {} stale bytes", n);
                    dump_buffer("drain", &buf[..n]);
                }
                _ => break,
            }
        }
    }

    /// Sends the 8-byte version probe (major=1, minor=0, network order) and
    /// checks the device echoes it back.
    fn version_handshake(&mut self) -> Result<()> {
        let mut probe = [0u8; 8];
        BigEndian::write_u32(&mut probe[0..4], 1);
        BigEndian::write_u32(&mut probe[4..8], 0);
        self.send(&probe)?;

        let mut echo = [0u8; 8];
        let n = self.recv(&mut echo, PROBE_TIMEOUT)?;
        if n < echo.len() {
            log::debug!("version reply too short: {} bytes", n);
            return Err(Error::NotEnoughData {
                needed: echo.len(),
                got: n,
            });
        }
        if BigEndian::read_u32(&echo[0..4]) != 1 || BigEndian::read_u32(&echo[4..8]) != 0 {
            dump_buffer("version", &echo);
            return Err(Error::BadHeader("version probe echo mismatch"));
        }
        log::debug!("version handshake ok");
        Ok(())
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let n = self.handle.write_bulk(self.ep_out, data, PROBE_TIMEOUT)?;
        if debug_enabled() {
            log::trace!("usb out: {} bytes", n);
        }
        Ok(n)
    }

    pub fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.handle.read_bulk(self.ep_in, buf, timeout) {
            Ok(n) => {
                if debug_enabled() {
                    log::trace!("usb in: {} bytes", n);
                }
                Ok(n)
            }
            Err(rusb::Error::Timeout) => Ok(0),
            Err(rusb::Error::NoDevice) => Err(Error::NoDevice),
            Err(e) => Err(e.into()),
        }
    }
}

impl BulkChannel for UsbTransport {
    fn bulk_write(&self, data: &[u8], _timeout: Duration) -> Result<usize> {
        self.send(data)
    }

    fn bulk_read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.recv(buf, timeout)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        // Read out final packets so the next open starts clean.
        self.drain();
        let _ = self.handle.release_interface(MUX_INTERFACE);
    }
}

fn debug_enabled() -> bool {
    crate::util::debug::debug_level() >= 1
}

fn find_bulk_endpoints(device: &rusb::Device<rusb::Context>) -> Result<(u8, u8)> {
    let config = device.active_config_descriptor()?;
    for iface in config.interfaces() {
        for setting in iface.descriptors() {
            if setting.interface_number() != MUX_INTERFACE {
                continue;
            }
            let mut ep_in = None;
            let mut ep_out = None;
            for ep in setting.endpoint_descriptors() {
                if ep.transfer_type() != rusb::TransferType::Bulk {
                    continue;
                }
                if ep.address() & 0x80 != 0 {
                    ep_in = Some(ep.address());
                } else {
                    ep_out = Some(ep.address());
                }
            }
            if let (Some(i), Some(o)) = (ep_in, ep_out) {
                return Ok((i, o));
            }
        }
    }
    Err(Error::BadHeader("no bulk endpoints on mux interface"))
}
