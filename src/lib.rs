//! Host-side client for the usbmux protocol spoken by Apple mobile devices
//! over USB: one bulk endpoint carries many TCP-like virtual connections, and
//! the control, file-access, sync and notification services ride on top.

pub mod afc;
pub mod conn;
pub mod device;
pub mod error;
pub mod lockdown;
pub mod mux;
pub mod notification;
pub mod pairing;
pub mod plist_io;
pub mod sync;
pub mod usb;
pub mod util;

pub use afc::{AfcClient, FileMode, LinkType, LockOp};
pub use conn::Conn;
pub use device::{Device, DeviceDesc};
pub use error::{AfcError, AfcResult, Error, Result};
pub use lockdown::{ensure_paired, LockdownClient, LOCKDOWN_PORT};
pub use mux::VConn;
pub use notification::{NotificationClient, NotificationListener};
pub use pairing::{PairingRecord, RecordStore};
pub use plist_io::PlistChannel;
pub use sync::SyncClient;
pub use util::debug::{debug_level, set_debug_level};
