// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use std::time::Duration;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::plist_io::PlistChannel;

pub const SYNC_SERVICE_NAME: &str = "com.apple.mobilesync";

const PROTOCOL_VERSION: (u64, u64) = (100, 100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const GOODBYE: &str = "All done, thanks for the memories";

/// Sync-service client. Construction performs the device-link version
/// exchange; the session then speaks raw plist messages.
pub struct SyncClient<C: Conn> {
    chan: PlistChannel<C>,
}

impl<C: Conn> SyncClient<C> {
    pub fn new(conn: C) -> Result<Self> {
        let mut client = SyncClient {
            chan: PlistChannel::new(conn),
        };
        client.handshake()?;
        Ok(client)
    }

    /// `["DLMessageVersionExchange", major, minor]` arrives first; we accept
    /// exactly (100, 100), answer `DLVersionsOk` and wait for
    /// `["DLMessageDeviceReady"]`.
    fn handshake(&mut self) -> Result<()> {
        let greeting = self.recv_array()?;
        match greeting.first().and_then(|v| v.as_string()) {
            Some("DLMessageVersionExchange") => {}
            other => {
                return Err(Error::Plist(format!(
                    "expected version exchange, got {:?}",
                    other
                )))
            }
        }
        let major = greeting.get(1).and_then(|v| v.as_unsigned_integer());
        let minor = greeting.get(2).and_then(|v| v.as_unsigned_integer());
        if (major, minor) != (Some(PROTOCOL_VERSION.0), Some(PROTOCOL_VERSION.1)) {
            return Err(Error::Plist(format!(
                "unsupported sync protocol version {:?}.{:?}",
                major, minor
            )));
        }

        self.send_array(vec!["DLMessageVersionExchange".into(), "DLVersionsOk".into()])?;

        let ready = self.recv_array()?;
        match ready.first().and_then(|v| v.as_string()) {
            Some("DLMessageDeviceReady") => {
                log::debug!("sync device ready");
                Ok(())
            }
            other => Err(Error::Plist(format!(
                "device not ready after version exchange: {:?}",
                other
            ))),
        }
    }

    pub fn send(&mut self, doc: &plist::Value) -> Result<()> {
        self.chan.send(doc)
    }

    pub fn recv(&mut self) -> Result<plist::Value> {
        self.chan
            .recv_timeout(HANDSHAKE_TIMEOUT, Duration::from_secs(5))
    }

    fn send_array(&mut self, items: Vec<plist::Value>) -> Result<()> {
        self.chan.send(&plist::Value::Array(items))
    }

    fn recv_array(&mut self) -> Result<Vec<plist::Value>> {
        match self.recv()? {
            plist::Value::Array(items) => Ok(items),
            _ => Err(Error::Plist("sync message is not an array".into())),
        }
    }

    /// Says goodbye and hands the connection back for closing.
    pub fn disconnect(mut self) -> Result<C> {
        self.send_array(vec!["DLMessageDisconnect".into(), GOODBYE.into()])?;
        Ok(self.chan.into_inner())
    }
}
