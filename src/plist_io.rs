//! Length-prefixed property-list envelope shared by the control, sync and
//! notification services: `length:u32_be || binary plist bytes`.

use std::io::Cursor;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::conn::{recv_exact, send_all, Conn};
use crate::error::{Error, Result};
use crate::util::debug::dump_buffer;

// Cap for a single envelope; service dialogs are tiny, anything huge means
// the stream is desynced.
const MAX_ENVELOPE: u32 = 8 * 1024 * 1024;

pub struct PlistChannel<C: Conn> {
    conn: C,
}

impl<C: Conn> PlistChannel<C> {
    pub fn new(conn: C) -> Self {
        PlistChannel { conn }
    }

    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    /// Encodes the document as a binary plist and writes the envelope in one
    /// send.
    pub fn send(&mut self, doc: &plist::Value) -> Result<()> {
        let mut payload = Vec::new();
        doc.to_writer_binary(&mut payload)?;
        let mut envelope = Vec::with_capacity(4 + payload.len());
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, payload.len() as u32);
        envelope.extend_from_slice(&len);
        envelope.extend_from_slice(&payload);
        dump_buffer("plist out", &envelope);
        send_all(&mut self.conn, &envelope)
    }

    /// Reads one envelope. `first_timeout` bounds the wait for the length
    /// word; `body_timeout` bounds each read of the payload. A short read
    /// mid-envelope aborts with a mux error, it is never retried.
    pub fn recv_timeout(
        &mut self,
        first_timeout: Duration,
        body_timeout: Duration,
    ) -> Result<plist::Value> {
        let mut len_buf = [0u8; 4];
        recv_exact(&mut self.conn, &mut len_buf, first_timeout).map_err(short_read_is_fatal)?;
        let len = BigEndian::read_u32(&len_buf);
        if len == 0 || len > MAX_ENVELOPE {
            return Err(Error::Plist(format!("envelope length {} out of range", len)));
        }

        let mut payload = vec![0u8; len as usize];
        match recv_exact(&mut self.conn, &mut payload, body_timeout) {
            Ok(()) => {}
            Err(Error::Timeout) | Err(Error::NotEnoughData { .. }) => {
                return Err(Error::Mux("short read inside plist envelope".into()));
            }
            Err(e) => return Err(e),
        }
        dump_buffer("plist in", &payload);
        plist::Value::from_reader(Cursor::new(payload))
            .map_err(|e| Error::Plist(format!("undecodable envelope payload: {}", e)))
    }

    pub fn recv(&mut self) -> Result<plist::Value> {
        self.recv_timeout(Duration::ZERO, Duration::from_secs(5))
    }
}

/// A partial length word means the stream died mid-envelope; a clean timeout
/// before any byte stays a timeout so pollers can keep polling.
fn short_read_is_fatal(e: Error) -> Error {
    match e {
        Error::NotEnoughData { .. } => Error::Mux("short read inside plist envelope".into()),
        other => other,
    }
}
