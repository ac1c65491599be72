use std::time::Duration;

use crate::error::{Error, Result};

/// Byte-stream contract every service client consumes. Implemented by the
/// mux core's virtual connections; tests substitute in-memory fakes.
pub trait Conn: Send {
    /// Writes the whole buffer, returning the byte count actually queued on
    /// the wire.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Reads up to `buf.len()` bytes. A zero timeout blocks until data or a
    /// terminal connection error arrives; otherwise `Error::Timeout` is
    /// returned once the deadline expires with nothing buffered.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Copies buffered bytes without consuming them. Never blocks.
    fn peek(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.recv_timeout(buf, Duration::ZERO)
    }
}

/// Fills `buf` completely or fails. A timeout before the first byte is
/// `Timeout`; EOF or a timeout mid-buffer is `NotEnoughData`.
pub fn recv_exact<C: Conn + ?Sized>(
    conn: &mut C,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    let mut read = 0;
    while read < buf.len() {
        match conn.recv_timeout(&mut buf[read..], timeout) {
            Ok(0) => {
                return Err(Error::NotEnoughData {
                    needed: buf.len(),
                    got: read,
                })
            }
            Ok(n) => read += n,
            Err(Error::Timeout) if read == 0 => return Err(Error::Timeout),
            Err(Error::Timeout) => {
                return Err(Error::NotEnoughData {
                    needed: buf.len(),
                    got: read,
                })
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn send_all<C: Conn + ?Sized>(conn: &mut C, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = conn.send(&data[written..])?;
        if n == 0 {
            return Err(Error::Mux("send made no progress".into()));
        }
        written += n;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Bidirectional in-memory pipe. `PipeConn` is the client end; the test
    /// drives the peer end directly through `PeerEnd`.
    pub struct PipeConn {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<VecDeque<u8>>>,
    }

    #[derive(Clone)]
    pub struct PeerEnd {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<VecDeque<u8>>>,
    }

    pub fn pipe() -> (PipeConn, PeerEnd) {
        let to_client = Arc::new(Mutex::new(VecDeque::new()));
        let to_peer = Arc::new(Mutex::new(VecDeque::new()));
        (
            PipeConn {
                inbound: to_client.clone(),
                outbound: to_peer.clone(),
            },
            PeerEnd {
                inbound: to_peer,
                outbound: to_client,
            },
        )
    }

    impl PeerEnd {
        pub fn push(&self, data: &[u8]) {
            self.outbound.lock().unwrap().extend(data.iter().copied());
        }

        pub fn take_sent(&self) -> Vec<u8> {
            self.inbound.lock().unwrap().drain(..).collect()
        }
    }

    impl Conn for PipeConn {
        fn send(&mut self, data: &[u8]) -> Result<usize> {
            self.outbound.lock().unwrap().extend(data.iter().copied());
            Ok(data.len())
        }

        fn recv_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut q = self.inbound.lock().unwrap();
            if q.is_empty() {
                // No peer thread in tests; an empty queue is a timeout.
                return Err(Error::Timeout);
            }
            let n = buf.len().min(q.len());
            for b in buf.iter_mut().take(n) {
                *b = q.pop_front().unwrap();
            }
            Ok(n)
        }

        fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
            let q = self.inbound.lock().unwrap();
            let n = buf.len().min(q.len());
            for (i, b) in q.iter().take(n).enumerate() {
                buf[i] = *b;
            }
            Ok(n)
        }
    }
}
