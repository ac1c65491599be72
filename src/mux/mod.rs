//! Virtual-connection multiplexer: turns one bulk USB byte stream into many
//! TCP-like streams, each identified by a (source port, destination port)
//! pair. A dispatcher thread owns the bulk-in side; writers serialize on a
//! single mutex so frames never interleave on the wire.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::usb::BulkChannel;
use crate::util::debug::dump_buffer;

pub mod frame;

use frame::{
    control_body, encode_frame, parse_control_body, ControlOp, FrameHeader, FrameKind,
    HEADER_LEN, MAX_PAYLOAD,
};

/// Bytes we are willing to buffer per connection before the device must wait
/// for an ACK.
const LOCAL_WINDOW: u32 = 0x20000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on waiting for the peer to reopen its receive window.
const WINDOW_TIMEOUT: Duration = Duration::from_secs(10);
const DISPATCH_POLL: Duration = Duration::from_millis(250);
/// Once part of a frame arrived, the rest must follow within this window.
const FRAME_REST_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const FIRST_SRC_PORT: u16 = 0x0400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
    HalfClosed,
    Closed,
}

#[derive(Debug, Clone)]
enum Dead {
    Device,
    Protocol(String),
}

impl Dead {
    fn to_error(&self) -> Error {
        match self {
            Dead::Device => Error::NoDevice,
            Dead::Protocol(s) => Error::Mux(s.clone()),
        }
    }
}

struct ConnState {
    phase: Phase,
    /// Next send sequence; strictly monotonic, one per DATA frame.
    tx_seq: u32,
    /// Highest send sequence the peer has acknowledged.
    tx_acked: u32,
    /// Bytes we may still push before the peer must ACK.
    peer_window_remaining: u32,
    /// Highest in-order receive sequence seen.
    rx_seq: u32,
    buf: VecDeque<u8>,
    /// Peer sent an orderly CLOSE; drained reads return 0.
    eof: bool,
    dead: Option<Dead>,
}

struct ConnEntry {
    state: Mutex<ConnState>,
    cv: Condvar,
}

impl ConnEntry {
    fn new() -> Self {
        ConnEntry {
            state: Mutex::new(ConnState {
                phase: Phase::Connecting,
                tx_seq: 1,
                tx_acked: 0,
                peer_window_remaining: 0,
                rx_seq: 0,
                buf: VecDeque::new(),
                eof: false,
                dead: None,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Per-device mux state. Owned behind an `Arc` shared by the device handle,
/// every virtual connection, and the dispatcher thread.
pub struct Mux {
    chan: Box<dyn BulkChannel>,
    write_lock: Mutex<()>,
    table: Mutex<HashMap<(u16, u16), Arc<ConnEntry>>>,
    next_port: Mutex<u16>,
    alive: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Mux {
    pub fn start(chan: Box<dyn BulkChannel>) -> Arc<Mux> {
        let mux = Arc::new(Mux {
            chan,
            write_lock: Mutex::new(()),
            table: Mutex::new(HashMap::new()),
            next_port: Mutex::new(FIRST_SRC_PORT),
            alive: AtomicBool::new(true),
            dispatcher: Mutex::new(None),
        });
        let worker = Arc::clone(&mux);
        let handle = std::thread::Builder::new()
            .name("mux-dispatcher".into())
            .spawn(move || dispatch_loop(worker))
            .expect("spawning mux dispatcher");
        *mux.dispatcher.lock().unwrap() = Some(handle);
        mux
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stops the dispatcher and fails every open connection with `NoDevice`.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.kill_all();
    }

    /// Opens a virtual connection to `dst_port` on the device.
    pub fn connect(self: &Arc<Self>, dst_port: u16) -> Result<VConn> {
        if !self.is_alive() {
            return Err(Error::NoDevice);
        }
        let entry = Arc::new(ConnEntry::new());
        let src_port = {
            let mut table = self.table.lock().unwrap();
            let mut next = self.next_port.lock().unwrap();
            let src = loop {
                let candidate = *next;
                *next = if *next == u16::MAX { FIRST_SRC_PORT } else { *next + 1 };
                if !table.keys().any(|(s, _)| *s == candidate) {
                    break candidate;
                }
            };
            table.insert((src, dst_port), Arc::clone(&entry));
            src
        };

        log::debug!("mux connect {} -> {}", src_port, dst_port);
        if let Err(e) = self.write_control(src_port, dst_port, ControlOp::Connect, 0, 0, LOCAL_WINDOW)
        {
            self.remove((src_port, dst_port));
            return Err(e);
        }

        // The entry flips to OPEN on the first DATA or ACK naming our ports.
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let mut st = entry.state.lock().unwrap();
        loop {
            if let Some(dead) = &st.dead {
                let err = dead.to_error();
                drop(st);
                self.remove((src_port, dst_port));
                return Err(err);
            }
            if st.phase != Phase::Connecting {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                drop(st);
                self.remove((src_port, dst_port));
                return Err(Error::Timeout);
            }
            let (guard, _) = entry.cv.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
        drop(st);

        Ok(VConn {
            mux: Arc::clone(self),
            entry,
            src_port,
            dst_port,
            closed: false,
        })
    }

    fn remove(&self, key: (u16, u16)) {
        self.table.lock().unwrap().remove(&key);
    }

    fn lookup(&self, key: (u16, u16)) -> Option<Arc<ConnEntry>> {
        self.table.lock().unwrap().get(&key).cloned()
    }

    fn kill_all(&self) {
        let entries: Vec<Arc<ConnEntry>> = self.table.lock().unwrap().drain().map(|(_, e)| e).collect();
        for entry in entries {
            let mut st = entry.state.lock().unwrap();
            if st.dead.is_none() {
                st.dead = Some(Dead::Device);
            }
            st.phase = Phase::Closed;
            entry.cv.notify_all();
        }
    }

    fn poison(&self, key: (u16, u16), entry: &ConnEntry, reason: &str) {
        {
            let mut st = entry.state.lock().unwrap();
            st.dead = Some(Dead::Protocol(reason.into()));
            st.phase = Phase::Closed;
            entry.cv.notify_all();
        }
        self.remove(key);
    }

    fn write_frame(&self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let buf = encode_frame(header, payload);
        let _guard = self.write_lock.lock().unwrap();
        if !self.is_alive() {
            return Err(Error::NoDevice);
        }
        dump_buffer("mux out", &buf);
        let mut written = 0;
        while written < buf.len() {
            let n = self.chan.bulk_write(&buf[written..], WRITE_TIMEOUT)?;
            if n == 0 {
                return Err(Error::NoDevice);
            }
            written += n;
        }
        Ok(())
    }

    fn write_control(
        &self,
        src_port: u16,
        dst_port: u16,
        op: ControlOp,
        seq: u32,
        ack: u32,
        window: u32,
    ) -> Result<()> {
        let body = control_body(op);
        let header = FrameHeader {
            kind: FrameKind::Control,
            length: (HEADER_LEN + body.len()) as u32,
            src_port,
            dst_port,
            seq,
            ack,
            window,
            flags: 0,
        };
        self.write_frame(&header, &body)
    }

    fn handle_frame(&self, header: FrameHeader, payload: Vec<u8>) {
        // The frame names ports from the device's perspective.
        let key = (header.dst_port, header.src_port);
        let entry = self.lookup(key);
        match header.kind {
            FrameKind::Data => match entry {
                Some(entry) => self.handle_data(key, &entry, &header, payload),
                None => {
                    log::warn!("DATA frame for unknown connection {:?}", key);
                    let _ = self.write_control(key.0, key.1, ControlOp::Reset, 0, 0, 0);
                }
            },
            FrameKind::Control => {
                let op = match parse_control_body(&payload) {
                    Ok(op) => op,
                    Err(e) => {
                        log::warn!("undecodable control frame for {:?}: {}", key, e);
                        if let Some(entry) = entry {
                            self.poison(key, &entry, "bad control frame");
                        }
                        return;
                    }
                };
                match (op, entry) {
                    (ControlOp::Ack, Some(entry)) => self.handle_ack(key, &entry, &header),
                    (ControlOp::Close, Some(entry)) => self.handle_close(key, &entry),
                    (ControlOp::Reset, Some(entry)) => {
                        self.poison(key, &entry, "connection reset by device")
                    }
                    (ControlOp::Connect, _) => {
                        // Device-initiated connections are not part of this
                        // protocol role.
                        let _ = self.write_control(key.0, key.1, ControlOp::Reset, 0, 0, 0);
                    }
                    (_, None) => log::debug!("control {:?} for unknown connection {:?}", op, key),
                }
            }
        }
    }

    fn handle_data(
        &self,
        key: (u16, u16),
        entry: &Arc<ConnEntry>,
        header: &FrameHeader,
        payload: Vec<u8>,
    ) {
        let (ack, window, tx_seq) = {
            let mut st = entry.state.lock().unwrap();
            if st.phase == Phase::Connecting {
                st.phase = Phase::Open;
                st.peer_window_remaining = header.window;
            }
            let expected = st.rx_seq.wrapping_add(1);
            if header.seq != expected {
                // The device does not retransmit; a gap is unrecoverable.
                drop(st);
                log::warn!(
                    "out-of-order DATA on {:?}: got seq {}, expected {}",
                    key,
                    header.seq,
                    expected
                );
                self.poison(key, entry, "out-of-order data frame");
                let _ = self.write_control(key.0, key.1, ControlOp::Reset, 0, 0, 0);
                return;
            }
            st.rx_seq = header.seq;
            st.buf.extend(payload.iter().copied());
            apply_ack(&mut st, header);
            entry.cv.notify_all();
            let window = LOCAL_WINDOW.saturating_sub(st.buf.len() as u32);
            (st.rx_seq, window, st.tx_seq)
        };
        let _ = self.write_control(key.0, key.1, ControlOp::Ack, tx_seq, ack, window);
    }

    fn handle_ack(&self, key: (u16, u16), entry: &Arc<ConnEntry>, header: &FrameHeader) {
        let mut st = entry.state.lock().unwrap();
        if st.phase == Phase::Connecting {
            st.phase = Phase::Open;
            st.peer_window_remaining = header.window;
            entry.cv.notify_all();
            return;
        }
        let highest_sent = st.tx_seq.wrapping_sub(1);
        if header.ack > highest_sent {
            drop(st);
            self.poison(key, entry, "ack beyond send sequence");
            let _ = self.write_control(key.0, key.1, ControlOp::Reset, 0, 0, 0);
            return;
        }
        apply_ack(&mut st, header);
        entry.cv.notify_all();
    }

    fn handle_close(&self, key: (u16, u16), entry: &Arc<ConnEntry>) {
        let initiated_by_us = {
            let mut st = entry.state.lock().unwrap();
            let half_closed = st.phase == Phase::HalfClosed;
            st.phase = Phase::Closed;
            if !half_closed {
                st.eof = true;
            }
            entry.cv.notify_all();
            half_closed
        };
        self.remove(key);
        if !initiated_by_us {
            let _ = self.write_control(key.0, key.1, ControlOp::Close, 0, 0, 0);
        }
    }
}

/// Duplicate and out-of-order acknowledgements are ignored.
fn apply_ack(st: &mut ConnState, header: &FrameHeader) {
    if header.ack <= st.tx_acked {
        return;
    }
    st.tx_acked = header.ack;
    st.peer_window_remaining = header.window;
}

fn dispatch_loop(mux: Arc<Mux>) {
    let mut header_buf = [0u8; HEADER_LEN];
    'outer: while mux.is_alive() {
        let first = match mux.chan.bulk_read(&mut header_buf, DISPATCH_POLL) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                log::debug!("dispatcher read failed: {}", e);
                break;
            }
        };
        let mut have = first;
        while have < HEADER_LEN {
            match mux.chan.bulk_read(&mut header_buf[have..], FRAME_REST_TIMEOUT) {
                Ok(0) => {
                    log::warn!("partial mux header ({} of {} bytes), stream desynced", have, HEADER_LEN);
                    break 'outer;
                }
                Ok(n) => have += n,
                Err(_) => break 'outer,
            }
        }
        let header = match FrameHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("undecodable mux header: {}", e);
                dump_buffer("mux in", &header_buf);
                break;
            }
        };
        let mut payload = vec![0u8; header.payload_len()];
        let mut got = 0;
        while got < payload.len() {
            match mux.chan.bulk_read(&mut payload[got..], FRAME_REST_TIMEOUT) {
                Ok(0) => {
                    log::warn!("truncated mux frame ({} of {} payload bytes)", got, payload.len());
                    break 'outer;
                }
                Ok(n) => got += n,
                Err(_) => break 'outer,
            }
        }
        dump_buffer("mux in", &payload);
        mux.handle_frame(header, payload);
    }
    mux.alive.store(false, Ordering::Release);
    mux.kill_all();
    log::debug!("mux dispatcher exited");
}

/// A virtual connection. Operations require `&mut self`; closing consumes
/// the handle, so use-after-close is a compile-time error.
pub struct VConn {
    mux: Arc<Mux>,
    entry: Arc<ConnEntry>,
    src_port: u16,
    dst_port: u16,
    closed: bool,
}

impl VConn {
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Sends the whole buffer, splitting it into window- and frame-sized
    /// chunks. Blocks while the peer window is exhausted.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut sent = 0;
        while sent < data.len() {
            let (header, chunk_len) = self.reserve_chunk(data.len() - sent)?;
            self.mux
                .write_frame(&header, &data[sent..sent + chunk_len])?;
            sent += chunk_len;
        }
        Ok(sent)
    }

    /// Claims window space and a sequence number for the next chunk.
    fn reserve_chunk(&mut self, remaining: usize) -> Result<(FrameHeader, usize)> {
        let entry = Arc::clone(&self.entry);
        let mut st = entry.state.lock().unwrap();
        loop {
            if let Some(dead) = &st.dead {
                return Err(dead.to_error());
            }
            match st.phase {
                Phase::Connecting | Phase::Open => {}
                Phase::HalfClosed | Phase::Closed => return Err(Error::NoDevice),
            }
            if st.phase == Phase::Open && st.peer_window_remaining > 0 {
                break;
            }
            let (guard, wait) = entry.cv.wait_timeout(st, WINDOW_TIMEOUT).unwrap();
            st = guard;
            if wait.timed_out()
                && st.dead.is_none()
                && !(st.phase == Phase::Open && st.peer_window_remaining > 0)
            {
                return Err(Error::Timeout);
            }
        }
        let chunk = remaining
            .min(st.peer_window_remaining as usize)
            .min(MAX_PAYLOAD);
        let seq = st.tx_seq;
        st.tx_seq = st.tx_seq.wrapping_add(1);
        st.peer_window_remaining -= chunk as u32;
        let header = FrameHeader {
            kind: FrameKind::Data,
            length: (HEADER_LEN + chunk) as u32,
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq,
            ack: st.rx_seq,
            window: LOCAL_WINDOW.saturating_sub(st.buf.len() as u32),
            flags: 0,
        };
        Ok((header, chunk))
    }

    /// Reads buffered bytes. Zero timeout blocks until data, EOF or a
    /// connection failure; otherwise `Timeout` after the deadline. An
    /// orderly peer close drains the buffer and then returns 0.
    pub fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = if timeout == Duration::ZERO {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        let entry = Arc::clone(&self.entry);
        let mut st = entry.state.lock().unwrap();
        loop {
            if let Some(dead) = &st.dead {
                return Err(dead.to_error());
            }
            if !st.buf.is_empty() {
                break;
            }
            if st.eof || st.phase == Phase::Closed {
                return Ok(0);
            }
            match deadline {
                None => st = entry.cv.wait(st).unwrap(),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout);
                    }
                    let (guard, _) = entry.cv.wait_timeout(st, d - now).unwrap();
                    st = guard;
                }
            }
        }
        let n = buf.len().min(st.buf.len());
        for b in buf.iter_mut().take(n) {
            *b = st.buf.pop_front().unwrap();
        }
        Ok(n)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.recv_timeout(buf, Duration::ZERO)
    }

    /// Copies buffered bytes without consuming them; never blocks.
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        let st = self.entry.state.lock().unwrap();
        if let Some(dead) = &st.dead {
            return Err(dead.to_error());
        }
        let n = buf.len().min(st.buf.len());
        for (i, b) in st.buf.iter().take(n).enumerate() {
            buf[i] = *b;
        }
        Ok(n)
    }

    /// Orderly close: emits CLOSE, waits a bounded time for the peer's
    /// CLOSE, then tears down locally regardless.
    pub fn disconnect(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let key = (self.src_port, self.dst_port);
        {
            let mut st = self.entry.state.lock().unwrap();
            if st.dead.is_some() || st.phase == Phase::Closed {
                drop(st);
                self.mux.remove(key);
                return Ok(());
            }
            st.phase = Phase::HalfClosed;
        }
        let _ = self
            .mux
            .write_control(self.src_port, self.dst_port, ControlOp::Close, 0, 0, 0);

        let deadline = Instant::now() + CLOSE_TIMEOUT;
        let mut st = self.entry.state.lock().unwrap();
        while st.phase != Phase::Closed {
            let now = Instant::now();
            if now >= deadline {
                log::debug!("peer never answered CLOSE on {:?}", key);
                break;
            }
            let (guard, _) = self.entry.cv.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
        st.phase = Phase::Closed;
        drop(st);
        self.mux.remove(key);
        Ok(())
    }
}

impl Drop for VConn {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

impl Conn for VConn {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        VConn::send(self, data)
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        VConn::recv_timeout(self, buf, timeout)
    }

    fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        VConn::peek(self, buf)
    }
}
