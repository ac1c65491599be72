//! Apple File Conduit client: request/reply framing with per-packet sequence
//! numbers over a dedicated virtual connection. One request is in flight at a
//! time; every operation takes `&mut self`, so concurrent use of a single
//! client is a compile-time error.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::conn::{recv_exact, send_all, Conn};
use crate::device::Device;
use crate::error::{AfcError, AfcResult, Error};
use crate::lockdown::LockdownClient;
use crate::mux::VConn;
use crate::util::debug::dump_buffer;

pub const AFC_SERVICE_NAME: &str = "com.apple.afc";

const AFC_MAGIC: &[u8; 8] = b"CFA6LPAA";
const HEADER_LEN: usize = 40;

/// Reads are chunked at this ceiling.
const MAX_READ_CHUNK: usize = 1 << 16;
/// Writes are chunked at this ceiling, each chunk framed on its own.
const MAX_WRITE_CHUNK: usize = 1 << 15;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_TIMEOUT: Duration = Duration::from_secs(5);

mod op {
    pub const STATUS: u64 = 0x01;
    pub const DATA: u64 = 0x02;
    pub const READ_DIR: u64 = 0x03;
    pub const TRUNCATE: u64 = 0x07;
    pub const REMOVE_PATH: u64 = 0x08;
    pub const MAKE_DIR: u64 = 0x09;
    pub const GET_FILE_INFO: u64 = 0x0a;
    pub const GET_DEVINFO: u64 = 0x0b;
    pub const FILE_OPEN: u64 = 0x0d;
    pub const FILE_OPEN_RES: u64 = 0x0e;
    pub const READ: u64 = 0x0f;
    pub const WRITE: u64 = 0x10;
    pub const FILE_SEEK: u64 = 0x11;
    pub const FILE_TELL: u64 = 0x12;
    pub const FILE_TELL_RES: u64 = 0x13;
    pub const FILE_CLOSE: u64 = 0x14;
    pub const FILE_SET_SIZE: u64 = 0x15;
    pub const RENAME_PATH: u64 = 0x18;
    pub const FILE_LOCK: u64 = 0x1b;
    pub const MAKE_LINK: u64 = 0x1c;
    pub const SET_FILE_TIME: u64 = 0x1e;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read = 2,
    Write = 3,
    ReadWrite = 4,
    Append = 5,
    ReadWriteAppend = 6,
}

/// flock-style lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Shared = 5,
    Exclusive = 6,
    Unlock = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Hard = 1,
    Symbolic = 2,
}

#[derive(Debug)]
enum Reply {
    Status(u64),
    Data(Vec<u8>),
    FileHandle(u64),
    Position(u64),
}

pub struct AfcClient<C: Conn = VConn> {
    conn: C,
    packet_num: u64,
}

impl AfcClient<VConn> {
    /// Asks the control service to launch AFC and connects to the returned
    /// port.
    pub fn connect(device: &Device, lockdown: &mut LockdownClient<VConn>) -> AfcResult<Self> {
        let port = lockdown
            .start_service(AFC_SERVICE_NAME)
            .map_err(AfcError::from)?;
        let conn = device.connect(port).map_err(AfcError::from)?;
        Ok(AfcClient::new(conn))
    }
}

impl<C: Conn> AfcClient<C> {
    pub fn new(conn: C) -> Self {
        AfcClient {
            conn,
            packet_num: 0,
        }
    }

    /// Sends one packet. With `payload`, the header plus `params` go out
    /// first and the bulk payload follows as a second segment (the split
    /// form used for writes); otherwise everything fits one frame.
    fn dispatch(&mut self, operation: u64, params: &[u8], payload: Option<&[u8]>) -> AfcResult<()> {
        self.packet_num += 1;
        let this_length = HEADER_LEN + params.len();
        let entire_length = this_length + payload.map_or(0, <[u8]>::len);

        let mut head = Vec::with_capacity(this_length);
        head.extend_from_slice(AFC_MAGIC);
        let mut fields = [0u8; 32];
        LittleEndian::write_u64(&mut fields[0..8], entire_length as u64);
        LittleEndian::write_u64(&mut fields[8..16], this_length as u64);
        LittleEndian::write_u64(&mut fields[16..24], self.packet_num);
        LittleEndian::write_u64(&mut fields[24..32], operation);
        head.extend_from_slice(&fields);
        head.extend_from_slice(params);

        dump_buffer("afc out", &head);
        send_all(&mut self.conn, &head).map_err(AfcError::from)?;
        if let Some(payload) = payload {
            send_all(&mut self.conn, payload).map_err(AfcError::from)?;
        }
        Ok(())
    }

    /// Reads and validates one reply. The packet number must mirror the
    /// request's; anything else poisons the exchange.
    fn receive(&mut self) -> AfcResult<Reply> {
        let mut header = [0u8; HEADER_LEN];
        recv_exact(&mut self.conn, &mut header, REPLY_TIMEOUT).map_err(|e| match e {
            Error::NotEnoughData { .. } => AfcError::Mux("partial reply header".into()),
            other => other.into(),
        })?;
        dump_buffer("afc in", &header);

        if &header[0..8] != AFC_MAGIC {
            return Err(AfcError::OpHeaderInvalid);
        }
        let entire_length = LittleEndian::read_u64(&header[8..16]) as usize;
        let this_length = LittleEndian::read_u64(&header[16..24]) as usize;
        let packet_num = LittleEndian::read_u64(&header[24..32]);
        let operation = LittleEndian::read_u64(&header[32..40]);

        if packet_num != self.packet_num {
            log::warn!(
                "afc reply names packet {}, expected {}",
                packet_num,
                self.packet_num
            );
            return Err(AfcError::OpHeaderInvalid);
        }
        if this_length < HEADER_LEN || this_length > entire_length {
            return Err(AfcError::OpHeaderInvalid);
        }

        let mut body = vec![0u8; entire_length - HEADER_LEN];
        let first_segment = this_length - HEADER_LEN;
        if first_segment > 0 {
            recv_exact(&mut self.conn, &mut body[..first_segment], BODY_TIMEOUT)
                .map_err(|_| AfcError::NotEnoughData)?;
        }
        if body.len() > first_segment {
            recv_exact(&mut self.conn, &mut body[first_segment..], BODY_TIMEOUT)
                .map_err(|_| AfcError::NotEnoughData)?;
        }
        dump_buffer("afc in", &body);

        match operation {
            op::STATUS => {
                if body.len() < 8 {
                    return Err(AfcError::OpHeaderInvalid);
                }
                Ok(Reply::Status(LittleEndian::read_u64(&body[0..8])))
            }
            op::DATA => Ok(Reply::Data(body)),
            op::FILE_OPEN_RES => {
                if body.len() < 8 {
                    return Err(AfcError::OpHeaderInvalid);
                }
                Ok(Reply::FileHandle(LittleEndian::read_u64(&body[0..8])))
            }
            op::FILE_TELL_RES => {
                if body.len() < 8 {
                    return Err(AfcError::OpHeaderInvalid);
                }
                Ok(Reply::Position(LittleEndian::read_u64(&body[0..8])))
            }
            other => {
                log::warn!("afc reply with unknown operation {:#x}", other);
                Err(AfcError::OpNotSupported)
            }
        }
    }

    fn expect_status(&mut self) -> AfcResult<()> {
        match self.receive()? {
            Reply::Status(0) => Ok(()),
            Reply::Status(code) => Err(AfcError::from_status(code)),
            // The device answered with something richer; the operation still
            // succeeded.
            _ => Ok(()),
        }
    }

    fn expect_data(&mut self) -> AfcResult<Vec<u8>> {
        match self.receive()? {
            Reply::Data(data) => Ok(data),
            Reply::Status(0) => Ok(Vec::new()),
            Reply::Status(code) => Err(AfcError::from_status(code)),
            _ => Err(AfcError::OpHeaderInvalid),
        }
    }

    /// Lists a directory. The device reports `.` and `..` first.
    pub fn read_directory(&mut self, path: &str) -> AfcResult<Vec<String>> {
        self.dispatch(op::READ_DIR, &nul_terminated(path), None)?;
        Ok(parse_string_list(&self.expect_data()?))
    }

    /// Device-level parameters: model, filesystem totals, block size.
    pub fn get_device_info(&mut self) -> AfcResult<BTreeMap<String, String>> {
        self.dispatch(op::GET_DEVINFO, &[], None)?;
        Ok(parse_string_map(&self.expect_data()?))
    }

    pub fn get_file_info(&mut self, path: &str) -> AfcResult<BTreeMap<String, String>> {
        self.dispatch(op::GET_FILE_INFO, &nul_terminated(path), None)?;
        Ok(parse_string_map(&self.expect_data()?))
    }

    /// Removes a file or an empty directory.
    pub fn remove_path(&mut self, path: &str) -> AfcResult<()> {
        self.dispatch(op::REMOVE_PATH, &nul_terminated(path), None)?;
        match self.expect_status() {
            // The device answers a generic "unknown" for a populated
            // directory; surface what actually happened.
            Err(AfcError::Unknown) => Err(AfcError::DirNotEmpty),
            other => other,
        }
    }

    pub fn rename_path(&mut self, from: &str, to: &str) -> AfcResult<()> {
        let mut params = nul_terminated(from);
        params.extend_from_slice(&nul_terminated(to));
        self.dispatch(op::RENAME_PATH, &params, None)?;
        self.expect_status()
    }

    pub fn make_directory(&mut self, path: &str) -> AfcResult<()> {
        self.dispatch(op::MAKE_DIR, &nul_terminated(path), None)?;
        self.expect_status()
    }

    /// Truncates by path, without opening the file.
    pub fn truncate(&mut self, path: &str, size: u64) -> AfcResult<()> {
        let mut params = Vec::with_capacity(8 + path.len() + 1);
        params.extend_from_slice(&size.to_le_bytes());
        params.extend_from_slice(&nul_terminated(path));
        self.dispatch(op::TRUNCATE, &params, None)?;
        self.expect_status()
    }

    pub fn make_link(&mut self, kind: LinkType, target: &str, link_name: &str) -> AfcResult<()> {
        let mut params = Vec::with_capacity(8 + target.len() + link_name.len() + 2);
        params.extend_from_slice(&(kind as u64).to_le_bytes());
        params.extend_from_slice(&nul_terminated(target));
        params.extend_from_slice(&nul_terminated(link_name));
        self.dispatch(op::MAKE_LINK, &params, None)?;
        self.expect_status()
    }

    /// Sets the modification time, in nanoseconds since the epoch.
    pub fn set_file_time(&mut self, path: &str, mtime_ns: u64) -> AfcResult<()> {
        let mut params = Vec::with_capacity(8 + path.len() + 1);
        params.extend_from_slice(&mtime_ns.to_le_bytes());
        params.extend_from_slice(&nul_terminated(path));
        self.dispatch(op::SET_FILE_TIME, &params, None)?;
        self.expect_status()
    }

    pub fn file_open(&mut self, path: &str, mode: FileMode) -> AfcResult<u64> {
        let mut params = Vec::with_capacity(8 + path.len() + 1);
        params.extend_from_slice(&(mode as u64).to_le_bytes());
        params.extend_from_slice(&nul_terminated(path));
        self.dispatch(op::FILE_OPEN, &params, None)?;
        match self.receive()? {
            Reply::FileHandle(handle) => Ok(handle),
            Reply::Status(code) if code != 0 => Err(AfcError::from_status(code)),
            _ => Err(AfcError::OpHeaderInvalid),
        }
    }

    pub fn file_close(&mut self, handle: u64) -> AfcResult<()> {
        self.dispatch(op::FILE_CLOSE, &handle.to_le_bytes(), None)?;
        self.expect_status()
    }

    /// Reads up to `length` bytes from an open handle, chunked at the read
    /// ceiling. A short result means end of file.
    pub fn file_read(&mut self, handle: u64, length: usize) -> AfcResult<Vec<u8>> {
        if handle == 0 {
            return Err(AfcError::InvalidArg);
        }
        let mut out = Vec::with_capacity(length.min(MAX_READ_CHUNK));
        while out.len() < length {
            let want = (length - out.len()).min(MAX_READ_CHUNK);
            let mut params = [0u8; 16];
            LittleEndian::write_u64(&mut params[0..8], handle);
            LittleEndian::write_u64(&mut params[8..16], want as u64);
            self.dispatch(op::READ, &params, None)?;
            let chunk = self.expect_data()?;
            let got = chunk.len();
            out.extend_from_slice(&chunk);
            if got < want {
                break;
            }
        }
        Ok(out)
    }

    /// Writes the whole buffer, chunked at the write ceiling; each chunk is
    /// its own numbered packet in split header+payload form, acknowledged by
    /// a status reply before the next goes out.
    pub fn file_write(&mut self, handle: u64, data: &[u8]) -> AfcResult<usize> {
        if handle == 0 {
            return Err(AfcError::InvalidArg);
        }
        let mut written = 0;
        while written < data.len() {
            let chunk = (data.len() - written).min(MAX_WRITE_CHUNK);
            self.dispatch(
                op::WRITE,
                &handle.to_le_bytes(),
                Some(&data[written..written + chunk]),
            )?;
            self.expect_status()?;
            written += chunk;
        }
        Ok(written)
    }

    pub fn file_lock(&mut self, handle: u64, operation: LockOp) -> AfcResult<()> {
        let mut params = [0u8; 16];
        LittleEndian::write_u64(&mut params[0..8], handle);
        LittleEndian::write_u64(&mut params[8..16], operation as u64);
        self.dispatch(op::FILE_LOCK, &params, None)?;
        self.expect_status()
    }

    pub fn file_seek(&mut self, handle: u64, pos: SeekFrom) -> AfcResult<()> {
        let (whence, offset) = match pos {
            SeekFrom::Start(o) => (0u32, o as i64),
            SeekFrom::Current(o) => (1u32, o),
            SeekFrom::End(o) => (2u32, o),
        };
        let mut params = [0u8; 24];
        LittleEndian::write_u64(&mut params[0..8], handle);
        LittleEndian::write_u32(&mut params[8..12], whence);
        // params[12..16] is padding
        LittleEndian::write_i64(&mut params[16..24], offset);
        self.dispatch(op::FILE_SEEK, &params, None)?;
        self.expect_status()
    }

    pub fn file_tell(&mut self, handle: u64) -> AfcResult<u64> {
        self.dispatch(op::FILE_TELL, &handle.to_le_bytes(), None)?;
        match self.receive()? {
            Reply::Position(pos) => Ok(pos),
            Reply::Status(code) if code != 0 => Err(AfcError::from_status(code)),
            _ => Err(AfcError::OpHeaderInvalid),
        }
    }

    /// Truncates by handle, ftruncate-style.
    pub fn file_truncate(&mut self, handle: u64, size: u64) -> AfcResult<()> {
        let mut params = [0u8; 16];
        LittleEndian::write_u64(&mut params[0..8], handle);
        LittleEndian::write_u64(&mut params[8..16], size);
        self.dispatch(op::FILE_SET_SIZE, &params, None)?;
        self.expect_status()
    }
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 1);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out
}

/// Null-separated byte sequence whose terminator is an empty string; the
/// empty trailing entry is expected and dropped.
fn parse_string_list(data: &[u8]) -> Vec<String> {
    data.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// The key-value flavor used by device-info and file-info replies.
fn parse_string_map(data: &[u8]) -> BTreeMap<String, String> {
    let entries = parse_string_list(data);
    entries
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::{pipe, PeerEnd, PipeConn};

    struct SentPacket {
        entire_length: u64,
        this_length: u64,
        packet_num: u64,
        operation: u64,
        body: Vec<u8>,
    }

    fn sent_packets(peer: &PeerEnd) -> Vec<SentPacket> {
        let wire = peer.take_sent();
        let mut out = Vec::new();
        let mut at = 0;
        while at < wire.len() {
            assert_eq!(&wire[at..at + 8], AFC_MAGIC, "bad magic at offset {}", at);
            let entire_length = LittleEndian::read_u64(&wire[at + 8..at + 16]);
            let this_length = LittleEndian::read_u64(&wire[at + 16..at + 24]);
            let packet_num = LittleEndian::read_u64(&wire[at + 24..at + 32]);
            let operation = LittleEndian::read_u64(&wire[at + 32..at + 40]);
            let body = wire[at + HEADER_LEN..at + entire_length as usize].to_vec();
            out.push(SentPacket {
                entire_length,
                this_length,
                packet_num,
                operation,
                body,
            });
            at += entire_length as usize;
        }
        out
    }

    fn push_reply(peer: &PeerEnd, packet_num: u64, operation: u64, body: &[u8]) {
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(AFC_MAGIC);
        let mut fields = [0u8; 32];
        LittleEndian::write_u64(&mut fields[0..8], (HEADER_LEN + body.len()) as u64);
        LittleEndian::write_u64(&mut fields[8..16], (HEADER_LEN + body.len()) as u64);
        LittleEndian::write_u64(&mut fields[16..24], packet_num);
        LittleEndian::write_u64(&mut fields[24..32], operation);
        frame.extend_from_slice(&fields);
        frame.extend_from_slice(body);
        peer.push(&frame);
    }

    fn push_status(peer: &PeerEnd, packet_num: u64, code: u64) {
        push_reply(peer, packet_num, op::STATUS, &code.to_le_bytes());
    }

    fn client() -> (AfcClient<PipeConn>, PeerEnd) {
        let (conn, peer) = pipe();
        (AfcClient::new(conn), peer)
    }

    #[test]
    fn test_packet_numbers_are_monotonic_and_mirrored() {
        let (mut afc, peer) = client();
        push_status(&peer, 1, 0);
        push_status(&peer, 2, 0);
        afc.make_directory("/a").unwrap();
        afc.make_directory("/b").unwrap();

        let packets = sent_packets(&peer);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_num, 1);
        assert_eq!(packets[1].packet_num, 2);
    }

    #[test]
    fn test_mismatched_packet_num_rejected() {
        let (mut afc, peer) = client();
        push_status(&peer, 9, 0);
        assert_eq!(
            afc.make_directory("/a").unwrap_err(),
            AfcError::OpHeaderInvalid
        );
    }

    #[test]
    fn test_read_directory_parses_null_list() {
        let (mut afc, peer) = client();
        push_reply(&peer, 1, op::DATA, b".\0..\0Photos\0Downloads\0");
        let names = afc.read_directory("/").unwrap();
        assert_eq!(names, vec![".", "..", "Photos", "Downloads"]);

        let packets = sent_packets(&peer);
        assert_eq!(packets[0].operation, op::READ_DIR);
        assert_eq!(packets[0].body, b"/\0");
    }

    #[test]
    fn test_device_info_becomes_map() {
        let (mut afc, peer) = client();
        push_reply(
            &peer,
            1,
            op::DATA,
            b"Model\0iPhone1,1\0FSTotalBytes\08000000000\0",
        );
        let info = afc.get_device_info().unwrap();
        assert_eq!(info.get("Model").map(String::as_str), Some("iPhone1,1"));
        assert_eq!(
            info.get("FSTotalBytes").map(String::as_str),
            Some("8000000000")
        );
    }

    #[test]
    fn test_remove_path_remaps_unknown_to_dir_not_empty() {
        let (mut afc, peer) = client();
        push_status(&peer, 1, 1); // generic "unknown" from the device
        assert_eq!(
            afc.remove_path("/full-dir").unwrap_err(),
            AfcError::DirNotEmpty
        );
    }

    #[test]
    fn test_status_codes_surface() {
        let (mut afc, peer) = client();
        push_status(&peer, 1, 8);
        assert_eq!(
            afc.get_file_info("/nope").unwrap_err(),
            AfcError::ObjectNotFound
        );
    }

    #[test]
    fn test_file_open_returns_handle() {
        let (mut afc, peer) = client();
        push_reply(&peer, 1, op::FILE_OPEN_RES, &7u64.to_le_bytes());
        let handle = afc.file_open("/file.bin", FileMode::Write).unwrap();
        assert_eq!(handle, 7);

        let packets = sent_packets(&peer);
        assert_eq!(LittleEndian::read_u64(&packets[0].body[0..8]), 3);
        assert_eq!(&packets[0].body[8..], b"/file.bin\0");
    }

    #[test]
    fn test_large_write_chunks_with_split_headers() {
        let total = 200_000usize;
        let (mut afc, peer) = client();
        push_reply(&peer, 1, op::FILE_OPEN_RES, &5u64.to_le_bytes());
        let handle = afc.file_open("/blob", FileMode::Write).unwrap();

        let chunks = total.div_ceil(MAX_WRITE_CHUNK);
        for i in 0..chunks {
            push_status(&peer, 2 + i as u64, 0);
        }
        peer.take_sent();
        let data = vec![0x5au8; total];
        assert_eq!(afc.file_write(handle, &data).unwrap(), total);

        let packets = sent_packets(&peer);
        assert_eq!(packets.len(), chunks);
        let mut payload_total = 0;
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.operation, op::WRITE);
            assert_eq!(p.packet_num, 2 + i as u64);
            // Split form: header + 8-byte handle first, payload separate.
            assert_eq!(p.this_length as usize, HEADER_LEN + 8);
            assert_eq!(LittleEndian::read_u64(&p.body[0..8]), handle);
            payload_total += p.entire_length as usize - p.this_length as usize;
        }
        assert_eq!(payload_total, total);
    }

    #[test]
    fn test_file_read_chunks_until_short() {
        let (mut afc, peer) = client();
        // 70000 requested: one full 65536 chunk, then a short 1000-byte one.
        push_reply(&peer, 1, op::DATA, &vec![1u8; MAX_READ_CHUNK]);
        push_reply(&peer, 2, op::DATA, &vec![2u8; 1000]);
        let data = afc.file_read(3, 70_000).unwrap();
        assert_eq!(data.len(), MAX_READ_CHUNK + 1000);

        let packets = sent_packets(&peer);
        assert_eq!(packets.len(), 2);
        assert_eq!(LittleEndian::read_u64(&packets[0].body[8..16]), MAX_READ_CHUNK as u64);
        assert_eq!(
            LittleEndian::read_u64(&packets[1].body[8..16]),
            (70_000 - MAX_READ_CHUNK) as u64
        );
    }

    #[test]
    fn test_file_tell_reports_position() {
        let (mut afc, peer) = client();
        push_reply(&peer, 1, op::FILE_TELL_RES, &200_000u64.to_le_bytes());
        assert_eq!(afc.file_tell(4).unwrap(), 200_000);
    }

    #[test]
    fn test_file_seek_parameter_layout() {
        let (mut afc, peer) = client();
        push_status(&peer, 1, 0);
        afc.file_seek(4, SeekFrom::End(-16)).unwrap();

        let packets = sent_packets(&peer);
        let body = &packets[0].body;
        assert_eq!(body.len(), 24);
        assert_eq!(LittleEndian::read_u64(&body[0..8]), 4);
        assert_eq!(LittleEndian::read_u32(&body[8..12]), 2);
        assert_eq!(&body[12..16], &[0, 0, 0, 0]);
        assert_eq!(LittleEndian::read_i64(&body[16..24]), -16);
    }

    #[test]
    fn test_unknown_reply_operation_not_supported() {
        let (mut afc, peer) = client();
        push_reply(&peer, 1, 0x99, &[0u8; 8]);
        assert_eq!(
            afc.read_directory("/").unwrap_err(),
            AfcError::OpNotSupported
        );
    }

    #[test]
    fn test_lock_and_link_parameters() {
        let (mut afc, peer) = client();
        push_status(&peer, 1, 0);
        afc.file_lock(9, LockOp::Exclusive).unwrap();
        push_status(&peer, 2, 0);
        afc.make_link(LinkType::Symbolic, "/target", "/link").unwrap();

        let packets = sent_packets(&peer);
        assert_eq!(LittleEndian::read_u64(&packets[0].body[8..16]), 6);
        assert_eq!(LittleEndian::read_u64(&packets[1].body[0..8]), 2);
        assert_eq!(&packets[1].body[8..], b"/target\0/link\0");
    }
}
