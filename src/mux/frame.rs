use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const MUX_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 32;
pub const MAX_FRAME: usize = 65536;
pub const MAX_PAYLOAD: usize = MAX_FRAME - HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Connect,
    Ack,
    Close,
    Reset,
}

impl ControlOp {
    pub fn to_wire(self) -> u32 {
        match self {
            ControlOp::Connect => 1,
            ControlOp::Ack => 2,
            ControlOp::Close => 3,
            ControlOp::Reset => 4,
        }
    }

    pub fn from_wire(v: u32) -> Result<ControlOp> {
        match v {
            1 => Ok(ControlOp::Connect),
            2 => Ok(ControlOp::Ack),
            3 => Ok(ControlOp::Close),
            4 => Ok(ControlOp::Reset),
            other => Err(Error::Mux(format!("unknown control subtype {}", other))),
        }
    }
}

/// Fixed frame header; every multi-byte field is network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Total frame length, header included.
    pub length: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u32,
    pub flags: u32,
}

impl FrameHeader {
    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut buf[0..4], MUX_VERSION);
        BigEndian::write_u32(
            &mut buf[4..8],
            match self.kind {
                FrameKind::Data => 0,
                FrameKind::Control => 1,
            },
        );
        BigEndian::write_u32(&mut buf[8..12], self.length);
        BigEndian::write_u16(&mut buf[12..14], self.src_port);
        BigEndian::write_u16(&mut buf[14..16], self.dst_port);
        BigEndian::write_u32(&mut buf[16..20], self.seq);
        BigEndian::write_u32(&mut buf[20..24], self.ack);
        BigEndian::write_u32(&mut buf[24..28], self.window);
        BigEndian::write_u32(&mut buf[28..32], self.flags);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<FrameHeader> {
        let version = BigEndian::read_u32(&buf[0..4]);
        if version != MUX_VERSION {
            return Err(Error::BadHeader("unsupported mux protocol version"));
        }
        let kind = match BigEndian::read_u32(&buf[4..8]) {
            0 => FrameKind::Data,
            1 => FrameKind::Control,
            _ => return Err(Error::BadHeader("unknown frame kind")),
        };
        let length = BigEndian::read_u32(&buf[8..12]);
        if (length as usize) < HEADER_LEN || (length as usize) > MAX_FRAME {
            return Err(Error::Mux(format!("frame length {} out of range", length)));
        }
        Ok(FrameHeader {
            kind,
            length,
            src_port: BigEndian::read_u16(&buf[12..14]),
            dst_port: BigEndian::read_u16(&buf[14..16]),
            seq: BigEndian::read_u32(&buf[16..20]),
            ack: BigEndian::read_u32(&buf[20..24]),
            window: BigEndian::read_u32(&buf[24..28]),
            flags: BigEndian::read_u32(&buf[28..32]),
        })
    }
}

/// Serializes a complete frame (header + payload) into one buffer so the
/// writer can hand it to the bulk endpoint in a single call.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.length as usize, HEADER_LEN + payload.len());
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

pub fn control_body(op: ControlOp) -> [u8; 4] {
    let mut body = [0u8; 4];
    BigEndian::write_u32(&mut body, op.to_wire());
    body
}

pub fn parse_control_body(payload: &[u8]) -> Result<ControlOp> {
    if payload.len() < 4 {
        return Err(Error::Mux("control frame body too short".into()));
    }
    ControlOp::from_wire(BigEndian::read_u32(&payload[0..4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameHeader {
        FrameHeader {
            kind: FrameKind::Data,
            length: (HEADER_LEN + 5) as u32,
            src_port: 0x0401,
            dst_port: 0xf27e,
            seq: 7,
            ack: 3,
            window: 0x20000,
            flags: 0,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let h = sample();
        let decoded = FrameHeader::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(decoded.payload_len(), 5);
    }

    #[test]
    fn test_header_is_network_order() {
        let buf = sample().encode();
        // version then kind, both big-endian
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[12..14], &[0x04, 0x01]);
        assert_eq!(&buf[14..16], &[0xf2, 0x7e]);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut buf = sample().encode();
        buf[0] = 0xff;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(Error::BadHeader(_))
        ));
    }

    #[test]
    fn test_rejects_undersized_length() {
        let mut buf = sample().encode();
        BigEndian::write_u32(&mut buf[8..12], 4);
        assert!(matches!(FrameHeader::decode(&buf), Err(Error::Mux(_))));
    }

    #[test]
    fn test_control_body_roundtrip() {
        for op in [
            ControlOp::Connect,
            ControlOp::Ack,
            ControlOp::Close,
            ControlOp::Reset,
        ] {
            assert_eq!(parse_control_body(&control_body(op)).unwrap(), op);
        }
        assert!(parse_control_body(&[0, 0, 0, 9]).is_err());
    }
}
