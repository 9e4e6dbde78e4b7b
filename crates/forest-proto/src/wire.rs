//! # Forest Wire Format
//!
//! Every forest packet is a 20-byte header followed by 0..1476 payload
//! bytes, carried in a single UDP datagram.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver=1 | Length (12)           |   Type (8)    |   Flags (8)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Comtree Number                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Destination Address                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Header Checksum (16)      |    Payload Checksum (16)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Length counts the whole datagram including the header. The header
//! checksum covers bytes 0..16; the payload checksum covers the payload.
//! Both are 16-bit ones'-complement sums.

use bytes::{BufMut, BytesMut};

use crate::addr::ForestAdr;

/// Protocol version carried in the top nibble of word 0.
pub const FOREST_VERSION: u8 = 1;

/// Header size in bytes.
pub const OVERHEAD: usize = 20;

/// Largest datagram a forest router will emit or accept.
pub const MAX_PKT_LEN: usize = 1496;

/// Largest payload: [`MAX_PKT_LEN`] minus the header.
pub const MAX_PAYLOAD: usize = MAX_PKT_LEN - OVERHEAD;

/// Comtree reserved for leaf connect/disconnect signalling.
pub const CONNECT_COMT: u32 = 1;

/// Comtree reserved for router-to-router signalling.
pub const NABOR_COMT: u32 = 2;

/// Flag bit acknowledging a connect or disconnect.
pub const ACK_FLAG: u8 = 0x01;

/// Packet type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PktType {
    /// User data, forwarded by comtree routes.
    Data = 1,
    /// Multicast subscribe/unsubscribe from a leaf.
    SubUnsub = 2,
    /// Client-side signalling (leaf <-> controllers).
    ClientSig = 10,
    /// Initial handshake binding an endpoint to a provisioned link.
    Connect = 11,
    Disconnect = 12,
    /// Network-side signalling (routers <-> network managers).
    NetSig = 100,
    /// Signalling between neighboring routers.
    NaborSig = 101,
}

impl PktType {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PktType::Data),
            2 => Some(PktType::SubUnsub),
            10 => Some(PktType::ClientSig),
            11 => Some(PktType::Connect),
            12 => Some(PktType::Disconnect),
            100 => Some(PktType::NetSig),
            101 => Some(PktType::NaborSig),
            _ => None,
        }
    }

    /// True for the three signalling types that carry a control packet
    /// payload.
    pub const fn is_signal(self) -> bool {
        matches!(self, PktType::ClientSig | PktType::NetSig | PktType::NaborSig)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("length field {field} disagrees with datagram of {actual} bytes")]
    BadLength { field: usize, actual: usize },
    #[error("unknown packet type code {0}")]
    BadType(u8),
    #[error("header checksum mismatch")]
    HdrChecksum,
    #[error("payload checksum mismatch")]
    PayChecksum,
}

/// 16-bit ones'-complement sum, the checksum used by both header and
/// payload fields.
pub fn cksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        sum += (rem[0] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// The decoded fixed header of a forest packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total datagram length in bytes, header included.
    pub length: u16,
    pub typ: PktType,
    pub flags: u8,
    pub comtree: u32,
    pub src: ForestAdr,
    pub dst: ForestAdr,
}

impl PacketHeader {
    pub fn new(typ: PktType, comtree: u32, src: ForestAdr, dst: ForestAdr) -> Self {
        PacketHeader {
            length: OVERHEAD as u16,
            typ,
            flags: 0,
            comtree,
            src,
            dst,
        }
    }

    /// Serialize the header plus payload into `out`, computing both
    /// checksums and the length field.
    ///
    /// Panics if the payload exceeds [`MAX_PAYLOAD`]; callers bound
    /// payloads when they build packets.
    pub fn pack_into(&self, out: &mut BytesMut, payload: &[u8]) {
        assert!(payload.len() <= MAX_PAYLOAD, "payload exceeds forest maximum");
        let length = (OVERHEAD + payload.len()) as u16;
        out.reserve(length as usize);
        let start = out.len();
        let word0: u32 = ((FOREST_VERSION as u32) << 28)
            | ((length as u32 & 0x0fff) << 16)
            | ((self.typ.code() as u32) << 8)
            | self.flags as u32;
        out.put_u32(word0);
        out.put_u32(self.comtree);
        out.put_u32(self.src.raw());
        out.put_u32(self.dst.raw());
        let hdr_ck = cksum16(&out[start..start + 16]);
        out.put_u16(hdr_ck);
        out.put_u16(cksum16(payload));
        out.put_slice(payload);
    }

    /// Parse and verify a received datagram. Returns the header; the
    /// payload is `datagram[OVERHEAD..header.length]`.
    pub fn unpack(datagram: &[u8]) -> Result<PacketHeader, WireError> {
        if datagram.len() < OVERHEAD {
            return Err(WireError::Truncated(datagram.len()));
        }
        let word0 = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let version = (word0 >> 28) as u8;
        if version != FOREST_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let length = ((word0 >> 16) & 0x0fff) as usize;
        if length < OVERHEAD || length > datagram.len() || length > MAX_PKT_LEN {
            return Err(WireError::BadLength { field: length, actual: datagram.len() });
        }
        let type_code = ((word0 >> 8) & 0xff) as u8;
        let typ = PktType::from_code(type_code).ok_or(WireError::BadType(type_code))?;
        let flags = (word0 & 0xff) as u8;
        let comtree = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
        let src = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
        let dst = u32::from_be_bytes([datagram[12], datagram[13], datagram[14], datagram[15]]);
        let hdr_ck = u16::from_be_bytes([datagram[16], datagram[17]]);
        let pay_ck = u16::from_be_bytes([datagram[18], datagram[19]]);
        if cksum16(&datagram[..16]) != hdr_ck {
            return Err(WireError::HdrChecksum);
        }
        if cksum16(&datagram[OVERHEAD..length]) != pay_ck {
            return Err(WireError::PayChecksum);
        }
        Ok(PacketHeader {
            length: length as u16,
            typ,
            flags,
            comtree,
            src: ForestAdr::from_raw(src),
            dst: ForestAdr::from_raw(dst),
        })
    }
}
