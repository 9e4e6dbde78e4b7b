//! # Control Packet Codec
//!
//! Signalling packets (`ClientSig`, `NetSig`, `NaborSig`) carry a control
//! packet in their payload:
//!
//! ```text
//! [type:u32][mode:u32][seq:u64][nattrs:u32][(attr:u32,value:u32)*][text...]
//! ```
//!
//! `mode` distinguishes requests from positive and negative replies. A
//! reply reuses the request's sequence number so the sender can match it.
//! The attribute list is self-describing; any trailing bytes are UTF-8
//! text — the error message of a negative reply, or the listing string of
//! a `Get*Set` reply.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::addr::ForestAdr;
use crate::rate::RateSpec;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Control packet operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CtlType {
    AddIface = 10,
    DropIface = 11,
    GetIface = 12,
    ModIface = 13,
    GetIfaceSet = 14,

    AddLink = 20,
    DropLink = 21,
    GetLink = 22,
    ModLink = 23,
    GetLinkSet = 24,

    AddComtree = 30,
    DropComtree = 31,
    GetComtree = 32,
    ModComtree = 33,
    GetComtreeSet = 34,

    AddComtreeLink = 40,
    DropComtreeLink = 41,
    GetComtreeLink = 42,
    ModComtreeLink = 43,

    AddRoute = 50,
    DropRoute = 51,
    GetRoute = 52,
    ModRoute = 53,
    GetRouteSet = 54,
    AddRouteLink = 55,
    DropRouteLink = 56,

    AddFilter = 70,
    DropFilter = 71,
    GetFilter = 72,
    ModFilter = 73,
    GetFilterSet = 74,
    GetLoggedPackets = 75,
    EnablePacketLog = 76,

    SetLeafRange = 80,

    // comtree construction, driven by an external comtree controller
    Join = 90,
    Leave = 91,
    AddBranch = 92,
    Prune = 93,
    Confirm = 94,
    Abort = 95,
}

impl CtlType {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use CtlType::*;
        Some(match code {
            10 => AddIface,
            11 => DropIface,
            12 => GetIface,
            13 => ModIface,
            14 => GetIfaceSet,
            20 => AddLink,
            21 => DropLink,
            22 => GetLink,
            23 => ModLink,
            24 => GetLinkSet,
            30 => AddComtree,
            31 => DropComtree,
            32 => GetComtree,
            33 => ModComtree,
            34 => GetComtreeSet,
            40 => AddComtreeLink,
            41 => DropComtreeLink,
            42 => GetComtreeLink,
            43 => ModComtreeLink,
            50 => AddRoute,
            51 => DropRoute,
            52 => GetRoute,
            53 => ModRoute,
            54 => GetRouteSet,
            55 => AddRouteLink,
            56 => DropRouteLink,
            70 => AddFilter,
            71 => DropFilter,
            72 => GetFilter,
            73 => ModFilter,
            74 => GetFilterSet,
            75 => GetLoggedPackets,
            76 => EnablePacketLog,
            80 => SetLeafRange,
            90 => Join,
            91 => Leave,
            92 => AddBranch,
            93 => Prune,
            94 => Confirm,
            95 => Abort,
            _ => return None,
        })
    }
}

/// Request/reply discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CtlMode {
    Request = 1,
    PosReply = 2,
    NegReply = 3,
}

impl CtlMode {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(CtlMode::Request),
            2 => Some(CtlMode::PosReply),
            3 => Some(CtlMode::NegReply),
            _ => None,
        }
    }
}

// ─── Attributes ──────────────────────────────────────────────────────────────

/// Attribute codes for the (code, value) pairs in a control packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum CtlAttr {
    BitRateUp = 1,
    BitRateDown = 2,
    PktRateUp = 3,
    PktRateDown = 4,
    AvailBitRateUp = 5,
    AvailBitRateDown = 6,
    AvailPktRateUp = 7,
    AvailPktRateDown = 8,

    Comtree = 10,
    CoreFlag = 11,
    ParentLink = 12,
    LinkCount = 13,
    LeafCount = 14,

    Iface = 20,
    LocalIp = 21,
    LocalPort = 22,

    Link = 30,
    PeerIp = 31,
    PeerPort = 32,
    PeerType = 33,
    PeerAdr = 34,
    PeerDest = 35,
    Connected = 36,

    DestAdr = 40,
    LeafAdr = 41,
    RtrAdr = 42,

    Queue = 50,
    NonceHi = 51,
    NonceLo = 52,

    Count = 60,
    NextId = 61,

    FirstLeafAdr = 70,
    LastLeafAdr = 71,

    Filter = 80,
    Enable = 81,
    LocalFlag = 82,
}

impl CtlAttr {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use CtlAttr::*;
        Some(match code {
            1 => BitRateUp,
            2 => BitRateDown,
            3 => PktRateUp,
            4 => PktRateDown,
            5 => AvailBitRateUp,
            6 => AvailBitRateDown,
            7 => AvailPktRateUp,
            8 => AvailPktRateDown,
            10 => Comtree,
            11 => CoreFlag,
            12 => ParentLink,
            13 => LinkCount,
            14 => LeafCount,
            20 => Iface,
            21 => LocalIp,
            22 => LocalPort,
            30 => Link,
            31 => PeerIp,
            32 => PeerPort,
            33 => PeerType,
            34 => PeerAdr,
            35 => PeerDest,
            36 => Connected,
            40 => DestAdr,
            41 => LeafAdr,
            42 => RtrAdr,
            50 => Queue,
            51 => NonceHi,
            52 => NonceLo,
            60 => Count,
            61 => NextId,
            70 => FirstLeafAdr,
            71 => LastLeafAdr,
            80 => Filter,
            81 => Enable,
            82 => LocalFlag,
            _ => return None,
        })
    }
}

/// A required attribute was absent from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("missing attribute {0:?}")]
pub struct MissingAttr(pub CtlAttr);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CtlDecodeError {
    #[error("control payload truncated")]
    Truncated,
    #[error("unknown control packet type code {0}")]
    BadType(u32),
    #[error("unknown control packet mode {0}")]
    BadMode(u32),
    #[error("unknown attribute code {0}")]
    BadAttr(u32),
    #[error("control packet text is not valid UTF-8")]
    BadText,
}

// ─── CtlPkt ──────────────────────────────────────────────────────────────────

/// A decoded control packet: operation, mode, sequence number, attributes
/// and optional trailing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlPkt {
    pub typ: CtlType,
    pub mode: CtlMode,
    pub seq: u64,
    attrs: BTreeMap<CtlAttr, u32>,
    /// Error message (negative replies) or listing text (set replies).
    pub text: Option<String>,
}

impl CtlPkt {
    pub fn request(typ: CtlType, seq: u64) -> Self {
        CtlPkt { typ, mode: CtlMode::Request, seq, attrs: BTreeMap::new(), text: None }
    }

    pub fn pos_reply(typ: CtlType, seq: u64) -> Self {
        CtlPkt { typ, mode: CtlMode::PosReply, seq, attrs: BTreeMap::new(), text: None }
    }

    pub fn neg_reply(typ: CtlType, seq: u64, msg: impl Into<String>) -> Self {
        CtlPkt {
            typ,
            mode: CtlMode::NegReply,
            seq,
            attrs: BTreeMap::new(),
            text: Some(msg.into()),
        }
    }

    pub fn is_request(&self) -> bool {
        self.mode == CtlMode::Request
    }

    pub fn set(&mut self, attr: CtlAttr, value: u32) -> &mut Self {
        self.attrs.insert(attr, value);
        self
    }

    /// Set only when the value is non-zero, the usual convention for
    /// optional numeric attributes.
    pub fn set_nonzero(&mut self, attr: CtlAttr, value: u32) -> &mut Self {
        if value != 0 {
            self.attrs.insert(attr, value);
        }
        self
    }

    pub fn get(&self, attr: CtlAttr) -> Option<u32> {
        self.attrs.get(&attr).copied()
    }

    pub fn is_set(&self, attr: CtlAttr) -> bool {
        self.attrs.contains_key(&attr)
    }

    pub fn require(&self, attr: CtlAttr) -> Result<u32, MissingAttr> {
        self.get(attr).ok_or(MissingAttr(attr))
    }

    /// Value of an optional attribute, zero when absent.
    pub fn get_or_zero(&self, attr: CtlAttr) -> u32 {
        self.get(attr).unwrap_or(0)
    }

    pub fn set_adr(&mut self, attr: CtlAttr, adr: ForestAdr) -> &mut Self {
        self.set(attr, adr.raw())
    }

    pub fn adr(&self, attr: CtlAttr) -> Option<ForestAdr> {
        self.get(attr).map(ForestAdr::from_raw)
    }

    /// Store a rate spec as its four attributes.
    pub fn set_rates(&mut self, rs: &RateSpec) -> &mut Self {
        self.set(CtlAttr::BitRateUp, rs.bit_up as u32);
        self.set(CtlAttr::BitRateDown, rs.bit_down as u32);
        self.set(CtlAttr::PktRateUp, rs.pkt_up as u32);
        self.set(CtlAttr::PktRateDown, rs.pkt_down as u32)
    }

    /// Read a rate spec from its four attributes; `None` unless all four
    /// are present.
    pub fn rates(&self) -> Option<RateSpec> {
        Some(RateSpec::new(
            self.get(CtlAttr::BitRateUp)? as i32,
            self.get(CtlAttr::BitRateDown)? as i32,
            self.get(CtlAttr::PktRateUp)? as i32,
            self.get(CtlAttr::PktRateDown)? as i32,
        ))
    }

    /// Store an available-rate spec (the remaining budget of an
    /// interface or link) as its four attributes.
    pub fn set_avail_rates(&mut self, rs: &RateSpec) -> &mut Self {
        self.set(CtlAttr::AvailBitRateUp, rs.bit_up as u32);
        self.set(CtlAttr::AvailBitRateDown, rs.bit_down as u32);
        self.set(CtlAttr::AvailPktRateUp, rs.pkt_up as u32);
        self.set(CtlAttr::AvailPktRateDown, rs.pkt_down as u32)
    }

    pub fn avail_rates(&self) -> Option<RateSpec> {
        Some(RateSpec::new(
            self.get(CtlAttr::AvailBitRateUp)? as i32,
            self.get(CtlAttr::AvailBitRateDown)? as i32,
            self.get(CtlAttr::AvailPktRateUp)? as i32,
            self.get(CtlAttr::AvailPktRateDown)? as i32,
        ))
    }

    pub fn set_nonce(&mut self, nonce: u64) -> &mut Self {
        self.set(CtlAttr::NonceHi, (nonce >> 32) as u32);
        self.set(CtlAttr::NonceLo, nonce as u32)
    }

    pub fn nonce(&self) -> Option<u64> {
        let hi = self.get(CtlAttr::NonceHi)?;
        let lo = self.get(CtlAttr::NonceLo)?;
        Some(((hi as u64) << 32) | lo as u64)
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(text.into());
        self
    }

    pub fn encoded_len(&self) -> usize {
        20 + self.attrs.len() * 8 + self.text.as_ref().map_or(0, |t| t.len())
    }

    /// Serialize into a payload buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.typ.code());
        buf.put_u32(self.mode.code());
        buf.put_u64(self.seq);
        buf.put_u32(self.attrs.len() as u32);
        for (attr, value) in &self.attrs {
            buf.put_u32(attr.code());
            buf.put_u32(*value);
        }
        if let Some(text) = &self.text {
            buf.put_slice(text.as_bytes());
        }
        buf.freeze()
    }

    /// Parse a control packet from a signalling payload.
    pub fn decode(mut payload: &[u8]) -> Result<CtlPkt, CtlDecodeError> {
        if payload.remaining() < 20 {
            return Err(CtlDecodeError::Truncated);
        }
        let type_code = payload.get_u32();
        let typ = CtlType::from_code(type_code).ok_or(CtlDecodeError::BadType(type_code))?;
        let mode_code = payload.get_u32();
        let mode = CtlMode::from_code(mode_code).ok_or(CtlDecodeError::BadMode(mode_code))?;
        let seq = payload.get_u64();
        let nattrs = payload.get_u32() as usize;
        if payload.remaining() < nattrs * 8 {
            return Err(CtlDecodeError::Truncated);
        }
        let mut attrs = BTreeMap::new();
        for _ in 0..nattrs {
            let code = payload.get_u32();
            let attr = CtlAttr::from_code(code).ok_or(CtlDecodeError::BadAttr(code))?;
            let value = payload.get_u32();
            attrs.insert(attr, value);
        }
        let text = if payload.has_remaining() {
            let s = std::str::from_utf8(payload.chunk()).map_err(|_| CtlDecodeError::BadText)?;
            Some(s.to_string())
        } else {
            None
        };
        Ok(CtlPkt { typ, mode, seq, attrs, text })
    }

    /// Peek only the (src-matching) fields needed for request/reply
    /// bookkeeping without a full decode. Used by the substrate to
    /// identify malformed packets it can still answer.
    pub fn peek_seq(payload: &[u8]) -> Option<(u32, u32, u64)> {
        if payload.len() < 16 {
            return None;
        }
        let typ = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mode = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let seq = u64::from_be_bytes([
            payload[8], payload[9], payload[10], payload[11], payload[12], payload[13],
            payload[14], payload[15],
        ]);
        Some((typ, mode, seq))
    }
}

impl fmt::Display for CtlPkt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?} seq={}", self.typ, self.mode, self.seq)?;
        for (attr, value) in &self.attrs {
            write!(f, " {:?}={}", attr, value)?;
        }
        if let Some(text) = &self.text {
            write!(f, " {:?}", text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut cp = CtlPkt::request(CtlType::AddLink, 42);
        cp.set(CtlAttr::Iface, 1)
            .set(CtlAttr::PeerIp, u32::from(std::net::Ipv4Addr::new(10, 0, 0, 2)))
            .set(CtlAttr::PeerPort, 30001)
            .set(CtlAttr::PeerType, 2);
        cp.set_nonce(0xDEAD_BEEF_0000_1111);
        cp.set_rates(&RateSpec::new(1000, 1000, 100, 100));

        let bytes = cp.encode();
        let back = CtlPkt::decode(&bytes).unwrap();
        assert_eq!(back, cp);
        assert_eq!(back.nonce(), Some(0xDEAD_BEEF_0000_1111));
        assert_eq!(back.rates(), Some(RateSpec::new(1000, 1000, 100, 100)));
    }

    #[test]
    fn neg_reply_carries_message() {
        let cp = CtlPkt::neg_reply(CtlType::GetLink, 7, "get link: invalid link number");
        let back = CtlPkt::decode(&cp.encode()).unwrap();
        assert_eq!(back.mode, CtlMode::NegReply);
        assert_eq!(back.seq, 7);
        assert_eq!(back.text.as_deref(), Some("get link: invalid link number"));
    }

    #[test]
    fn truncated_payload_rejected() {
        let cp = CtlPkt::request(CtlType::GetIface, 1);
        let bytes = cp.encode();
        assert_eq!(CtlPkt::decode(&bytes[..bytes.len() - 1]), Err(CtlDecodeError::Truncated));
        assert_eq!(CtlPkt::decode(&bytes[..8]), Err(CtlDecodeError::Truncated));
    }

    #[test]
    fn attr_list_shorter_than_count_rejected() {
        let mut cp = CtlPkt::request(CtlType::GetIface, 1);
        cp.set(CtlAttr::Iface, 3);
        let bytes = cp.encode();
        // chop off the value of the only attribute
        assert_eq!(CtlPkt::decode(&bytes[..bytes.len() - 4]), Err(CtlDecodeError::Truncated));
    }

    #[test]
    fn unknown_codes_rejected() {
        let mut cp = CtlPkt::request(CtlType::GetIface, 1);
        cp.set(CtlAttr::Iface, 3);
        let mut bytes = BytesMut::from(&cp.encode()[..]);
        bytes[3] = 0xff; // type code
        assert!(matches!(CtlPkt::decode(&bytes), Err(CtlDecodeError::BadType(_))));

        let mut bytes = BytesMut::from(&cp.encode()[..]);
        bytes[7] = 9; // mode
        assert_eq!(CtlPkt::decode(&bytes), Err(CtlDecodeError::BadMode(9)));

        let mut bytes = BytesMut::from(&cp.encode()[..]);
        bytes[23] = 0xfe; // attribute code
        assert!(matches!(CtlPkt::decode(&bytes), Err(CtlDecodeError::BadAttr(_))));
    }

    #[test]
    fn peek_seq_reads_prefix() {
        let cp = CtlPkt::request(CtlType::DropRoute, 0x1234_5678_9abc_def0);
        let bytes = cp.encode();
        let (typ, mode, seq) = CtlPkt::peek_seq(&bytes).unwrap();
        assert_eq!(typ, CtlType::DropRoute.code());
        assert_eq!(mode, CtlMode::Request.code());
        assert_eq!(seq, 0x1234_5678_9abc_def0);
        assert_eq!(CtlPkt::peek_seq(&bytes[..10]), None);
    }

    #[test]
    fn all_type_codes_round_trip() {
        for code in 0..200u32 {
            if let Some(t) = CtlType::from_code(code) {
                assert_eq!(t.code(), code);
            }
        }
    }

    #[test]
    fn rates_need_all_four_attrs() {
        let mut cp = CtlPkt::request(CtlType::ModLink, 1);
        cp.set(CtlAttr::BitRateUp, 100).set(CtlAttr::BitRateDown, 100);
        assert_eq!(cp.rates(), None);
    }
}
