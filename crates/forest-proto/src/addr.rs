//! Forest addresses.
//!
//! A forest address is a 32-bit value split into a 16-bit *zip* and a
//! 16-bit *local* part. A zip with a zero local part names a router; a
//! non-zero local part names a leaf hanging off that router. The high bit
//! distinguishes multicast (set) from unicast (clear).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// High bit of a forest address: set for multicast groups.
pub const MCAST_BIT: u32 = 0x8000_0000;

/// A 32-bit forest address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForestAdr(u32);

impl ForestAdr {
    /// The null address. Never valid on the wire.
    pub const NONE: ForestAdr = ForestAdr(0);

    /// Build a unicast address from zip and local parts.
    pub const fn new(zip: u16, local: u16) -> Self {
        ForestAdr(((zip as u32) << 16) | local as u32)
    }

    /// Build the router address for a zip (local part zero).
    pub const fn router(zip: u16) -> Self {
        ForestAdr::new(zip, 0)
    }

    /// Build a multicast group address from a 31-bit group number.
    pub const fn mcast(group: u32) -> Self {
        ForestAdr(MCAST_BIT | (group & !MCAST_BIT))
    }

    /// Reinterpret a raw 32-bit value as an address.
    pub const fn from_raw(raw: u32) -> Self {
        ForestAdr(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// High 16 bits. For multicast addresses this includes the group bit.
    pub const fn zip(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn local(self) -> u16 {
        self.0 as u16
    }

    pub const fn is_multicast(self) -> bool {
        self.0 & MCAST_BIT != 0
    }

    /// True for a syntactically valid unicast address: high bit clear,
    /// non-zero zip.
    pub const fn valid_ucast(self) -> bool {
        !self.is_multicast() && self.zip() != 0
    }

    /// True if this address names a router (valid unicast, local part zero).
    pub const fn is_router(self) -> bool {
        self.valid_ucast() && self.local() == 0
    }

    /// True if this address names a leaf (valid unicast, non-zero local).
    pub const fn is_leaf(self) -> bool {
        self.valid_ucast() && self.local() != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The router address governing this unicast address's zip.
    pub const fn zip_router(self) -> ForestAdr {
        ForestAdr::router(self.zip())
    }
}

impl fmt::Display for ForestAdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_multicast() {
            write!(f, "&{}", self.0 & !MCAST_BIT)
        } else {
            write!(f, "{}.{}", self.zip(), self.local())
        }
    }
}

impl fmt::Debug for ForestAdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForestAdr({})", self)
    }
}

impl FromStr for ForestAdr {
    type Err = BadAddress;

    /// Parse `zip.local` unicast or `&group` multicast notation.
    fn from_str(s: &str) -> Result<Self, BadAddress> {
        if let Some(group) = s.strip_prefix('&') {
            let g: u32 = group.parse().map_err(|_| BadAddress(s.to_string()))?;
            if g & MCAST_BIT != 0 {
                return Err(BadAddress(s.to_string()));
            }
            return Ok(ForestAdr::mcast(g));
        }
        let (zip, local) = s.split_once('.').ok_or_else(|| BadAddress(s.to_string()))?;
        let zip: u16 = zip.parse().map_err(|_| BadAddress(s.to_string()))?;
        let local: u16 = local.parse().map_err(|_| BadAddress(s.to_string()))?;
        if zip & 0x8000 != 0 {
            return Err(BadAddress(s.to_string()));
        }
        Ok(ForestAdr::new(zip, local))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed forest address {0:?}")]
pub struct BadAddress(pub String);

/// What sits at the far end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    Router,
    Leaf,
    Controller,
}

impl PeerType {
    pub const fn code(self) -> u32 {
        match self {
            PeerType::Router => 1,
            PeerType::Leaf => 2,
            PeerType::Controller => 3,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(PeerType::Router),
            2 => Some(PeerType::Leaf),
            3 => Some(PeerType::Controller),
            _ => None,
        }
    }

    pub const fn is_router(self) -> bool {
        matches!(self, PeerType::Router)
    }
}
