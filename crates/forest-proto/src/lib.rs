//! # forest-proto
//!
//! Wire-level types for the Forest overlay network.
//!
//! Forest routers forward fixed-header packets inside user-defined
//! distribution trees (comtrees). This crate holds everything both a
//! router and a remote controller must agree on:
//!
//! - [`addr`] — 32-bit forest addresses (zip/local split, multicast bit)
//! - [`rate`] — four-component rate specs with componentwise arithmetic
//! - [`wire`] — the 20-byte packet header and its checksums
//! - [`ctl`] — the control-packet payload codec (type, mode, seq, attributes)
//! - [`pool`] — the slab packet store with refcounted payload sharing

pub mod addr;
pub mod ctl;
pub mod pool;
pub mod rate;
pub mod wire;

pub use addr::{ForestAdr, PeerType};
pub use ctl::{CtlAttr, CtlMode, CtlPkt, CtlType};
pub use pool::{Packet, PacketStore, PktHandle};
pub use rate::RateSpec;
pub use wire::{PacketHeader, PktType};
