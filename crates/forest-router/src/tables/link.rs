//! Link table.
//!
//! A link is the router's side of one peer relationship: the interface it
//! is homed on, the peer's (ip, port) endpoint once known, the peer's
//! forest address, a rate budget carved out of the interface, and the
//! nonce that binds the first CONNECT datagram to a pre-provisioned slot.
//!
//! Three auxiliary indexes answer the data-plane lookups: by endpoint
//! (every arriving datagram), by peer forest address (leaves only), and by
//! nonce (only until the link connects).
//!
//! The table also owns the router's leaf address allocator: a range of
//! local addresses in the router's own zip handed out to leaf peers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddrV4;

use forest_proto::addr::{ForestAdr, PeerType};
use forest_proto::rate::RateSpec;

use crate::error::CtlError;

pub const MAX_LINK: u32 = 4095;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub iface: u32,
    /// Peer endpoint; `None` until the CONNECT handshake binds it.
    pub peer: Option<SocketAddrV4>,
    pub peer_type: PeerType,
    pub peer_adr: ForestAdr,
    pub rates: RateSpec,
    /// Budget still available to comtree-links over this link.
    pub avail: RateSpec,
    pub nonce: u64,
    pub connected: bool,
}

#[derive(Debug)]
pub struct LinkTable {
    my_adr: ForestAdr,
    entries: BTreeMap<u32, LinkEntry>,
    by_ep: HashMap<SocketAddrV4, u32>,
    by_adr: HashMap<ForestAdr, u32>,
    by_nonce: HashMap<u64, u32>,
    // leaf address allocator
    leaf_first: u16,
    leaf_last: u16,
    free_leaves: BTreeSet<u16>,
}

impl LinkTable {
    pub fn new(my_adr: ForestAdr) -> Self {
        LinkTable {
            my_adr,
            entries: BTreeMap::new(),
            by_ep: HashMap::new(),
            by_adr: HashMap::new(),
            by_nonce: HashMap::new(),
            leaf_first: 0,
            leaf_last: 0,
            free_leaves: BTreeSet::new(),
        }
    }

    /// Add a link. `link == 0` asks the table to pick the first free
    /// number. Exactly one of the endpoint or the nonce must identify the
    /// peer to its first CONNECT; both indexes are checked for conflicts.
    /// New links start at minimum rates, disconnected.
    pub fn add(
        &mut self,
        link: u32,
        iface: u32,
        peer: Option<SocketAddrV4>,
        peer_type: PeerType,
        nonce: u64,
    ) -> Result<u32, CtlError> {
        if peer.is_none() && nonce == 0 {
            return Err(CtlError::InvalidParameter(
                "link needs a peer endpoint or a nonce".into(),
            ));
        }
        let link = if link == 0 {
            self.first_free_link()
                .ok_or_else(|| CtlError::NoCapacity("link table is full".into()))?
        } else if link > MAX_LINK {
            return Err(CtlError::InvalidParameter(format!("link number {link} out of range")));
        } else {
            link
        };
        if self.entries.contains_key(&link) {
            return Err(CtlError::Duplicate(format!(
                "new link conflicts with existing link {link}"
            )));
        }
        if let Some(ep) = peer {
            if self.by_ep.contains_key(&ep) {
                return Err(CtlError::Duplicate(format!(
                    "new link conflicts with existing link to {ep}"
                )));
            }
        }
        if nonce != 0 && self.by_nonce.contains_key(&nonce) {
            return Err(CtlError::Duplicate("nonce already in use".into()));
        }
        let min = RateSpec::minimum();
        self.entries.insert(
            link,
            LinkEntry {
                iface,
                peer,
                peer_type,
                peer_adr: ForestAdr::NONE,
                rates: min,
                avail: min,
                nonce,
                connected: false,
            },
        );
        if let Some(ep) = peer {
            self.by_ep.insert(ep, link);
        }
        if nonce != 0 {
            self.by_nonce.insert(nonce, link);
        }
        Ok(link)
    }

    fn first_free_link(&self) -> Option<u32> {
        (1..=MAX_LINK).find(|l| !self.entries.contains_key(l))
    }

    /// Set the peer's forest address, maintaining the leaf index.
    /// Fails on a conflict with another link's peer address.
    pub fn set_peer_adr(&mut self, link: u32, adr: ForestAdr) -> Result<(), CtlError> {
        let entry = self
            .entries
            .get_mut(&link)
            .ok_or_else(|| CtlError::NotFound(format!("invalid link {link}")))?;
        if let Some(&other) = self.by_adr.get(&adr) {
            if other != link {
                return Err(CtlError::Duplicate(format!(
                    "peer address {adr} already assigned to link {other}"
                )));
            }
        }
        if !entry.peer_adr.is_none() {
            self.by_adr.remove(&entry.peer_adr);
        }
        entry.peer_adr = adr;
        if !adr.is_none() {
            self.by_adr.insert(adr, link);
        }
        Ok(())
    }

    /// Bind the endpoint learned from the first CONNECT datagram and mark
    /// the link connected.
    pub fn bind_endpoint(&mut self, link: u32, ep: SocketAddrV4) -> Result<(), CtlError> {
        if let Some(&other) = self.by_ep.get(&ep) {
            if other != link {
                return Err(CtlError::Duplicate(format!(
                    "endpoint {ep} already bound to link {other}"
                )));
            }
        }
        let entry = self
            .entries
            .get_mut(&link)
            .ok_or_else(|| CtlError::NotFound(format!("invalid link {link}")))?;
        if let Some(old) = entry.peer {
            self.by_ep.remove(&old);
        }
        entry.peer = Some(ep);
        entry.connected = true;
        self.by_ep.insert(ep, link);
        Ok(())
    }

    pub fn remove(&mut self, link: u32) -> Option<LinkEntry> {
        let entry = self.entries.remove(&link)?;
        if let Some(ep) = entry.peer {
            self.by_ep.remove(&ep);
        }
        if !entry.peer_adr.is_none() {
            self.by_adr.remove(&entry.peer_adr);
        }
        if entry.nonce != 0 {
            self.by_nonce.remove(&entry.nonce);
        }
        self.free_leaf_adr(entry.peer_adr);
        Some(entry)
    }

    pub fn contains(&self, link: u32) -> bool {
        self.entries.contains_key(&link)
    }

    pub fn get(&self, link: u32) -> Option<&LinkEntry> {
        self.entries.get(&link)
    }

    pub fn get_mut(&mut self, link: u32) -> Option<&mut LinkEntry> {
        self.entries.get_mut(&link)
    }

    pub fn lookup_ep(&self, ep: SocketAddrV4) -> Option<u32> {
        self.by_ep.get(&ep).copied()
    }

    pub fn lookup_adr(&self, adr: ForestAdr) -> Option<u32> {
        self.by_adr.get(&adr).copied()
    }

    pub fn lookup_nonce(&self, nonce: u64) -> Option<u32> {
        self.by_nonce.get(&nonce).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &LinkEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Page of entries starting at `from` (0 means the first); see
    /// [`crate::tables::iface::IfaceTable::page`].
    pub fn page(&self, from: u32, count: usize) -> (Vec<(u32, LinkEntry)>, u32) {
        let mut out = Vec::with_capacity(count);
        let mut it = self.entries.range(from.max(1)..);
        for (id, e) in it.by_ref().take(count) {
            out.push((*id, e.clone()));
        }
        let next = it.next().map(|(id, _)| *id).unwrap_or(0);
        (out, next)
    }

    // ─── Leaf address allocation ────────────────────────────────────────

    /// Configure the leaf address range. Only the local parts are given;
    /// leaves always live in the router's own zip.
    pub fn set_leaf_range(&mut self, first: u16, last: u16) -> Result<(), CtlError> {
        if first == 0 || first > last {
            return Err(CtlError::InvalidParameter(format!(
                "bad leaf address range {first}..{last}"
            )));
        }
        self.leaf_first = first;
        self.leaf_last = last;
        self.free_leaves = (first..=last).collect();
        for entry in self.entries.values() {
            let adr = entry.peer_adr;
            if adr.is_leaf() && adr.zip() == self.my_adr.zip() {
                self.free_leaves.remove(&adr.local());
            }
        }
        Ok(())
    }

    pub fn leaf_range(&self) -> (u16, u16) {
        (self.leaf_first, self.leaf_last)
    }

    /// Allocate the next free leaf address in the router's range.
    pub fn alloc_leaf_adr(&mut self) -> Option<ForestAdr> {
        let local = *self.free_leaves.iter().next()?;
        self.free_leaves.remove(&local);
        Some(ForestAdr::new(self.my_adr.zip(), local))
    }

    /// Claim a specific leaf address; fails when outside the range or
    /// already taken.
    pub fn alloc_leaf_adr_specific(&mut self, adr: ForestAdr) -> bool {
        adr.zip() == self.my_adr.zip() && self.free_leaves.remove(&adr.local())
    }

    /// Return a leaf address to the pool. Addresses outside the range are
    /// ignored.
    pub fn free_leaf_adr(&mut self, adr: ForestAdr) {
        let local = adr.local();
        if adr.is_leaf()
            && adr.zip() == self.my_adr.zip()
            && (self.leaf_first..=self.leaf_last).contains(&local)
        {
            self.free_leaves.insert(local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(std::net::Ipv4Addr::new(10, 0, 0, last), port)
    }

    fn table() -> LinkTable {
        let mut lt = LinkTable::new(ForestAdr::router(2));
        lt.set_leaf_range(100, 109).unwrap();
        lt
    }

    #[test]
    fn add_auto_assigns_ids() {
        let mut lt = table();
        let a = lt.add(0, 1, Some(ep(2, 30001)), PeerType::Leaf, 0).unwrap();
        let b = lt.add(0, 1, None, PeerType::Leaf, 0xBEEF).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(lt.lookup_ep(ep(2, 30001)), Some(1));
        assert_eq!(lt.lookup_nonce(0xBEEF), Some(2));
    }

    #[test]
    fn conflicts_rejected() {
        let mut lt = table();
        lt.add(1, 1, Some(ep(2, 30001)), PeerType::Leaf, 0).unwrap();
        assert!(matches!(
            lt.add(1, 1, Some(ep(3, 30001)), PeerType::Leaf, 0),
            Err(CtlError::Duplicate(_))
        ));
        assert!(matches!(
            lt.add(0, 1, Some(ep(2, 30001)), PeerType::Leaf, 0),
            Err(CtlError::Duplicate(_))
        ));
        lt.add(0, 1, None, PeerType::Leaf, 77).unwrap();
        assert!(matches!(
            lt.add(0, 1, None, PeerType::Leaf, 77),
            Err(CtlError::Duplicate(_))
        ));
        assert!(matches!(
            lt.add(0, 1, None, PeerType::Leaf, 0),
            Err(CtlError::InvalidParameter(_))
        ));
    }

    #[test]
    fn peer_adr_index_unique_for_leaves() {
        let mut lt = table();
        let a = lt.add(0, 1, Some(ep(2, 1)), PeerType::Leaf, 0).unwrap();
        let b = lt.add(0, 1, Some(ep(3, 1)), PeerType::Leaf, 0).unwrap();
        lt.set_peer_adr(a, ForestAdr::new(2, 100)).unwrap();
        assert!(matches!(
            lt.set_peer_adr(b, ForestAdr::new(2, 100)),
            Err(CtlError::Duplicate(_))
        ));
        assert_eq!(lt.lookup_adr(ForestAdr::new(2, 100)), Some(a));
    }

    #[test]
    fn nonce_connect_binding() {
        let mut lt = table();
        let l = lt.add(0, 1, None, PeerType::Leaf, 0xDEAD).unwrap();
        assert_eq!(lt.lookup_nonce(0xDEAD), Some(l));
        lt.bind_endpoint(l, ep(9, 40000)).unwrap();
        let e = lt.get(l).unwrap();
        assert!(e.connected);
        assert_eq!(e.peer, Some(ep(9, 40000)));
        assert_eq!(lt.lookup_ep(ep(9, 40000)), Some(l));
    }

    #[test]
    fn remove_clears_all_indexes_and_frees_leaf() {
        let mut lt = table();
        let l = lt.add(0, 1, Some(ep(2, 1)), PeerType::Leaf, 0x42).unwrap();
        let adr = lt.alloc_leaf_adr().unwrap();
        lt.set_peer_adr(l, adr).unwrap();
        lt.remove(l).unwrap();
        assert_eq!(lt.lookup_ep(ep(2, 1)), None);
        assert_eq!(lt.lookup_adr(adr), None);
        assert_eq!(lt.lookup_nonce(0x42), None);
        // the address is available again
        assert_eq!(lt.alloc_leaf_adr(), Some(adr));
    }

    #[test]
    fn leaf_allocator_walks_range() {
        let mut lt = table();
        assert_eq!(lt.alloc_leaf_adr(), Some(ForestAdr::new(2, 100)));
        assert_eq!(lt.alloc_leaf_adr(), Some(ForestAdr::new(2, 101)));
        assert!(lt.alloc_leaf_adr_specific(ForestAdr::new(2, 105)));
        assert!(!lt.alloc_leaf_adr_specific(ForestAdr::new(2, 105)));
        assert!(!lt.alloc_leaf_adr_specific(ForestAdr::new(3, 106)));
        lt.free_leaf_adr(ForestAdr::new(2, 100));
        assert_eq!(lt.alloc_leaf_adr(), Some(ForestAdr::new(2, 100)));
    }

    #[test]
    fn exhausted_leaf_range() {
        let mut lt = LinkTable::new(ForestAdr::router(2));
        lt.set_leaf_range(5, 5).unwrap();
        assert_eq!(lt.alloc_leaf_adr(), Some(ForestAdr::new(2, 5)));
        assert_eq!(lt.alloc_leaf_adr(), None);
        assert!(matches!(lt.set_leaf_range(9, 3), Err(CtlError::InvalidParameter(_))));
    }
}
