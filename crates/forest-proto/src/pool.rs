//! # Packet Store
//!
//! A bounded pool of packet records. Each record pairs a decoded header
//! with a payload buffer; cloning a record for multicast copies only the
//! header metadata while the payload `Bytes` is shared by reference count.
//! The buffer storage is released when the last record referencing it is
//! freed.
//!
//! The store is thread-safe behind a single mutex; handles are short-lived
//! so contention stays low.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use slab::Slab;

use crate::addr::ForestAdr;
use crate::wire::{PacketHeader, PktType, OVERHEAD};

// ─── Packet ──────────────────────────────────────────────────────────────────

/// A packet record: header, shared payload, and routing annotations.
#[derive(Debug, Clone)]
pub struct Packet {
    pub hdr: PacketHeader,
    /// Payload bytes, shared between multicast clones.
    pub payload: Bytes,
    /// Tunnel endpoint: where the datagram arrived from, or where a reply
    /// must go when no link resolves the destination.
    pub tun: Option<SocketAddrV4>,
    /// Link the packet arrived on (0 = unknown).
    pub in_link: u32,
    /// Link the packet is queued for (0 = unset).
    pub out_link: u32,
}

impl Packet {
    pub fn new(hdr: PacketHeader, payload: Bytes) -> Self {
        Packet { hdr, payload, tun: None, in_link: 0, out_link: 0 }
    }

    /// Build a signalling packet around an encoded control payload.
    pub fn signal(
        typ: PktType,
        comtree: u32,
        src: ForestAdr,
        dst: ForestAdr,
        payload: Bytes,
    ) -> Self {
        Packet::new(PacketHeader::new(typ, comtree, src, dst), payload)
    }

    /// Total wire length of this packet.
    pub fn length(&self) -> usize {
        OVERHEAD + self.payload.len()
    }
}

// ─── PacketStore ─────────────────────────────────────────────────────────────

/// Handle to a record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PktHandle(usize);

/// Bounded slab of packet records.
pub struct PacketStore {
    inner: Mutex<Slab<Packet>>,
    capacity: usize,
    exhausted: AtomicU64,
}

impl PacketStore {
    pub fn new(capacity: usize) -> Self {
        PacketStore {
            inner: Mutex::new(Slab::with_capacity(capacity)),
            capacity,
            exhausted: AtomicU64::new(0),
        }
    }

    /// Insert a packet, returning a handle. `None` when the store is
    /// exhausted; the caller must drop the packet.
    pub fn alloc(&self, pkt: Packet) -> Option<PktHandle> {
        let mut slab = self.inner.lock().unwrap();
        if slab.len() >= self.capacity {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(PktHandle(slab.insert(pkt)))
    }

    /// Clone a record: header and annotations are copied, the payload is
    /// shared by reference count.
    pub fn clone_pkt(&self, h: PktHandle) -> Option<PktHandle> {
        let mut slab = self.inner.lock().unwrap();
        if slab.len() >= self.capacity {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let copy = slab.get(h.0)?.clone();
        Some(PktHandle(slab.insert(copy)))
    }

    /// Remove a record, returning it. The payload storage is released
    /// when the last clone referencing it is dropped.
    pub fn free(&self, h: PktHandle) -> Option<Packet> {
        let mut slab = self.inner.lock().unwrap();
        if slab.contains(h.0) {
            Some(slab.remove(h.0))
        } else {
            None
        }
    }

    /// Copy a record out of the store. Cheap: the payload clone only bumps
    /// a reference count.
    pub fn get(&self, h: PktHandle) -> Option<Packet> {
        self.inner.lock().unwrap().get(h.0).cloned()
    }

    /// Mutate a record in place under the store lock.
    pub fn with_mut<R>(&self, h: PktHandle, f: impl FnOnce(&mut Packet) -> R) -> Option<R> {
        self.inner.lock().unwrap().get_mut(h.0).map(f)
    }

    pub fn contains(&self, h: PktHandle) -> bool {
        self.inner.lock().unwrap().contains(h.0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many allocations have failed because the store was full.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_pkt(payload: &'static [u8]) -> Packet {
        Packet::new(
            PacketHeader::new(PktType::Data, 5, ForestAdr::new(2, 1), ForestAdr::new(2, 2)),
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn alloc_get_free() {
        let store = PacketStore::new(4);
        let h = store.alloc(data_pkt(b"hello")).unwrap();
        assert_eq!(store.len(), 1);

        let pkt = store.get(h).unwrap();
        assert_eq!(pkt.payload, &b"hello"[..]);
        assert_eq!(pkt.length(), OVERHEAD + 5);

        store.free(h).unwrap();
        assert!(store.is_empty());
        assert!(store.free(h).is_none());
    }

    #[test]
    fn capacity_limit_counts_exhaustion() {
        let store = PacketStore::new(2);
        let _a = store.alloc(data_pkt(b"a")).unwrap();
        let _b = store.alloc(data_pkt(b"b")).unwrap();
        assert!(store.alloc(data_pkt(b"c")).is_none());
        assert_eq!(store.exhausted_count(), 1);
    }

    #[test]
    fn clone_shares_payload() {
        let store = PacketStore::new(4);
        let h = store.alloc(data_pkt(b"shared")).unwrap();
        let c = store.clone_pkt(h).unwrap();
        assert_ne!(h, c);

        // same backing storage
        let p1 = store.get(h).unwrap();
        let p2 = store.get(c).unwrap();
        assert_eq!(p1.payload.as_ptr(), p2.payload.as_ptr());

        // freeing one leaves the other intact
        store.free(h).unwrap();
        assert_eq!(store.get(c).unwrap().payload, &b"shared"[..]);
    }

    #[test]
    fn clone_copies_annotations_independently() {
        let store = PacketStore::new(4);
        let h = store.alloc(data_pkt(b"x")).unwrap();
        store.with_mut(h, |p| p.in_link = 3);
        let c = store.clone_pkt(h).unwrap();
        store.with_mut(c, |p| p.out_link = 9);
        assert_eq!(store.get(h).unwrap().out_link, 0);
        assert_eq!(store.get(c).unwrap().in_link, 3);
    }

    #[test]
    fn clone_fails_when_full() {
        let store = PacketStore::new(1);
        let h = store.alloc(data_pkt(b"x")).unwrap();
        assert!(store.clone_pkt(h).is_none());
    }
}
