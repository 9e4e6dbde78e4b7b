//! Request/reply bookkeeping for the substrate.
//!
//! [`RepeatHandler`] deduplicates inbound requests: a saved copy keyed on
//! (peer, seqNum) marks a request as in progress; once the worker's reply
//! is saved over it, later retransmits of the same request are answered
//! from the copy without re-entering a worker.
//!
//! [`Repeater`] tracks outbound requests this substrate originated, so an
//! arriving reply can be routed back to the worker that asked.
//!
//! Both tables are bounded and age-evicted; entries hold packet-store
//! handles the caller must free when an entry is displaced or expires.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use quanta::Instant;

use forest_proto::addr::ForestAdr;
use forest_proto::pool::PktHandle;

/// Saved entries older than this are expired by the substrate loop.
pub const REPEAT_MAX_AGE: Duration = Duration::from_secs(20);

// ─── RepeatHandler ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SavedEntry {
    pub px: PktHandle,
    pub when: Instant,
    /// False while a worker is still processing; true once the reply copy
    /// replaced the request copy.
    pub is_reply: bool,
}

pub struct RepeatHandler {
    entries: HashMap<(u32, u64), SavedEntry>,
    order: VecDeque<(u32, u64)>,
    capacity: usize,
}

impl RepeatHandler {
    pub fn new(capacity: usize) -> Self {
        RepeatHandler {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn find(&self, peer: ForestAdr, seq: u64) -> Option<&SavedEntry> {
        self.entries.get(&(peer.raw(), seq))
    }

    /// Save a copy of a new request. When the table is full the oldest
    /// entry is displaced and its handle returned for freeing.
    pub fn save_request(
        &mut self,
        px: PktHandle,
        peer: ForestAdr,
        seq: u64,
        now: Instant,
    ) -> Option<PktHandle> {
        let mut evicted = None;
        while self.entries.len() >= self.capacity {
            match self.pop_oldest() {
                Some(old) => evicted = Some(old),
                None => break,
            }
        }
        let key = (peer.raw(), seq);
        self.entries.insert(key, SavedEntry { px, when: now, is_reply: false });
        self.order.push_back(key);
        evicted
    }

    /// Replace the saved request copy with the reply copy. Returns the
    /// displaced request handle, which the caller frees.
    pub fn save_reply(
        &mut self,
        px: PktHandle,
        peer: ForestAdr,
        seq: u64,
        now: Instant,
    ) -> Option<PktHandle> {
        let key = (peer.raw(), seq);
        match self.entries.insert(key, SavedEntry { px, when: now, is_reply: true }) {
            Some(old) => Some(old.px),
            None => {
                // reply for a request that already aged out; keep the copy
                // so late retransmits can still be answered
                self.order.push_back(key);
                None
            }
        }
    }

    fn pop_oldest(&mut self) -> Option<PktHandle> {
        while let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                return Some(entry.px);
            }
        }
        None
    }

    /// Pop one entry older than `max_age`, if any. The substrate calls
    /// this every idle pass and frees the returned handle.
    pub fn expired(&mut self, now: Instant, max_age: Duration) -> Option<PktHandle> {
        loop {
            let key = *self.order.front()?;
            match self.entries.get(&key) {
                Some(entry) => {
                    if now.saturating_duration_since(entry.when) <= max_age {
                        return None;
                    }
                    self.order.pop_front();
                    return self.entries.remove(&key).map(|e| e.px);
                }
                None => {
                    // stale order slot for a displaced entry
                    self.order.pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Repeater ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct OutEntry {
    px: PktHandle,
    peer: u32,
    thx: usize,
    when: Instant,
}

/// Outstanding requests this substrate sent, keyed by sequence number.
#[derive(Default)]
pub struct Repeater {
    entries: HashMap<u64, OutEntry>,
    order: VecDeque<u64>,
}

impl Repeater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&mut self, seq: u64, px: PktHandle, peer: ForestAdr, thx: usize, now: Instant) {
        self.entries.insert(seq, OutEntry { px, peer: peer.raw(), thx, when: now });
        self.order.push_back(seq);
    }

    /// Match an arriving reply. Returns the saved request handle and the
    /// worker index that originated the request.
    pub fn delete_match(&mut self, peer: ForestAdr, seq: u64) -> Option<(PktHandle, usize)> {
        match self.entries.get(&seq) {
            Some(entry) if entry.peer == peer.raw() => {
                let entry = self.entries.remove(&seq)?;
                Some((entry.px, entry.thx))
            }
            _ => None,
        }
    }

    pub fn expired(&mut self, now: Instant, max_age: Duration) -> Option<PktHandle> {
        loop {
            let seq = *self.order.front()?;
            match self.entries.get(&seq) {
                Some(entry) => {
                    if now.saturating_duration_since(entry.when) <= max_age {
                        return None;
                    }
                    self.order.pop_front();
                    return self.entries.remove(&seq).map(|e| e.px);
                }
                None => {
                    self.order.pop_front();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;

    fn h() -> PktHandle {
        // fabricate distinct handles through a real store
        thread_local! {
            static STORE: forest_proto::pool::PacketStore =
                forest_proto::pool::PacketStore::new(4096);
        }
        use forest_proto::addr::ForestAdr;
        use forest_proto::wire::{PacketHeader, PktType};
        STORE.with(|s| {
            s.alloc(forest_proto::pool::Packet::new(
                PacketHeader::new(PktType::NetSig, 1, ForestAdr::new(1, 1), ForestAdr::new(1, 2)),
                bytes::Bytes::new(),
            ))
            .unwrap()
        })
    }

    #[test]
    fn request_then_reply_lifecycle() {
        let (clock, _mock) = Clock::mock();
        let peer = forest_proto::addr::ForestAdr::new(2, 100);
        let mut reph = RepeatHandler::new(8);

        let req = h();
        assert!(reph.save_request(req, peer, 42, clock.now()).is_none());
        let saved = reph.find(peer, 42).unwrap();
        assert!(!saved.is_reply);

        let rep = h();
        let displaced = reph.save_reply(rep, peer, 42, clock.now());
        assert_eq!(displaced, Some(req));
        let saved = reph.find(peer, 42).unwrap();
        assert!(saved.is_reply);
        assert_eq!(saved.px, rep);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let (clock, _mock) = Clock::mock();
        let peer = forest_proto::addr::ForestAdr::new(2, 100);
        let mut reph = RepeatHandler::new(2);

        let a = h();
        let b = h();
        let c = h();
        assert!(reph.save_request(a, peer, 1, clock.now()).is_none());
        assert!(reph.save_request(b, peer, 2, clock.now()).is_none());
        assert_eq!(reph.save_request(c, peer, 3, clock.now()), Some(a));
        assert!(reph.find(peer, 1).is_none());
        assert!(reph.find(peer, 2).is_some());
    }

    #[test]
    fn aged_entries_expire_in_order() {
        let (clock, mock) = Clock::mock();
        let peer = forest_proto::addr::ForestAdr::new(2, 100);
        let mut reph = RepeatHandler::new(8);

        let a = h();
        reph.save_request(a, peer, 1, clock.now());
        mock.increment(Duration::from_secs(5));
        let b = h();
        reph.save_request(b, peer, 2, clock.now());

        mock.increment(Duration::from_secs(16));
        // first entry is now 21 s old, second 16 s
        assert_eq!(reph.expired(clock.now(), REPEAT_MAX_AGE), Some(a));
        assert_eq!(reph.expired(clock.now(), REPEAT_MAX_AGE), None);
        mock.increment(Duration::from_secs(5));
        assert_eq!(reph.expired(clock.now(), REPEAT_MAX_AGE), Some(b));
        assert!(reph.is_empty());
    }

    #[test]
    fn repeater_routes_reply_to_worker() {
        let (clock, _mock) = Clock::mock();
        let peer = forest_proto::addr::ForestAdr::router(3);
        let other = forest_proto::addr::ForestAdr::router(4);
        let mut rptr = Repeater::new();

        let px = h();
        rptr.save(7, px, peer, 2, clock.now());
        // wrong peer does not match
        assert!(rptr.delete_match(other, 7).is_none());
        assert_eq!(rptr.delete_match(peer, 7), Some((px, 2)));
        // second delivery finds nothing
        assert!(rptr.delete_match(peer, 7).is_none());
    }
}
