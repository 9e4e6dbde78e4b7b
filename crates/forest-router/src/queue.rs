//! # Queue Manager
//!
//! Per-link packet queues with rate-limited scheduling. Every comtree-link
//! owns one queue bound to its link. A queue is drained FIFO; departures
//! are spaced by a leaky bucket derived from the queue's bit rate and a
//! minimum inter-packet gap from its packet rate. Across the queues of one
//! link the scheduler runs weighted round-robin: the eligibility clocks
//! carry the weights (a queue with twice the bit rate becomes eligible
//! twice as often) and ties break by ascending queue id from a rotating
//! cursor, so every eligible queue is visited within one rotation.
//!
//! Enqueues that would exceed a queue's byte or packet limit drop the
//! packet; the caller counts the drop. Freeing a queue hands back any
//! packets still buffered so the caller can return them to the store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use quanta::{Clock, Instant};
use serde::Serialize;
use slab::Slab;

use forest_proto::pool::PktHandle;
use forest_proto::rate::{RateSpec, MIN_BITRATE, MIN_PKTRATE};

use crate::error::CtlError;

/// Queues a single link may own.
pub const MAX_QUEUES_PER_LINK: usize = 32;

const DEFAULT_BYTE_LIMIT: usize = 1_000_000;
const DEFAULT_PKT_LIMIT: usize = 500;

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqError {
    QueueFull,
    NoQueue,
}

#[derive(Debug)]
struct Queue {
    link: u32,
    rates: RateSpec,
    byte_limit: usize,
    pkt_limit: usize,
    byte_cnt: usize,
    buf: VecDeque<(PktHandle, usize)>,
    next_bit: Instant,
    next_pkt: Instant,
    drops: u64,
}

impl Queue {
    fn eligible_at(&self) -> Instant {
        self.next_bit.max(self.next_pkt)
    }
}

#[derive(Debug)]
struct LinkSched {
    qids: BTreeSet<u32>,
    /// Last queue served; the next scan starts just after it.
    cursor: u32,
    rates: RateSpec,
    next_bit: Instant,
}

struct QmInner {
    queues: Slab<Queue>,
    links: BTreeMap<u32, LinkSched>,
    last_link: u32,
}

/// Spacing to the next departure for `len` bytes at `kbps`.
fn bit_gap(len: usize, kbps: i32) -> Duration {
    let kbps = kbps.max(MIN_BITRATE) as u64;
    Duration::from_nanos(len as u64 * 8_000_000 / kbps)
}

/// Minimum inter-packet gap at `pps` packets per second.
fn pkt_gap(pps: i32) -> Duration {
    let pps = pps.max(MIN_PKTRATE) as u64;
    Duration::from_nanos(1_000_000_000 / pps)
}

pub struct QueueManager {
    inner: Mutex<QmInner>,
    ready: Condvar,
    clock: Clock,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Self {
        QueueManager {
            inner: Mutex::new(QmInner {
                queues: Slab::new(),
                links: BTreeMap::new(),
                last_link: 0,
            }),
            ready: Condvar::new(),
            clock,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Allocate a queue bound to `link`. Fails when the link already owns
    /// [`MAX_QUEUES_PER_LINK`] queues.
    pub fn alloc_queue(&self, link: u32) -> Result<u32, CtlError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let sched = inner.links.entry(link).or_insert_with(|| LinkSched {
            qids: BTreeSet::new(),
            cursor: 0,
            rates: RateSpec::minimum(),
            next_bit: now,
        });
        if sched.qids.len() >= MAX_QUEUES_PER_LINK {
            return Err(CtlError::QueueAlloc(format!("no free queue for link {link}")));
        }
        let key = inner.queues.insert(Queue {
            link,
            rates: RateSpec::minimum(),
            byte_limit: DEFAULT_BYTE_LIMIT,
            pkt_limit: DEFAULT_PKT_LIMIT,
            byte_cnt: 0,
            buf: VecDeque::new(),
            next_bit: now,
            next_pkt: now,
            drops: 0,
        });
        let qid = key as u32 + 1;
        if let Some(sched) = inner.links.get_mut(&link) {
            sched.qids.insert(qid);
        }
        Ok(qid)
    }

    /// Release a queue, returning any packets still buffered.
    pub fn free_queue(&self, qid: u32) -> Vec<PktHandle> {
        let mut inner = self.inner.lock().unwrap();
        let key = qid as usize - 1;
        if !inner.queues.contains(key) {
            return Vec::new();
        }
        let q = inner.queues.remove(key);
        let link_empty = match inner.links.get_mut(&q.link) {
            Some(sched) => {
                sched.qids.remove(&qid);
                sched.qids.is_empty()
            }
            None => false,
        };
        if link_empty {
            inner.links.remove(&q.link);
        }
        q.buf.into_iter().map(|(h, _)| h).collect()
    }

    pub fn set_queue_rates(&self, qid: u32, rates: RateSpec) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(q) = inner.queues.get_mut(qid as usize - 1) {
            q.rates = rates;
        }
    }

    pub fn set_queue_limits(&self, qid: u32, byte_limit: usize, pkt_limit: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(q) = inner.queues.get_mut(qid as usize - 1) {
            q.byte_limit = byte_limit;
            q.pkt_limit = pkt_limit;
        }
    }

    pub fn set_link_rates(&self, link: u32, rates: RateSpec) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let sched = inner.links.entry(link).or_insert_with(|| LinkSched {
            qids: BTreeSet::new(),
            cursor: 0,
            rates: RateSpec::minimum(),
            next_bit: now,
        });
        sched.rates = rates;
    }

    /// Link a queue is bound to, if it exists.
    pub fn queue_link(&self, qid: u32) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(qid as usize - 1).map(|q| q.link)
    }

    pub fn queue_count(&self) -> usize {
        self.inner.lock().unwrap().queues.len()
    }

    /// Append a packet of `len` wire bytes to a queue.
    pub fn enq(&self, qid: u32, handle: PktHandle, len: usize) -> Result<(), EnqError> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner
            .queues
            .get_mut(qid as usize - 1)
            .ok_or(EnqError::NoQueue)?;
        if q.buf.len() >= q.pkt_limit || q.byte_cnt + len > q.byte_limit {
            q.drops += 1;
            return Err(EnqError::QueueFull);
        }
        q.buf.push_back((handle, len));
        q.byte_cnt += len;
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Dequeue the next eligible packet from a specific link at time
    /// `now`, advancing the eligibility clocks.
    pub fn deq_link(&self, link: u32, now: Instant) -> Option<(u32, PktHandle)> {
        let mut inner = self.inner.lock().unwrap();
        Self::pick_from_link(&mut inner, link, now)
    }

    /// Dequeue the next eligible packet from any link.
    pub fn deq(&self, now: Instant) -> Option<(u32, u32, PktHandle)> {
        let mut inner = self.inner.lock().unwrap();
        Self::pick(&mut inner, now)
    }

    /// Block until a packet is eligible or `timeout` elapses.
    pub fn deq_timeout(&self, timeout: Duration) -> Option<(u32, u32, PktHandle)> {
        let deadline = self.clock.now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            let now = self.clock.now();
            if let Some(out) = Self::pick(&mut inner, now) {
                return Some(out);
            }
            if now >= deadline {
                return None;
            }
            let mut wait = deadline.saturating_duration_since(now);
            if let Some(at) = Self::earliest(&inner) {
                wait = wait.min(at.saturating_duration_since(now).max(Duration::from_micros(50)));
            }
            let (guard, _) = self.ready.wait_timeout(inner, wait).unwrap();
            inner = guard;
        }
    }

    fn pick(inner: &mut QmInner, now: Instant) -> Option<(u32, u32, PktHandle)> {
        let links: Vec<u32> = inner.links.keys().copied().collect();
        if links.is_empty() {
            return None;
        }
        let start = links
            .iter()
            .position(|&l| l > inner.last_link)
            .unwrap_or(0);
        for i in 0..links.len() {
            let link = links[(start + i) % links.len()];
            if let Some((qid, handle)) = Self::pick_from_link(inner, link, now) {
                inner.last_link = link;
                return Some((link, qid, handle));
            }
        }
        None
    }

    fn pick_from_link(inner: &mut QmInner, link: u32, now: Instant) -> Option<(u32, PktHandle)> {
        let sched = inner.links.get(&link)?;
        if sched.next_bit > now {
            return None;
        }
        // round-robin over the link's queues, starting after the cursor
        let qids: Vec<u32> = sched
            .qids
            .range(sched.cursor + 1..)
            .chain(sched.qids.range(..=sched.cursor))
            .copied()
            .collect();
        for qid in qids {
            let q = match inner.queues.get_mut(qid as usize - 1) {
                Some(q) => q,
                None => continue,
            };
            if q.buf.is_empty() || q.eligible_at() > now {
                continue;
            }
            let (handle, len) = match q.buf.pop_front() {
                Some(x) => x,
                None => continue,
            };
            q.byte_cnt -= len;
            q.next_bit = now + bit_gap(len, q.rates.bit_down);
            q.next_pkt = now + pkt_gap(q.rates.pkt_down);
            if let Some(sched) = inner.links.get_mut(&link) {
                sched.cursor = qid;
                sched.next_bit = now + bit_gap(len, sched.rates.bit_down);
            }
            return Some((qid, handle));
        }
        None
    }

    /// Earliest instant at which some buffered packet becomes eligible.
    fn earliest(inner: &QmInner) -> Option<Instant> {
        let mut best: Option<Instant> = None;
        for (_, q) in inner.queues.iter() {
            if q.buf.is_empty() {
                continue;
            }
            let mut at = q.eligible_at();
            if let Some(sched) = inner.links.get(&q.link) {
                at = at.max(sched.next_bit);
            }
            best = Some(match best {
                Some(b) => b.min(at),
                None => at,
            });
        }
        best
    }

    pub fn stats(&self) -> Vec<QueueStatsSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .iter()
            .map(|(key, q)| QueueStatsSnapshot {
                qid: key as u32 + 1,
                link: q.link,
                pkts: q.buf.len(),
                bytes: q.byte_cnt,
                drops: q.drops,
            })
            .collect()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsSnapshot {
    pub qid: u32,
    pub link: u32,
    pub pkts: usize,
    pub bytes: usize,
    pub drops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_store() -> forest_proto::pool::PacketStore {
        forest_proto::pool::PacketStore::new(256)
    }

    fn pkt(store: &forest_proto::pool::PacketStore) -> PktHandle {
        use forest_proto::addr::ForestAdr;
        use forest_proto::wire::{PacketHeader, PktType};
        store
            .alloc(forest_proto::pool::Packet::new(
                PacketHeader::new(PktType::Data, 5, ForestAdr::new(2, 1), ForestAdr::new(2, 2)),
                bytes::Bytes::from_static(&[0u8; 20]),
            ))
            .unwrap()
    }

    fn mock_qm() -> (QueueManager, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (QueueManager::with_clock(clock), mock)
    }

    #[test]
    fn fifo_within_queue() {
        let (qm, mock) = mock_qm();
        let store = handle_store();
        let q = qm.alloc_queue(1).unwrap();
        qm.set_queue_rates(q, RateSpec::uniform(1000));

        let a = pkt(&store);
        let b = pkt(&store);
        qm.enq(q, a, 40).unwrap();
        qm.enq(q, b, 40).unwrap();

        let now = qm.now();
        assert_eq!(qm.deq_link(1, now), Some((q, a)));
        // second departure waits for the leaky bucket
        assert_eq!(qm.deq_link(1, now), None);
        mock.increment(Duration::from_secs(1));
        assert_eq!(qm.deq_link(1, qm.now()), Some((q, b)));
    }

    #[test]
    fn limits_drop_with_queue_full() {
        let (qm, _mock) = mock_qm();
        let store = handle_store();
        let q = qm.alloc_queue(1).unwrap();
        qm.set_queue_limits(q, 100, 2);

        qm.enq(q, pkt(&store), 40).unwrap();
        qm.enq(q, pkt(&store), 40).unwrap();
        // packet limit
        assert_eq!(qm.enq(q, pkt(&store), 10), Err(EnqError::QueueFull));

        let q2 = qm.alloc_queue(1).unwrap();
        qm.set_queue_limits(q2, 50, 10);
        qm.enq(q2, pkt(&store), 40).unwrap();
        // byte limit
        assert_eq!(qm.enq(q2, pkt(&store), 20), Err(EnqError::QueueFull));
        assert_eq!(qm.enq(99, pkt(&store), 20), Err(EnqError::NoQueue));

        let drops: u64 = qm.stats().iter().map(|s| s.drops).sum();
        assert_eq!(drops, 2);
    }

    #[test]
    fn round_robin_across_link_queues() {
        let (qm, mock) = mock_qm();
        let store = handle_store();
        let qa = qm.alloc_queue(1).unwrap();
        let qb = qm.alloc_queue(1).unwrap();
        qm.set_link_rates(1, RateSpec::uniform(100_000));
        for q in [qa, qb] {
            qm.set_queue_rates(q, RateSpec::uniform(100_000));
        }

        qm.enq(qa, pkt(&store), 40).unwrap();
        qm.enq(qa, pkt(&store), 40).unwrap();
        qm.enq(qb, pkt(&store), 40).unwrap();
        qm.enq(qb, pkt(&store), 40).unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            mock.increment(Duration::from_millis(50));
            let (qid, _h) = qm.deq_link(1, qm.now()).unwrap();
            order.push(qid);
        }
        // both queues eligible each round: service alternates
        assert_eq!(order, vec![qa, qb, qa, qb]);
    }

    #[test]
    fn higher_rate_queue_gets_proportional_share() {
        let (qm, mock) = mock_qm();
        let store = handle_store();
        let fast = qm.alloc_queue(1).unwrap();
        let slow = qm.alloc_queue(1).unwrap();
        qm.set_link_rates(1, RateSpec::uniform(1_000_000));
        // 1000-byte packets: fast drains one per ms, slow one per 10 ms
        qm.set_queue_rates(fast, RateSpec::uniform(8_000));
        qm.set_queue_rates(slow, RateSpec::uniform(800));
        for _ in 0..120 {
            qm.enq(fast, pkt(&store), 1000).unwrap();
        }
        for _ in 0..20 {
            qm.enq(slow, pkt(&store), 1000).unwrap();
        }

        let mut fast_served = 0;
        let mut slow_served = 0;
        for _ in 0..100 {
            mock.increment(Duration::from_millis(1));
            while let Some((qid, _)) = qm.deq_link(1, qm.now()) {
                if qid == fast {
                    fast_served += 1;
                } else {
                    slow_served += 1;
                }
            }
        }
        assert!(slow_served >= 5, "slow queue starved: {slow_served}");
        assert!(
            fast_served >= 5 * slow_served,
            "weighting off: fast={fast_served} slow={slow_served}"
        );
    }

    #[test]
    fn link_rate_gates_all_queues() {
        let (qm, mock) = mock_qm();
        let store = handle_store();
        let q = qm.alloc_queue(1).unwrap();
        qm.set_queue_rates(q, RateSpec::uniform(1_000_000));
        // 50 Kb/s link: one 1000-byte packet per 160 ms
        qm.set_link_rates(1, RateSpec::uniform(50));
        for _ in 0..3 {
            qm.enq(q, pkt(&store), 1000).unwrap();
        }
        assert!(qm.deq_link(1, qm.now()).is_some());
        mock.increment(Duration::from_millis(100));
        assert!(qm.deq_link(1, qm.now()).is_none());
        mock.increment(Duration::from_millis(200));
        assert!(qm.deq_link(1, qm.now()).is_some());
    }

    #[test]
    fn free_queue_returns_buffered_packets() {
        let (qm, _mock) = mock_qm();
        let store = handle_store();
        let q = qm.alloc_queue(1).unwrap();
        let a = pkt(&store);
        let b = pkt(&store);
        qm.enq(q, a, 40).unwrap();
        qm.enq(q, b, 40).unwrap();

        let orphans = qm.free_queue(q);
        assert_eq!(orphans, vec![a, b]);
        assert_eq!(qm.queue_count(), 0);
        assert_eq!(qm.enq(q, pkt(&store), 10), Err(EnqError::NoQueue));
        assert!(qm.free_queue(q).is_empty());
    }

    #[test]
    fn per_link_queue_cap() {
        let (qm, _mock) = mock_qm();
        for _ in 0..MAX_QUEUES_PER_LINK {
            qm.alloc_queue(1).unwrap();
        }
        assert!(matches!(qm.alloc_queue(1), Err(CtlError::QueueAlloc(_))));
        // other links unaffected
        qm.alloc_queue(2).unwrap();
    }

    #[test]
    fn deq_scans_all_links() {
        let (qm, _mock) = mock_qm();
        let store = handle_store();
        let q1 = qm.alloc_queue(1).unwrap();
        let q2 = qm.alloc_queue(2).unwrap();
        qm.enq(q1, pkt(&store), 40).unwrap();
        qm.enq(q2, pkt(&store), 40).unwrap();

        let now = qm.now();
        let mut links = Vec::new();
        while let Some((link, _, _)) = qm.deq(now) {
            links.push(link);
        }
        links.sort();
        assert_eq!(links, vec![1, 2]);
    }
}
