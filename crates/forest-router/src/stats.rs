//! # Router Statistics
//!
//! Per-link counters for the data plane. Drops are counted by cause and
//! never surfaced to peers. Snapshots are serde-serializable for export.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

// ─── Per-link counters ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LinkStats {
    pub pkts_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub pkts_out: AtomicU64,
    pub bytes_out: AtomicU64,
    pub drops_bad_header: AtomicU64,
    pub drops_bad_comtree: AtomicU64,
    pub drops_bad_source: AtomicU64,
    pub drops_no_route: AtomicU64,
    pub drops_queue_full: AtomicU64,
    pub drops_store_exhausted: AtomicU64,
}

impl LinkStats {
    pub fn count_in(&self, bytes: usize) {
        self.pkts_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_out(&self, bytes: usize) {
        self.pkts_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a link's counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LinkStatsSnapshot {
    pub pkts_in: u64,
    pub bytes_in: u64,
    pub pkts_out: u64,
    pub bytes_out: u64,
    pub drops_bad_header: u64,
    pub drops_bad_comtree: u64,
    pub drops_bad_source: u64,
    pub drops_no_route: u64,
    pub drops_queue_full: u64,
    pub drops_store_exhausted: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            pkts_in: self.pkts_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            pkts_out: self.pkts_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            drops_bad_header: self.drops_bad_header.load(Ordering::Relaxed),
            drops_bad_comtree: self.drops_bad_comtree.load(Ordering::Relaxed),
            drops_bad_source: self.drops_bad_source.load(Ordering::Relaxed),
            drops_no_route: self.drops_no_route.load(Ordering::Relaxed),
            drops_queue_full: self.drops_queue_full.load(Ordering::Relaxed),
            drops_store_exhausted: self.drops_store_exhausted.load(Ordering::Relaxed),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Substrate-level counters not tied to any link.
#[derive(Debug, Default)]
pub struct SubstrateStats {
    pub rx_datagrams: AtomicU64,
    pub rx_malformed: AtomicU64,
    pub requests_in: AtomicU64,
    pub replies_in: AtomicU64,
    pub repeats_suppressed: AtomicU64,
    pub replies_resent: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub unmatched_replies: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SubstrateStatsSnapshot {
    pub rx_datagrams: u64,
    pub rx_malformed: u64,
    pub requests_in: u64,
    pub replies_in: u64,
    pub repeats_suppressed: u64,
    pub replies_resent: u64,
    pub pool_exhausted: u64,
    pub unmatched_replies: u64,
}

impl SubstrateStats {
    pub fn snapshot(&self) -> SubstrateStatsSnapshot {
        SubstrateStatsSnapshot {
            rx_datagrams: self.rx_datagrams.load(Ordering::Relaxed),
            rx_malformed: self.rx_malformed.load(Ordering::Relaxed),
            requests_in: self.requests_in.load(Ordering::Relaxed),
            replies_in: self.replies_in.load(Ordering::Relaxed),
            repeats_suppressed: self.repeats_suppressed.load(Ordering::Relaxed),
            replies_resent: self.replies_resent.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            unmatched_replies: self.unmatched_replies.load(Ordering::Relaxed),
        }
    }
}

/// Owns the per-link counter blocks. Links get a block lazily on first
/// touch; dropping a link clears its counters.
#[derive(Default)]
pub struct StatsRegistry {
    links: Mutex<BTreeMap<u32, Arc<LinkStats>>>,
    pub substrate: SubstrateStats,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter block for a link, created on demand. Link 0 collects
    /// packets that never resolved to a link.
    pub fn link(&self, link: u32) -> Arc<LinkStats> {
        let mut links = self.links.lock().unwrap();
        links.entry(link).or_default().clone()
    }

    pub fn clear_link(&self, link: u32) {
        self.links.lock().unwrap().remove(&link);
    }

    pub fn snapshot(&self) -> BTreeMap<u32, LinkStatsSnapshot> {
        let links = self.links.lock().unwrap();
        links.iter().map(|(id, s)| (*id, s.snapshot())).collect()
    }
}
