//! Shared router state.
//!
//! One `Router` is shared by the substrate thread, the forwarding and
//! output threads, and every control worker. Each table sits behind its
//! own mutex. Multi-table mutations must take locks in the canonical
//! order **interface → link → comtree → route**; the `lock_*` combination
//! helpers below are the only way handlers acquire more than one table,
//! so the order cannot be violated ad hoc.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use forest_proto::addr::ForestAdr;
use forest_proto::pool::PacketStore;

use crate::pktlog::PacketLog;
use crate::queue::QueueManager;
use crate::stats::StatsRegistry;
use crate::tables::{ComtreeTable, IfaceTable, LinkTable, RouteTable};

pub struct Router {
    pub my_adr: ForestAdr,
    pub store: PacketStore,
    pub ift: Mutex<IfaceTable>,
    pub lt: Mutex<LinkTable>,
    pub ctt: Mutex<ComtreeTable>,
    pub rt: Mutex<RouteTable>,
    pub qm: QueueManager,
    pub stats: StatsRegistry,
    pub pktlog: PacketLog,
    seq: AtomicU64,
}

impl Router {
    pub fn new(my_adr: ForestAdr, store_capacity: usize) -> Self {
        Router {
            my_adr,
            store: PacketStore::new(store_capacity),
            ift: Mutex::new(IfaceTable::new()),
            lt: Mutex::new(LinkTable::new(my_adr)),
            ctt: Mutex::new(ComtreeTable::new()),
            rt: Mutex::new(RouteTable::new(my_adr)),
            qm: QueueManager::new(),
            stats: StatsRegistry::new(),
            pktlog: PacketLog::new(),
            seq: AtomicU64::new(1),
        }
    }

    /// Next sequence number for router-originated requests. Monotonic for
    /// the life of the process.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    // ─── Canonical-order multi-lock helpers ─────────────────────────────

    pub fn lock_ift_lt(&self) -> (MutexGuard<'_, IfaceTable>, MutexGuard<'_, LinkTable>) {
        let ift = self.ift.lock().unwrap();
        let lt = self.lt.lock().unwrap();
        (ift, lt)
    }

    pub fn lock_lt_ctt(&self) -> (MutexGuard<'_, LinkTable>, MutexGuard<'_, ComtreeTable>) {
        let lt = self.lt.lock().unwrap();
        let ctt = self.ctt.lock().unwrap();
        (lt, ctt)
    }

    pub fn lock_ctt_rt(&self) -> (MutexGuard<'_, ComtreeTable>, MutexGuard<'_, RouteTable>) {
        let ctt = self.ctt.lock().unwrap();
        let rt = self.rt.lock().unwrap();
        (ctt, rt)
    }

    pub fn lock_lt_ctt_rt(
        &self,
    ) -> (
        MutexGuard<'_, LinkTable>,
        MutexGuard<'_, ComtreeTable>,
        MutexGuard<'_, RouteTable>,
    ) {
        let lt = self.lt.lock().unwrap();
        let ctt = self.ctt.lock().unwrap();
        let rt = self.rt.lock().unwrap();
        (lt, ctt, rt)
    }

    pub fn lock_all(
        &self,
    ) -> (
        MutexGuard<'_, IfaceTable>,
        MutexGuard<'_, LinkTable>,
        MutexGuard<'_, ComtreeTable>,
        MutexGuard<'_, RouteTable>,
    ) {
        let ift = self.ift.lock().unwrap();
        let lt = self.lt.lock().unwrap();
        let ctt = self.ctt.lock().unwrap();
        let rt = self.rt.lock().unwrap();
        (ift, lt, ctt, rt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_numbers_increase() {
        let rtr = Router::new(ForestAdr::router(2), 16);
        let a = rtr.next_seq();
        let b = rtr.next_seq();
        assert!(b > a);
    }

    #[test]
    fn multi_lock_helpers_do_not_deadlock_each_other() {
        // Two threads taking different helper combinations must make
        // progress because every helper acquires in the same order.
        use std::sync::Arc;
        let rtr = Arc::new(Router::new(ForestAdr::router(2), 16));
        let mut handles = Vec::new();
        for i in 0..4 {
            let rtr = rtr.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    match i % 4 {
                        0 => drop(rtr.lock_ift_lt()),
                        1 => drop(rtr.lock_lt_ctt_rt()),
                        2 => drop(rtr.lock_ctt_rt()),
                        _ => drop(rtr.lock_all()),
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
