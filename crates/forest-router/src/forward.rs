//! # Forwarding Engine
//!
//! Per received packet: validate, classify, replicate, enqueue. Signalling
//! packets addressed to this router are diverted to the substrate's
//! inbound dispatcher; CONNECT/DISCONNECT datagrams run the endpoint
//! binding handshake; subscribe/unsubscribe packets edit multicast routes;
//! everything else is looked up in the route table and fanned out with
//! split horizon, sharing the payload buffer between copies.
//!
//! Every failure on this path is a silent drop with a counter. Nothing is
//! retried; control-plane correctness never depends on data-plane
//! delivery.

use std::sync::Arc;

use bytes::Buf;
use crossbeam_channel::Sender;
use tracing::{debug, trace};

use forest_proto::addr::ForestAdr;
use forest_proto::pool::{Packet, PktHandle};
use forest_proto::wire::{PktType, ACK_FLAG, CONNECT_COMT};

use crate::router::Router;
use crate::substrate::OutMsg;

pub struct Forwarder {
    rtr: Arc<Router>,
    out_tx: Sender<OutMsg>,
}

impl Forwarder {
    pub fn new(rtr: Arc<Router>, out_tx: Sender<OutMsg>) -> Self {
        Forwarder { rtr, out_tx }
    }

    /// Classify and dispose of one received packet. Consumes the handle:
    /// every path either enqueues it, hands it off, or frees it.
    pub fn process(&self, px: PktHandle) {
        let pkt = match self.rtr.store.get(px) {
            Some(p) => p,
            None => return,
        };
        match pkt.hdr.typ {
            PktType::Connect | PktType::Disconnect => self.handle_conn(px, &pkt),
            PktType::SubUnsub => self.handle_sub_unsub(px, &pkt),
            typ if typ.is_signal() && pkt.hdr.dst == self.rtr.my_adr => {
                self.rtr.stats.link(pkt.in_link).count_in(pkt.length());
                let _ = self.out_tx.send(OutMsg::Inbound(px));
            }
            _ => self.forward_data(px, &pkt),
        }
    }

    fn forward_data(&self, px: PktHandle, pkt: &Packet) {
        let stats = self.rtr.stats.link(pkt.in_link);
        stats.count_in(pkt.length());

        let comt = pkt.hdr.comtree;
        let in_link = pkt.in_link;
        let (lt, ctt, rt) = self.rtr.lock_lt_ctt_rt();

        let lte = match (in_link != 0).then(|| lt.get(in_link)).flatten() {
            Some(e) => e,
            None => {
                stats.drops_bad_source.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                drop((lt, ctt, rt));
                self.rtr.store.free(px);
                return;
            }
        };
        let in_clnk = match ctt.clnk(comt, in_link) {
            Some(c) => c,
            None => {
                stats.drops_bad_comtree.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                drop((lt, ctt, rt));
                self.rtr.store.free(px);
                return;
            }
        };
        // leaves must use their assigned source address and honor any
        // destination restriction on their comtree-link
        if !lte.peer_type.is_router()
            && (pkt.hdr.src != lte.peer_adr
                || (!in_clnk.dest.is_none() && pkt.hdr.dst != in_clnk.dest))
        {
            stats.drops_bad_source.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            drop((lt, ctt, rt));
            self.rtr.store.free(px);
            return;
        }

        let links: Vec<u32> = match rt.lookup(comt, pkt.hdr.dst) {
            Some(set) => set.iter().copied().collect(),
            None => {
                stats.drops_no_route.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                drop((lt, ctt, rt));
                self.rtr.store.free(px);
                return;
            }
        };

        self.rtr.pktlog.offer(pkt, "fwd");

        if pkt.hdr.dst.is_multicast() {
            // one shared-buffer clone per subscriber link, never back out
            // the arrival comtree-link
            for link in links {
                if link == in_link {
                    continue;
                }
                let qid = match ctt.clnk(comt, link) {
                    Some(c) if c.qid != 0 => c.qid,
                    _ => continue,
                };
                let cx = match self.rtr.store.clone_pkt(px) {
                    Some(cx) => cx,
                    None => {
                        self.rtr
                            .stats
                            .link(link)
                            .drops_store_exhausted
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        continue;
                    }
                };
                self.rtr.store.with_mut(cx, |p| p.out_link = link);
                self.enqueue(cx, qid, link, pkt.length());
            }
            drop((lt, ctt, rt));
            self.rtr.store.free(px);
        } else {
            let link = match links.first() {
                Some(&l) => l,
                None => {
                    stats.drops_no_route.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    drop((lt, ctt, rt));
                    self.rtr.store.free(px);
                    return;
                }
            };
            let qid = match ctt.clnk(comt, link) {
                Some(c) if c.qid != 0 => c.qid,
                _ => {
                    stats.drops_no_route.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    drop((lt, ctt, rt));
                    self.rtr.store.free(px);
                    return;
                }
            };
            self.rtr.store.with_mut(px, |p| p.out_link = link);
            let len = pkt.length();
            drop((lt, ctt, rt));
            self.enqueue(px, qid, link, len);
        }
    }

    fn enqueue(&self, px: PktHandle, qid: u32, link: u32, len: usize) {
        if self.rtr.qm.enq(qid, px, len).is_err() {
            self.rtr
                .stats
                .link(link)
                .drops_queue_full
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.rtr.store.free(px);
        }
    }

    /// CONNECT/DISCONNECT handshake. A CONNECT from an unknown endpoint
    /// carrying a provisioned nonce binds that endpoint to the link; the
    /// reply is the same packet type with the ACK flag. Repeats re-ack.
    fn handle_conn(&self, px: PktHandle, pkt: &Packet) {
        let ep = match pkt.tun {
            Some(ep) => ep,
            None => {
                self.rtr.store.free(px);
                return;
            }
        };
        // an ack is the other side of our own handshake, not a request
        if pkt.hdr.flags & ACK_FLAG != 0 {
            self.rtr.store.free(px);
            return;
        }
        let link = {
            let mut lt = self.rtr.lt.lock().unwrap();
            let link = if pkt.in_link != 0 {
                Some(pkt.in_link)
            } else {
                payload_nonce(&pkt.payload).and_then(|n| lt.lookup_nonce(n))
            };
            let link = match link {
                Some(l) => l,
                None => {
                    debug!(?ep, "connect from unknown endpoint, no matching nonce");
                    self.rtr.stats.substrate.rx_malformed.fetch_add(
                        1,
                        std::sync::atomic::Ordering::Relaxed,
                    );
                    self.rtr.store.free(px);
                    return;
                }
            };
            match pkt.hdr.typ {
                PktType::Connect => {
                    if let Err(e) = lt.bind_endpoint(link, ep) {
                        debug!(link, %e, "connect rejected");
                        self.rtr.store.free(px);
                        return;
                    }
                    trace!(link, ?ep, "link connected");
                }
                _ => {
                    if let Some(entry) = lt.get_mut(link) {
                        entry.connected = false;
                    }
                    trace!(link, "link disconnected");
                }
            }
            link
        };

        let mut ack = Packet::signal(
            pkt.hdr.typ,
            CONNECT_COMT,
            self.rtr.my_adr,
            pkt.hdr.src,
            pkt.payload.clone(),
        );
        ack.hdr.flags = ACK_FLAG;
        ack.tun = Some(ep);
        ack.out_link = link;
        if let Some(h) = self.rtr.store.alloc(ack) {
            let _ = self.out_tx.send(OutMsg::Transmit(h));
        }
        self.rtr.store.free(px);
    }

    /// Subscribe/unsubscribe: a leaf edits the multicast routes of the
    /// arrival comtree. Payload: group-address lists for adds then drops.
    fn handle_sub_unsub(&self, px: PktHandle, pkt: &Packet) {
        let stats = self.rtr.stats.link(pkt.in_link);
        stats.count_in(pkt.length());
        let comt = pkt.hdr.comtree;
        let in_link = pkt.in_link;

        let (lt, ctt, mut rt) = self.rtr.lock_lt_ctt_rt();
        let valid = in_link != 0
            && lt.get(in_link).is_some_and(|e| !e.peer_type.is_router())
            && ctt.clnk(comt, in_link).is_some();
        if !valid {
            stats.drops_bad_source.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            drop((lt, ctt, rt));
            self.rtr.store.free(px);
            return;
        }

        let (subs, unsubs) = match parse_sub_unsub(&pkt.payload) {
            Some(lists) => lists,
            None => {
                stats.drops_bad_header.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                drop((lt, ctt, rt));
                self.rtr.store.free(px);
                return;
            }
        };
        for group in subs {
            if !group.is_multicast() {
                continue;
            }
            if rt.get(comt, group).is_some() {
                let _ = rt.add_link(comt, group, in_link);
            } else {
                let _ = rt.add(comt, group, in_link);
            }
        }
        for group in unsubs {
            if !group.is_multicast() {
                continue;
            }
            let _ = rt.drop_link(comt, group, in_link);
        }
        drop((lt, ctt, rt));
        self.rtr.store.free(px);
    }
}

/// The nonce in a connect payload: two big-endian 64-bit words, sequence
/// number then nonce.
pub fn payload_nonce(payload: &[u8]) -> Option<u64> {
    if payload.len() < 16 {
        return None;
    }
    let mut buf = &payload[8..16];
    Some(buf.get_u64())
}

fn parse_sub_unsub(payload: &[u8]) -> Option<(Vec<ForestAdr>, Vec<ForestAdr>)> {
    let mut buf = payload;
    let read_list = |buf: &mut &[u8]| -> Option<Vec<ForestAdr>> {
        if buf.remaining() < 4 {
            return None;
        }
        let n = buf.get_u32() as usize;
        if n > 350 || buf.remaining() < n * 4 {
            return None;
        }
        Some((0..n).map(|_| ForestAdr::from_raw(buf.get_u32())).collect())
    };
    let subs = read_list(&mut buf)?;
    let unsubs = read_list(&mut buf)?;
    Some((subs, unsubs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_payload_nonce() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&7u64.to_be_bytes());
        payload.extend_from_slice(&0xDEAD_BEEFu64.to_be_bytes());
        assert_eq!(payload_nonce(&payload), Some(0xDEAD_BEEF));
        assert_eq!(payload_nonce(&payload[..12]), None);
    }

    #[test]
    fn sub_unsub_parsing() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&ForestAdr::mcast(1).raw().to_be_bytes());
        payload.extend_from_slice(&ForestAdr::mcast(2).raw().to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&ForestAdr::mcast(3).raw().to_be_bytes());

        let (subs, unsubs) = parse_sub_unsub(&payload).unwrap();
        assert_eq!(subs, vec![ForestAdr::mcast(1), ForestAdr::mcast(2)]);
        assert_eq!(unsubs, vec![ForestAdr::mcast(3)]);

        // truncated list
        assert!(parse_sub_unsub(&payload[..6]).is_none());
        // absurd count
        let mut bogus = Vec::new();
        bogus.extend_from_slice(&10_000u32.to_be_bytes());
        assert!(parse_sub_unsub(&bogus).is_none());
    }
}
