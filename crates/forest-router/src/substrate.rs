//! # Signalling Substrate
//!
//! One thread owns the router's UDP socket and the administrative accept
//! socket. It reads datagrams, annotates the tunnel endpoint, and feeds
//! the forwarding engine; control packets addressed to the router come
//! back from the engine and are dispatched here to the worker pool with
//! duplicate suppression:
//!
//! - a retransmitted request whose reply is already saved is answered
//!   from the saved copy without touching a worker;
//! - a retransmit of a request still in progress is dropped silently;
//! - replies from workers are cloned into the repeat handler before they
//!   hit the wire.
//!
//! Outbound requests originated by this router get a fresh sequence
//! number and a saved copy so the eventual reply finds its worker.

use std::net::{SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use quanta::Clock;
use tracing::{debug, trace, warn};

use forest_proto::addr::ForestAdr;
use forest_proto::ctl::{CtlMode, CtlPkt};
use forest_proto::pool::{Packet, PktHandle};
use forest_proto::wire::{PacketHeader, PktType, ACK_FLAG, CONNECT_COMT, MAX_PKT_LEN, OVERHEAD};

use crate::control::WorkerMsg;
use crate::repeat::{RepeatHandler, Repeater, REPEAT_MAX_AGE};
use crate::router::Router;

/// Datagrams pulled off the socket per loop pass.
const RECV_BATCH: usize = 64;

/// Traffic from the forwarding engine and the workers back to the
/// substrate.
pub enum OutMsg {
    /// A signalling packet addressed to this router.
    Inbound(PktHandle),
    /// A control packet (reply or router-originated request) from a
    /// worker.
    Ctl { thx: usize, px: PktHandle },
    /// Worker finished its current request; the slot is idle again.
    Done { thx: usize },
    /// Send as-is (connect acks and similar).
    Transmit(PktHandle),
}

/// Serialize a packet and push it out the socket. The destination is the
/// tunnel endpoint when set, else the peer of `out_link`. Frees the
/// handle.
pub(crate) fn send_packet(sock: &UdpSocket, rtr: &Router, px: PktHandle) {
    let pkt = match rtr.store.get(px) {
        Some(p) => p,
        None => return,
    };
    let dest = pkt.tun.or_else(|| {
        if pkt.out_link != 0 {
            rtr.lt.lock().unwrap().get(pkt.out_link).and_then(|e| e.peer)
        } else {
            None
        }
    });
    match dest {
        Some(ep) => {
            let mut buf = BytesMut::with_capacity(pkt.length());
            pkt.hdr.pack_into(&mut buf, &pkt.payload);
            match sock.send_to(&buf, SocketAddr::V4(ep)) {
                Ok(_) => {
                    if pkt.out_link != 0 {
                        rtr.stats.link(pkt.out_link).count_out(pkt.length());
                    }
                    rtr.pktlog.offer(&pkt, "out");
                }
                Err(e) => debug!(%e, ?ep, "send failed"),
            }
        }
        None => debug!(out_link = pkt.out_link, "packet with no resolvable destination"),
    }
    rtr.store.free(px);
}

pub struct Substrate {
    rtr: Arc<Router>,
    sock: Arc<UdpSocket>,
    listener: TcpListener,
    fwd_tx: Sender<PktHandle>,
    out_rx: Receiver<OutMsg>,
    workers: Vec<Sender<WorkerMsg>>,
    shutdown: Arc<AtomicBool>,
    clock: Clock,
}

impl Substrate {
    pub fn new(
        rtr: Arc<Router>,
        sock: Arc<UdpSocket>,
        listener: TcpListener,
        fwd_tx: Sender<PktHandle>,
        out_rx: Receiver<OutMsg>,
        workers: Vec<Sender<WorkerMsg>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Substrate {
            rtr,
            sock,
            listener,
            fwd_tx,
            out_rx,
            workers,
            shutdown,
            clock: Clock::new(),
        }
    }

    pub fn run(self) {
        let mut reph = RepeatHandler::new(20 * self.workers.len());
        let mut rptr = Repeater::new();
        let mut idle: Vec<usize> = (0..self.workers.len()).rev().collect();

        while !self.shutdown.load(Ordering::Relaxed) {
            let mut busy = false;

            // administrative connections: the display protocol lives
            // outside this core, so accept and close
            loop {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(%peer, "administrative connection accepted and closed");
                        drop(stream);
                        busy = true;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(%e, "accept failed");
                        break;
                    }
                }
            }

            for _ in 0..RECV_BATCH {
                match self.recv_datagram() {
                    Some(px) => {
                        busy = true;
                        if self.fwd_tx.try_send(px).is_err() {
                            self.rtr.store.free(px);
                        }
                    }
                    None => break,
                }
            }

            while let Ok(msg) = self.out_rx.try_recv() {
                busy = true;
                match msg {
                    OutMsg::Inbound(px) => self.inbound(px, &mut reph, &mut rptr, &mut idle),
                    OutMsg::Ctl { thx, px } => self.outbound(thx, px, &mut reph, &mut rptr),
                    OutMsg::Done { thx } => idle.push(thx),
                    OutMsg::Transmit(px) => send_packet(&self.sock, &self.rtr, px),
                }
            }

            let now = self.clock.now();
            if let Some(old) = reph.expired(now, REPEAT_MAX_AGE) {
                self.rtr.store.free(old);
                busy = true;
            }
            if let Some(old) = rptr.expired(now, REPEAT_MAX_AGE) {
                self.rtr.store.free(old);
                busy = true;
            }

            if !busy {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Pull one datagram off the socket, verify the header, resolve the
    /// arrival link, and park it in the store.
    fn recv_datagram(&self) -> Option<PktHandle> {
        let mut buf = [0u8; MAX_PKT_LEN];
        let (n, peer) = match self.sock.recv_from(&mut buf) {
            Ok((n, SocketAddr::V4(peer))) => (n, peer),
            Ok((_, SocketAddr::V6(_))) => return None,
            Err(_) => return None,
        };
        let stats = &self.rtr.stats.substrate;
        stats.rx_datagrams.fetch_add(1, Ordering::Relaxed);
        let hdr = match PacketHeader::unpack(&buf[..n]) {
            Ok(h) => h,
            Err(e) => {
                trace!(%e, %peer, "malformed datagram");
                stats.rx_malformed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let payload = Bytes::copy_from_slice(&buf[OVERHEAD..hdr.length as usize]);
        let mut pkt = Packet::new(hdr, payload);
        pkt.tun = Some(peer);
        pkt.in_link = self.rtr.lt.lock().unwrap().lookup_ep(peer).unwrap_or(0);
        self.rtr.store.alloc(pkt)
    }

    /// Dispatch a signalling packet addressed to this router.
    fn inbound(
        &self,
        px: PktHandle,
        reph: &mut RepeatHandler,
        rptr: &mut Repeater,
        idle: &mut Vec<usize>,
    ) {
        let pkt = match self.rtr.store.get(px) {
            Some(p) => p,
            None => return,
        };
        // only the mode and sequence number are needed here; the worker
        // does the full decode and answers unpack errors itself
        let (_, mode, seq) = match CtlPkt::peek_seq(&pkt.payload) {
            Some(triple) => triple,
            None => {
                trace!("control payload too short to identify");
                self.rtr.stats.substrate.rx_malformed.fetch_add(1, Ordering::Relaxed);
                self.rtr.store.free(px);
                return;
            }
        };
        let mode = match CtlMode::from_code(mode) {
            Some(m) => m,
            None => {
                self.rtr.stats.substrate.rx_malformed.fetch_add(1, Ordering::Relaxed);
                self.rtr.store.free(px);
                return;
            }
        };
        let src = pkt.hdr.src;
        let stats = &self.rtr.stats.substrate;
        let now = self.clock.now();

        if mode == CtlMode::Request {
            stats.requests_in.fetch_add(1, Ordering::Relaxed);
            if let Some(saved) = reph.find(src, seq) {
                // retransmit: answer from the saved reply, or stay silent
                // while a worker still has it
                stats.repeats_suppressed.fetch_add(1, Ordering::Relaxed);
                if saved.is_reply {
                    let saved_px = saved.px;
                    if let Some(cx) = self.rtr.store.clone_pkt(saved_px) {
                        stats.replies_resent.fetch_add(1, Ordering::Relaxed);
                        send_packet(&self.sock, &self.rtr, cx);
                    }
                }
                self.rtr.store.free(px);
                return;
            }
            match idle.pop() {
                Some(thx) => {
                    // save the copy only once a worker takes the request,
                    // so a retransmit after pool pressure gets a fresh try
                    if let Some(cx) = self.rtr.store.clone_pkt(px) {
                        if let Some(old) = reph.save_request(cx, src, seq, now) {
                            self.rtr.store.free(old);
                        }
                    }
                    if self.workers[thx].send(WorkerMsg::Pkt(px)).is_err() {
                        warn!(thx, "worker channel closed");
                        self.rtr.store.free(px);
                    }
                }
                None => {
                    stats.pool_exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!("thread pool exhausted, dropping request");
                    self.rtr.store.free(px);
                }
            }
            return;
        }

        // a reply: find the worker that originated the request
        stats.replies_in.fetch_add(1, Ordering::Relaxed);
        match rptr.delete_match(src, seq) {
            Some((saved, thx)) => {
                self.rtr.store.free(saved);
                if self.workers[thx].send(WorkerMsg::Pkt(px)).is_err() {
                    self.rtr.store.free(px);
                }
            }
            None => {
                stats.unmatched_replies.fetch_add(1, Ordering::Relaxed);
                self.rtr.store.free(px);
            }
        }
    }

    /// Handle a control packet leaving a worker: number and track
    /// requests, save reply copies for dedup, and send.
    fn outbound(
        &self,
        thx: usize,
        px: PktHandle,
        reph: &mut RepeatHandler,
        rptr: &mut Repeater,
    ) {
        let pkt = match self.rtr.store.get(px) {
            Some(p) => p,
            None => return,
        };
        let now = self.clock.now();
        match CtlPkt::decode(&pkt.payload) {
            Ok(mut cp) if cp.mode == CtlMode::Request => {
                let seq = self.rtr.next_seq();
                cp.seq = seq;
                let encoded = cp.encode();
                self.rtr.store.with_mut(px, |p| p.payload = encoded);
                if let Some(cx) = self.rtr.store.clone_pkt(px) {
                    rptr.save(seq, cx, pkt.hdr.dst, thx, now);
                }
                send_packet(&self.sock, &self.rtr, px);
            }
            Ok(cp) => {
                if let Some(cx) = self.rtr.store.clone_pkt(px) {
                    if let Some(old) = reph.save_reply(cx, pkt.hdr.dst, cp.seq, now) {
                        self.rtr.store.free(old);
                    }
                }
                send_packet(&self.sock, &self.rtr, px);
            }
            Err(_) => {
                // not a control payload (e.g. a CONNECT toward a router
                // peer): just put it on the wire
                send_packet(&self.sock, &self.rtr, px);
            }
        }
    }
}

// ─── Leaf-role handshake ─────────────────────────────────────────────────────

/// The CONNECT/DISCONNECT dance a leaf runs against its access router:
/// the packet carries the provisioned nonce, is retried at one-second
/// intervals up to three times, and succeeds on an ACK-flagged echo.
pub struct Handshake<'a> {
    pub sock: &'a UdpSocket,
    pub my_adr: ForestAdr,
    pub rtr_adr: ForestAdr,
    pub rtr_ep: SocketAddrV4,
    pub nonce: u64,
}

impl Handshake<'_> {
    pub fn connect(&self) -> std::io::Result<bool> {
        self.dance(PktType::Connect)
    }

    pub fn disconnect(&self) -> std::io::Result<bool> {
        self.dance(PktType::Disconnect)
    }

    fn dance(&self, typ: PktType) -> std::io::Result<bool> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&rand::random::<u64>().to_be_bytes());
        payload.extend_from_slice(&self.nonce.to_be_bytes());
        let hdr = PacketHeader::new(typ, CONNECT_COMT, self.my_adr, self.rtr_adr);
        let mut out = BytesMut::new();
        hdr.pack_into(&mut out, &payload);

        let clock = Clock::new();
        for _attempt in 0..3 {
            self.sock.send_to(&out, SocketAddr::V4(self.rtr_ep))?;
            let deadline = clock.now() + Duration::from_secs(1);
            loop {
                let now = clock.now();
                if now >= deadline {
                    break;
                }
                self.sock
                    .set_read_timeout(Some(deadline.saturating_duration_since(now)))?;
                let mut buf = [0u8; MAX_PKT_LEN];
                let n = match self.sock.recv(&mut buf) {
                    Ok(n) => n,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => return Err(e),
                };
                if let Ok(reply) = PacketHeader::unpack(&buf[..n]) {
                    if reply.typ == typ && reply.flags & ACK_FLAG != 0 {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}
