//! # Router Runtime
//!
//! Owns the sockets and the threads: one substrate thread, a pool of
//! control workers, a forwarding thread and an output thread. The
//! initial configuration is applied through the same operations the
//! control handlers use, so a config file and a controller produce
//! identical state.
//!
//! Dropping the runtime shuts everything down; `shutdown()` is
//! idempotent and joins every thread.

use std::net::{SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{bounded, Sender};
use tracing::{info, warn};

use forest_proto::ctl::{CtlAttr, CtlPkt, CtlType};
use forest_proto::pool::PktHandle;

use crate::config::RouterConfig;
use crate::control::{self, ControlHandler, WorkerMsg};
use crate::forward::Forwarder;
use crate::router::Router;
use crate::substrate::{send_packet, OutMsg, Substrate};

const FWD_CHANNEL_DEPTH: usize = 1024;
const OUT_CHANNEL_DEPTH: usize = 1024;

pub struct RouterRuntime {
    rtr: Arc<Router>,
    local_addr: SocketAddrV4,
    shutdown: Arc<AtomicBool>,
    worker_tx: Vec<Sender<WorkerMsg>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl RouterRuntime {
    /// Bind the sockets, apply the initial configuration, and start all
    /// threads. Socket failures here are fatal.
    pub fn start(cfg: RouterConfig) -> anyhow::Result<Self> {
        let sock = UdpSocket::bind(SocketAddrV4::new(cfg.bind_ip, cfg.bind_port))
            .context("binding forest datagram socket")?;
        sock.set_nonblocking(true)
            .context("setting datagram socket non-blocking")?;
        let local_addr = match sock.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(a) => anyhow::bail!("unexpected IPv6 bind {a}"),
        };
        let listener = TcpListener::bind(SocketAddrV4::new(cfg.bind_ip, cfg.admin_port))
            .context("binding administrative socket")?;
        listener
            .set_nonblocking(true)
            .context("setting administrative socket non-blocking")?;
        let sock = Arc::new(sock);

        let rtr = Arc::new(Router::new(cfg.address, cfg.store_capacity));

        let (fwd_tx, fwd_rx) = bounded::<PktHandle>(FWD_CHANNEL_DEPTH);
        let (out_tx, out_rx) = bounded::<OutMsg>(OUT_CHANNEL_DEPTH);

        apply_config(&rtr, &cfg, &out_tx)?;
        info!(
            addr = %cfg.address,
            %local_addr,
            workers = cfg.workers,
            "forest router starting"
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        let mut worker_tx = Vec::new();
        let mut worker_channels = Vec::new();
        for thx in 0..cfg.workers {
            let (tx, rx) = bounded::<WorkerMsg>(4);
            worker_tx.push(tx.clone());
            worker_channels.push(tx);
            let handler = ControlHandler::new(rtr.clone(), thx, rx, out_tx.clone());
            handles.push(
                thread::Builder::new()
                    .name(format!("forest-ctl-{thx}"))
                    .spawn(move || handler.run())
                    .context("spawning control worker")?,
            );
        }

        let substrate = Substrate::new(
            rtr.clone(),
            sock.clone(),
            listener,
            fwd_tx,
            out_rx,
            worker_channels,
            shutdown.clone(),
        );
        handles.push(
            thread::Builder::new()
                .name("forest-substrate".into())
                .spawn(move || substrate.run())
                .context("spawning substrate thread")?,
        );

        {
            let fwder = Forwarder::new(rtr.clone(), out_tx.clone());
            let stop = shutdown.clone();
            handles.push(
                thread::Builder::new()
                    .name("forest-fwd".into())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            match fwd_rx.recv_timeout(Duration::from_millis(100)) {
                                Ok(px) => fwder.process(px),
                                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                            }
                        }
                    })
                    .context("spawning forwarding thread")?,
            );
        }

        {
            let rtr = rtr.clone();
            let sock = sock.clone();
            let stop = shutdown.clone();
            handles.push(
                thread::Builder::new()
                    .name("forest-out".into())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            if let Some((_link, _qid, px)) =
                                rtr.qm.deq_timeout(Duration::from_millis(100))
                            {
                                send_packet(&sock, &rtr, px);
                            }
                        }
                    })
                    .context("spawning output thread")?,
            );
        }

        Ok(RouterRuntime { rtr, local_addr, shutdown, worker_tx, handles })
    }

    pub fn router(&self) -> Arc<Router> {
        self.rtr.clone()
    }

    /// The bound forest socket address; useful when the config asked for
    /// an ephemeral port.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Stop all threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        for tx in &self.worker_tx {
            let _ = tx.send(WorkerMsg::Shutdown);
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("router thread panicked during shutdown");
            }
        }
    }
}

impl Drop for RouterRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Install the configured interfaces, links, comtrees and routes through
/// the control operations. Side packets (connects toward router peers)
/// are queued for the substrate to send once it runs.
fn apply_config(
    rtr: &Arc<Router>,
    cfg: &RouterConfig,
    out_tx: &Sender<OutMsg>,
) -> anyhow::Result<()> {
    rtr.lt
        .lock()
        .unwrap()
        .set_leaf_range(cfg.leaf_range.0, cfg.leaf_range.1)
        .map_err(|e| anyhow::anyhow!("setting leaf range: {e}"))?;

    let exec = |cp: CtlPkt| -> anyhow::Result<CtlPkt> {
        let mut side = Vec::new();
        let reply = control::execute(rtr, &cp, &mut side)
            .map_err(|e| anyhow::anyhow!("{:?}: {e}", cp.typ))?;
        for px in side {
            if out_tx.try_send(OutMsg::Transmit(px)).is_err() {
                rtr.store.free(px);
            }
        }
        Ok(reply)
    };

    for i in &cfg.ifaces {
        let mut cp = CtlPkt::request(CtlType::AddIface, 0);
        cp.set(CtlAttr::Iface, i.iface)
            .set(CtlAttr::LocalIp, i.ip.into())
            .set(CtlAttr::LocalPort, i.port as u32);
        cp.set_rates(&i.rates);
        exec(cp)?;
    }

    for l in &cfg.links {
        let mut cp = CtlPkt::request(CtlType::AddLink, 0);
        cp.set_nonzero(CtlAttr::Link, l.link)
            .set(CtlAttr::Iface, l.iface)
            .set(CtlAttr::PeerType, l.peer_type.code());
        if let Some((ip, port)) = l.peer {
            cp.set(CtlAttr::PeerIp, ip.into()).set(CtlAttr::PeerPort, port as u32);
        }
        if !l.peer_adr.is_none() {
            cp.set_adr(CtlAttr::PeerAdr, l.peer_adr);
        }
        if l.nonce != 0 {
            cp.set_nonce(l.nonce);
        }
        let reply = exec(cp)?;
        let link = reply.get(CtlAttr::Link).unwrap_or(l.link);

        if l.rates != forest_proto::rate::RateSpec::minimum() {
            let mut cp = CtlPkt::request(CtlType::ModLink, 0);
            cp.set(CtlAttr::Link, link);
            cp.set_rates(&l.rates);
            exec(cp)?;
        }
    }

    for c in &cfg.comtrees {
        let mut cp = CtlPkt::request(CtlType::AddComtree, 0);
        cp.set(CtlAttr::Comtree, c.comtree);
        exec(cp)?;

        for cl in &c.links {
            let mut cp = CtlPkt::request(CtlType::AddComtreeLink, 0);
            cp.set(CtlAttr::Comtree, c.comtree)
                .set(CtlAttr::Link, cl.link)
                .set(CtlAttr::CoreFlag, cl.core as u32);
            exec(cp)?;

            if cl.rates != forest_proto::rate::RateSpec::minimum() {
                let mut cp = CtlPkt::request(CtlType::ModComtreeLink, 0);
                cp.set(CtlAttr::Comtree, c.comtree).set(CtlAttr::Link, cl.link);
                cp.set_rates(&cl.rates);
                exec(cp)?;
            }
        }

        let mut cp = CtlPkt::request(CtlType::ModComtree, 0);
        cp.set(CtlAttr::Comtree, c.comtree).set(CtlAttr::CoreFlag, c.core as u32);
        cp.set_nonzero(CtlAttr::ParentLink, c.parent_link);
        exec(cp)?;
    }

    for r in &cfg.routes {
        let mut cp = CtlPkt::request(CtlType::AddRoute, 0);
        cp.set(CtlAttr::Comtree, r.comtree).set_adr(CtlAttr::DestAdr, r.dest);
        cp.set_nonzero(CtlAttr::Link, r.links.first().copied().unwrap_or(0));
        exec(cp)?;

        for link in r.links.iter().skip(1) {
            let mut cp = CtlPkt::request(CtlType::AddRouteLink, 0);
            cp.set(CtlAttr::Comtree, r.comtree)
                .set_adr(CtlAttr::DestAdr, r.dest)
                .set(CtlAttr::Link, *link);
            exec(cp)?;
        }
    }

    Ok(())
}
