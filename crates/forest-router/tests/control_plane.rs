//! Control catalogue tests driven directly against the router state:
//! add/get/drop round trips, cascade drops, and rate accounting.

use std::sync::Arc;

use forest_proto::addr::{ForestAdr, PeerType};
use forest_proto::ctl::{CtlAttr, CtlMode, CtlPkt, CtlType};
use forest_proto::rate::RateSpec;
use forest_router::control;
use forest_router::error::CtlError;
use forest_router::router::Router;

fn new_router() -> Arc<Router> {
    let rtr = Arc::new(Router::new(ForestAdr::router(2), 1024));
    rtr.lt.lock().unwrap().set_leaf_range(100, 199).unwrap();
    rtr
}

fn exec(rtr: &Arc<Router>, cp: &CtlPkt) -> Result<CtlPkt, CtlError> {
    let mut side = Vec::new();
    let out = control::execute(rtr, cp, &mut side);
    for px in side {
        rtr.store.free(px);
    }
    out
}

fn add_iface(rtr: &Arc<Router>, iface: u32, rates: RateSpec) {
    let mut cp = CtlPkt::request(CtlType::AddIface, 1);
    cp.set(CtlAttr::Iface, iface)
        .set(CtlAttr::LocalIp, u32::from(std::net::Ipv4Addr::new(10, 0, 0, 1)))
        .set(CtlAttr::LocalPort, 30000);
    cp.set_rates(&rates);
    exec(rtr, &cp).unwrap();
}

fn add_leaf_link(rtr: &Arc<Router>, iface: u32, host: u8, port: u16) -> (u32, ForestAdr) {
    let mut cp = CtlPkt::request(CtlType::AddLink, 2);
    cp.set(CtlAttr::Iface, iface)
        .set(CtlAttr::PeerType, PeerType::Leaf.code())
        .set(CtlAttr::PeerIp, u32::from(std::net::Ipv4Addr::new(10, 0, 0, host)))
        .set(CtlAttr::PeerPort, port as u32);
    cp.set_nonce(0xDEAD_0000 + host as u64);
    let r = exec(rtr, &cp).unwrap();
    (r.require(CtlAttr::Link).unwrap(), r.adr(CtlAttr::PeerAdr).unwrap())
}

fn add_comtree_with_link(rtr: &Arc<Router>, comt: u32, link: u32) {
    let mut cp = CtlPkt::request(CtlType::AddComtree, 3);
    cp.set(CtlAttr::Comtree, comt);
    exec(rtr, &cp).unwrap();

    let mut cp = CtlPkt::request(CtlType::AddComtreeLink, 4);
    cp.set(CtlAttr::Comtree, comt).set(CtlAttr::Link, link);
    exec(rtr, &cp).unwrap();
}

// S1: add an interface, then a link; the reply carries the assigned link
// number and a leaf address from the router's range.
#[test]
fn add_link_round_trip() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::new(1000, 1000, 100, 100));

    let mut cp = CtlPkt::request(CtlType::AddLink, 42);
    cp.set(CtlAttr::Iface, 1)
        .set(CtlAttr::PeerType, PeerType::Leaf.code())
        .set(CtlAttr::PeerIp, u32::from(std::net::Ipv4Addr::new(10, 0, 0, 2)))
        .set(CtlAttr::PeerPort, 30001);
    cp.set_nonce(0xDEAD);
    let r = exec(&rtr, &cp).unwrap();

    assert_eq!(r.mode, CtlMode::PosReply);
    assert_eq!(r.seq, 42);
    assert_eq!(r.get(CtlAttr::Link), Some(1));
    let adr = r.adr(CtlAttr::PeerAdr).unwrap();
    assert_eq!(adr.zip(), 2);
    assert!((100..=199).contains(&adr.local()));

    // get returns what add stored
    let mut cp = CtlPkt::request(CtlType::GetLink, 43);
    cp.set(CtlAttr::Link, 1);
    let g = exec(&rtr, &cp).unwrap();
    assert_eq!(g.get(CtlAttr::Iface), Some(1));
    assert_eq!(g.adr(CtlAttr::PeerAdr), Some(adr));
    assert_eq!(g.get(CtlAttr::Connected), Some(0));
    assert_eq!(g.rates(), Some(RateSpec::minimum()));
}

#[test]
fn add_drop_get_returns_not_found() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::uniform(1000));
    let (link, _) = add_leaf_link(&rtr, 1, 2, 30001);

    let mut cp = CtlPkt::request(CtlType::DropLink, 5);
    cp.set(CtlAttr::Link, link);
    exec(&rtr, &cp).unwrap();

    let mut cp = CtlPkt::request(CtlType::GetLink, 6);
    cp.set(CtlAttr::Link, link);
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::NotFound(_))));
}

#[test]
fn duplicate_iface_and_link_rejected() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::uniform(1000));

    let mut cp = CtlPkt::request(CtlType::AddIface, 9);
    cp.set(CtlAttr::Iface, 1)
        .set(CtlAttr::LocalIp, u32::from(std::net::Ipv4Addr::new(10, 0, 0, 9)));
    cp.set_rates(&RateSpec::uniform(500));
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::Duplicate(_))));

    add_leaf_link(&rtr, 1, 2, 30001);
    // same endpoint again
    let mut cp = CtlPkt::request(CtlType::AddLink, 10);
    cp.set(CtlAttr::Iface, 1)
        .set(CtlAttr::PeerType, PeerType::Leaf.code())
        .set(CtlAttr::PeerIp, u32::from(std::net::Ipv4Addr::new(10, 0, 0, 2)))
        .set(CtlAttr::PeerPort, 30001);
    cp.set_nonce(0x9999);
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::Duplicate(_))));
}

// S5: dropping a link purges its routes and comtree-links and returns
// the interface budget.
#[test]
fn drop_link_cascades() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::new(1000, 1000, 100, 100));
    let (link, peer_adr) = add_leaf_link(&rtr, 1, 2, 30001);
    add_comtree_with_link(&rtr, 5, link);

    // the default unicast route to the leaf came with the comtree-link
    let mut cp = CtlPkt::request(CtlType::GetRoute, 7);
    cp.set(CtlAttr::Comtree, 5).set_adr(CtlAttr::DestAdr, peer_adr);
    let g = exec(&rtr, &cp).unwrap();
    assert_eq!(g.get(CtlAttr::Link), Some(link));

    let mut cp = CtlPkt::request(CtlType::DropLink, 8);
    cp.set(CtlAttr::Link, link);
    exec(&rtr, &cp).unwrap();

    let mut cp = CtlPkt::request(CtlType::GetRoute, 9);
    cp.set(CtlAttr::Comtree, 5).set_adr(CtlAttr::DestAdr, peer_adr);
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::NotFound(_))));

    let mut cp = CtlPkt::request(CtlType::GetComtreeLink, 10);
    cp.set(CtlAttr::Comtree, 5).set(CtlAttr::Link, link);
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::NotFound(_))));

    // interface budget fully restored
    let mut cp = CtlPkt::request(CtlType::GetIface, 11);
    cp.set(CtlAttr::Iface, 1);
    let g = exec(&rtr, &cp).unwrap();
    assert_eq!(g.rates(), g.avail_rates());

    // no queues left behind
    assert_eq!(rtr.qm.queue_count(), 0);
}

// S6: modifying a link beyond the interface budget is refused without
// side effects.
#[test]
fn rate_overcommit_rejected() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::new(1000, 1000, 100, 100));
    let (link, _) = add_leaf_link(&rtr, 1, 2, 30001);

    let mut cp = CtlPkt::request(CtlType::ModLink, 12);
    cp.set(CtlAttr::Link, link);
    cp.set_rates(&RateSpec::new(900, 900, 90, 90));
    exec(&rtr, &cp).unwrap();

    let mut cp = CtlPkt::request(CtlType::ModLink, 13);
    cp.set(CtlAttr::Link, link);
    cp.set_rates(&RateSpec::new(1100, 900, 90, 90));
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::NoCapacity(_))));

    // unchanged
    let mut cp = CtlPkt::request(CtlType::GetLink, 14);
    cp.set(CtlAttr::Link, link);
    let g = exec(&rtr, &cp).unwrap();
    assert_eq!(g.rates(), Some(RateSpec::new(900, 900, 90, 90)));
}

// Invariants 1 and 2: interface and link budgets cover what is committed
// below them, componentwise, after every commit.
#[test]
fn budget_invariants_hold_after_operations() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::new(10_000, 10_000, 1000, 1000));
    let (a, _) = add_leaf_link(&rtr, 1, 2, 30001);
    let (b, _) = add_leaf_link(&rtr, 1, 3, 30001);

    let mut cp = CtlPkt::request(CtlType::ModLink, 20);
    cp.set(CtlAttr::Link, a);
    cp.set_rates(&RateSpec::new(2000, 2000, 200, 200));
    exec(&rtr, &cp).unwrap();

    add_comtree_with_link(&rtr, 5, a);
    add_comtree_with_link(&rtr, 6, a);
    add_comtree_with_link(&rtr, 6, b);

    let mut cp = CtlPkt::request(CtlType::ModComtreeLink, 21);
    cp.set(CtlAttr::Comtree, 5).set(CtlAttr::Link, a);
    cp.set_rates(&RateSpec::new(500, 500, 50, 50));
    exec(&rtr, &cp).unwrap();

    let ift = rtr.ift.lock().unwrap();
    let lt = rtr.lt.lock().unwrap();
    let ctt = rtr.ctt.lock().unwrap();

    // invariant 1: per interface, sum of link rates fits
    let mut link_sum = RateSpec::default();
    for (_, e) in lt.iter() {
        assert_eq!(e.iface, 1);
        link_sum.add(&e.rates);
    }
    let ifte = ift.get(1).unwrap();
    assert!(link_sum.leq(&ifte.rates));
    // and avail is exactly what is left
    let mut left = ifte.rates;
    left.subtract(&link_sum);
    assert_eq!(ifte.avail, left);

    // invariant 2: per link, sum of comtree-link rates fits
    for (link, e) in lt.iter() {
        let mut clnk_sum = RateSpec::default();
        for comt in ctt.comtrees_for_link(link) {
            clnk_sum.add(&ctt.clnk(comt, link).unwrap().rates);
        }
        assert!(clnk_sum.leq(&e.rates));
    }

    // invariant 3: every comtree-link queue belongs to its link
    for (link, _) in lt.iter() {
        for comt in ctt.comtrees_for_link(link) {
            let qid = ctt.clnk(comt, link).unwrap().qid;
            assert_eq!(rtr.qm.queue_link(qid), Some(link));
        }
    }
}

#[test]
fn comtree_link_rollback_on_failure() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::uniform(1000));
    let (link, _) = add_leaf_link(&rtr, 1, 2, 30001);
    add_comtree_with_link(&rtr, 5, link);

    // adding the same link again must fail and leave state untouched
    let before = rtr.qm.queue_count();
    let mut cp = CtlPkt::request(CtlType::AddComtreeLink, 30);
    cp.set(CtlAttr::Comtree, 5).set(CtlAttr::Link, link);
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::Duplicate(_))));
    assert_eq!(rtr.qm.queue_count(), before);

    let avail_before = rtr.lt.lock().unwrap().get(link).unwrap().avail;
    // unknown comtree
    let mut cp = CtlPkt::request(CtlType::AddComtreeLink, 31);
    cp.set(CtlAttr::Comtree, 9).set(CtlAttr::Link, link);
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::NotFound(_))));
    assert_eq!(rtr.lt.lock().unwrap().get(link).unwrap().avail, avail_before);
}

#[test]
fn drop_comtree_cascades_members() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::uniform(1000));
    let (a, adr_a) = add_leaf_link(&rtr, 1, 2, 30001);
    let (b, _) = add_leaf_link(&rtr, 1, 3, 30001);
    add_comtree_with_link(&rtr, 5, a);
    let mut cp = CtlPkt::request(CtlType::AddComtreeLink, 40);
    cp.set(CtlAttr::Comtree, 5).set(CtlAttr::Link, b);
    exec(&rtr, &cp).unwrap();

    let mut cp = CtlPkt::request(CtlType::DropComtree, 41);
    cp.set(CtlAttr::Comtree, 5);
    exec(&rtr, &cp).unwrap();

    assert_eq!(rtr.qm.queue_count(), 0);
    let mut cp = CtlPkt::request(CtlType::GetRoute, 42);
    cp.set(CtlAttr::Comtree, 5).set_adr(CtlAttr::DestAdr, adr_a);
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::NotFound(_))));
    // link budgets restored
    let lt = rtr.lt.lock().unwrap();
    for link in [a, b] {
        let e = lt.get(link).unwrap();
        assert_eq!(e.avail, e.rates);
    }
}

#[test]
fn join_leave_membership_flow() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::uniform(1000));
    let (link, leaf) = add_leaf_link(&rtr, 1, 2, 30001);
    add_comtree_with_link(&rtr, 5, link);

    let mut join = CtlPkt::request(CtlType::Join, 50);
    join.set(CtlAttr::Comtree, 5).set_adr(CtlAttr::LeafAdr, leaf);
    exec(&rtr, &join).unwrap();
    // duplicate join rejected
    assert!(matches!(exec(&rtr, &join), Err(CtlError::Duplicate(_))));

    let mut leave = CtlPkt::request(CtlType::Leave, 51);
    leave.set(CtlAttr::Comtree, 5).set_adr(CtlAttr::LeafAdr, leaf);
    exec(&rtr, &leave).unwrap();
    // after leaving, joining again works
    exec(&rtr, &join).unwrap();
}

#[test]
fn comtree_build_primitives_refused() {
    let rtr = new_router();
    for typ in [CtlType::AddBranch, CtlType::Prune, CtlType::Confirm, CtlType::Abort] {
        let cp = CtlPkt::request(typ, 60);
        assert!(matches!(exec(&rtr, &cp), Err(CtlError::InvalidParameter(_))));
    }
}

#[test]
fn set_listings_page_through_links() {
    let rtr = new_router();
    add_iface(&rtr, 1, RateSpec::uniform(10_000));
    for host in 2..15u8 {
        add_leaf_link(&rtr, 1, host, 30001);
    }

    let mut cp = CtlPkt::request(CtlType::GetLinkSet, 70);
    cp.set(CtlAttr::Count, 100); // clamped to 10
    let r = exec(&rtr, &cp).unwrap();
    assert_eq!(r.get(CtlAttr::Count), Some(10));
    let next = r.require(CtlAttr::NextId).unwrap();
    assert_ne!(next, 0);
    assert_eq!(r.text.as_ref().unwrap().lines().count(), 10);

    let mut cp = CtlPkt::request(CtlType::GetLinkSet, 71);
    cp.set(CtlAttr::Link, next).set(CtlAttr::Count, 100);
    let r = exec(&rtr, &cp).unwrap();
    assert_eq!(r.get(CtlAttr::Count), Some(3));
    assert_eq!(r.get(CtlAttr::NextId), Some(0));
}

#[test]
fn filter_catalogue_round_trip() {
    let rtr = new_router();
    let add = CtlPkt::request(CtlType::AddFilter, 80);
    let r = exec(&rtr, &add).unwrap();
    let fx = r.require(CtlAttr::Filter).unwrap();

    let mut m = CtlPkt::request(CtlType::ModFilter, 81);
    m.set(CtlAttr::Filter, fx).set_text("comtree=5");
    exec(&rtr, &m).unwrap();

    let mut g = CtlPkt::request(CtlType::GetFilter, 82);
    g.set(CtlAttr::Filter, fx);
    let r = exec(&rtr, &g).unwrap();
    assert_eq!(r.text.as_deref(), Some("comtree=5"));

    let mut en = CtlPkt::request(CtlType::EnablePacketLog, 83);
    en.set(CtlAttr::Enable, 1);
    exec(&rtr, &en).unwrap();
    assert!(rtr.pktlog.is_enabled());

    let mut d = CtlPkt::request(CtlType::DropFilter, 84);
    d.set(CtlAttr::Filter, fx);
    exec(&rtr, &d).unwrap();
    let mut g = CtlPkt::request(CtlType::GetFilter, 85);
    g.set(CtlAttr::Filter, fx);
    assert!(matches!(exec(&rtr, &g), Err(CtlError::NotFound(_))));
}

#[test]
fn leaf_range_operation() {
    let rtr = new_router();
    let mut cp = CtlPkt::request(CtlType::SetLeafRange, 90);
    cp.set_adr(CtlAttr::FirstLeafAdr, ForestAdr::new(2, 500))
        .set_adr(CtlAttr::LastLeafAdr, ForestAdr::new(2, 600));
    exec(&rtr, &cp).unwrap();
    assert_eq!(rtr.lt.lock().unwrap().leaf_range(), (500, 600));

    // wrong zip refused
    let mut cp = CtlPkt::request(CtlType::SetLeafRange, 91);
    cp.set_adr(CtlAttr::FirstLeafAdr, ForestAdr::new(3, 1))
        .set_adr(CtlAttr::LastLeafAdr, ForestAdr::new(3, 10));
    assert!(matches!(exec(&rtr, &cp), Err(CtlError::InvalidParameter(_))));
}
