//! Route table.
//!
//! Maps (comtree, destination) to the set of links a packet should be
//! forwarded on. Unicast destinations carry at most one link and are
//! aggregated to the (zip, 0) router address when the destination's zip
//! differs from this router's — one route per foreign zip instead of one
//! per foreign host. Multicast destinations carry the subscriber fan-out.

use std::collections::{BTreeMap, BTreeSet};

use forest_proto::addr::ForestAdr;

use crate::error::CtlError;

#[derive(Debug, Default)]
pub struct RouteTable {
    my_zip: u16,
    routes: BTreeMap<(u32, u32), BTreeSet<u32>>,
}

impl RouteTable {
    pub fn new(my_adr: ForestAdr) -> Self {
        RouteTable { my_zip: my_adr.zip(), routes: BTreeMap::new() }
    }

    /// Key normalization: foreign-zip unicast destinations collapse to
    /// their zip's router address.
    fn key(&self, comt: u32, dst: ForestAdr) -> (u32, u32) {
        if dst.valid_ucast() && dst.zip() != self.my_zip {
            (comt, dst.zip_router().raw())
        } else {
            (comt, dst.raw())
        }
    }

    /// Install a route. Multicast routes may start with an empty link set
    /// (`link == 0`).
    pub fn add(&mut self, comt: u32, dst: ForestAdr, link: u32) -> Result<(), CtlError> {
        if !dst.valid_ucast() && !dst.is_multicast() {
            return Err(CtlError::InvalidParameter(format!("invalid address {dst}")));
        }
        if dst.valid_ucast() && link == 0 {
            return Err(CtlError::InvalidParameter("unicast route needs a link".into()));
        }
        let key = self.key(comt, dst);
        if self.routes.contains_key(&key) {
            return Err(CtlError::Duplicate(format!(
                "requested route ({comt},{dst}) conflicts with existing route"
            )));
        }
        let mut links = BTreeSet::new();
        if link != 0 {
            links.insert(link);
        }
        self.routes.insert(key, links);
        Ok(())
    }

    pub fn remove(&mut self, comt: u32, dst: ForestAdr) -> Option<BTreeSet<u32>> {
        let key = self.key(comt, dst);
        self.routes.remove(&key)
    }

    /// Look up the forwarding set: the exact key first, then — for a
    /// foreign-zip unicast destination — the (zip, 0) aggregate.
    pub fn lookup(&self, comt: u32, dst: ForestAdr) -> Option<&BTreeSet<u32>> {
        if let Some(links) = self.routes.get(&(comt, dst.raw())) {
            return Some(links);
        }
        if dst.valid_ucast() && dst.zip() != self.my_zip {
            return self.routes.get(&(comt, dst.zip_router().raw()));
        }
        None
    }

    pub fn get(&self, comt: u32, dst: ForestAdr) -> Option<&BTreeSet<u32>> {
        self.routes.get(&self.key(comt, dst))
    }

    /// Add a subscriber link to a multicast route.
    pub fn add_link(&mut self, comt: u32, dst: ForestAdr, link: u32) -> Result<(), CtlError> {
        if !dst.is_multicast() {
            return Err(CtlError::InvalidParameter(format!(
                "cannot add link to unicast route {dst}"
            )));
        }
        let links = self
            .routes
            .get_mut(&(comt, dst.raw()))
            .ok_or_else(|| CtlError::NotFound(format!("no route for ({comt},{dst})")))?;
        links.insert(link);
        Ok(())
    }

    /// Drop a subscriber link from a multicast route; the route goes away
    /// when its last link does.
    pub fn drop_link(&mut self, comt: u32, dst: ForestAdr, link: u32) -> Result<(), CtlError> {
        if !dst.is_multicast() {
            return Err(CtlError::InvalidParameter(format!(
                "cannot drop link from unicast route {dst}"
            )));
        }
        let links = self
            .routes
            .get_mut(&(comt, dst.raw()))
            .ok_or_else(|| CtlError::NotFound(format!("no route for ({comt},{dst})")))?;
        links.remove(&link);
        if links.is_empty() {
            self.routes.remove(&(comt, dst.raw()));
        }
        Ok(())
    }

    /// Point a unicast route at a different link.
    pub fn set_link(&mut self, comt: u32, dst: ForestAdr, link: u32) -> Result<(), CtlError> {
        if dst.is_multicast() {
            return Err(CtlError::InvalidParameter(
                "cannot set link in multicast route".into(),
            ));
        }
        let key = self.key(comt, dst);
        let links = self
            .routes
            .get_mut(&key)
            .ok_or_else(|| CtlError::NotFound(format!("no route for ({comt},{dst})")))?;
        links.clear();
        links.insert(link);
        Ok(())
    }

    /// Remove a link from every route in a comtree, dropping routes that
    /// become linkless. Called when a link leaves the comtree.
    pub fn purge(&mut self, comt: u32, link: u32) {
        let keys: Vec<(u32, u32)> = self
            .routes
            .range((comt, 0)..=(comt, u32::MAX))
            .filter(|(_, links)| links.contains(&link))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(links) = self.routes.get_mut(&key) {
                links.remove(&link);
                if links.is_empty() {
                    self.routes.remove(&key);
                }
            }
        }
    }

    /// Remove every route in a comtree.
    pub fn purge_comtree(&mut self, comt: u32) {
        let keys: Vec<(u32, u32)> = self
            .routes
            .range((comt, 0)..=(comt, u32::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.routes.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ((u32, ForestAdr), &BTreeSet<u32>)> {
        self.routes
            .iter()
            .map(|((c, a), links)| ((*c, ForestAdr::from_raw(*a)), links))
    }

    /// Page of routes in key order, starting after `from` (None means the
    /// beginning). Returns the page and the continuation key.
    pub fn page(
        &self,
        from: Option<(u32, ForestAdr)>,
        count: usize,
    ) -> (Vec<(u32, ForestAdr, BTreeSet<u32>)>, Option<(u32, ForestAdr)>) {
        let start = from.map(|(c, a)| (c, a.raw())).unwrap_or((0, 0));
        let mut out = Vec::with_capacity(count);
        let mut it = self.routes.range(start..);
        for ((c, a), links) in it.by_ref().take(count) {
            out.push((*c, ForestAdr::from_raw(*a), links.clone()));
        }
        let next = it.next().map(|((c, a), _)| (*c, ForestAdr::from_raw(*a)));
        (out, next)
    }
}
