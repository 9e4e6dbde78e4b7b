//! Interface table.
//!
//! A logical interface binds a local (ip, port) and carries an aggregate
//! rate budget. The rates of all links homed on an interface must fit
//! inside the interface's configured rates; `avail` tracks the remaining
//! budget and is adjusted atomically with every link add, drop and modify.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use forest_proto::rate::RateSpec;
use serde::Serialize;

use crate::error::CtlError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IfaceEntry {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub rates: RateSpec,
    pub avail: RateSpec,
}

#[derive(Debug, Default)]
pub struct IfaceTable {
    entries: BTreeMap<u32, IfaceEntry>,
}

impl IfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, iface: u32, ip: Ipv4Addr, port: u16, rates: RateSpec) -> Result<(), CtlError> {
        if iface == 0 {
            return Err(CtlError::InvalidParameter("interface number must be non-zero".into()));
        }
        if self.entries.contains_key(&iface) {
            return Err(CtlError::Duplicate(format!(
                "requested interface {iface} conflicts with existing interface"
            )));
        }
        self.entries.insert(iface, IfaceEntry { ip, port, rates, avail: rates });
        Ok(())
    }

    pub fn remove(&mut self, iface: u32) -> Option<IfaceEntry> {
        self.entries.remove(&iface)
    }

    pub fn contains(&self, iface: u32) -> bool {
        self.entries.contains_key(&iface)
    }

    pub fn get(&self, iface: u32) -> Option<&IfaceEntry> {
        self.entries.get(&iface)
    }

    pub fn get_mut(&mut self, iface: u32) -> Option<&mut IfaceEntry> {
        self.entries.get_mut(&iface)
    }

    /// Change an interface's configured rates. The portion already
    /// committed to links is preserved; fails without side effects if the
    /// new rates cannot cover it.
    pub fn set_rates(&mut self, iface: u32, rates: RateSpec) -> Result<(), CtlError> {
        let entry = self
            .entries
            .get_mut(&iface)
            .ok_or_else(|| CtlError::NotFound(format!("invalid interface {iface}")))?;
        let mut used = entry.rates;
        used.subtract(&entry.avail);
        if !used.leq(&rates) {
            return Err(CtlError::NoCapacity(format!(
                "interface {iface} has {used} committed to links, cannot shrink to {rates}"
            )));
        }
        let mut avail = rates;
        avail.subtract(&used);
        entry.rates = rates;
        entry.avail = avail;
        Ok(())
    }

    /// Reserve `rates` out of the interface budget. Fails without side
    /// effects when the budget cannot cover the request.
    pub fn reserve(&mut self, iface: u32, rates: &RateSpec) -> Result<(), CtlError> {
        let entry = self
            .entries
            .get_mut(&iface)
            .ok_or_else(|| CtlError::NotFound(format!("invalid interface {iface}")))?;
        if !rates.leq(&entry.avail) {
            return Err(CtlError::NoCapacity(format!(
                "request {rates} exceeds interface capacity {}",
                entry.avail
            )));
        }
        entry.avail.subtract(rates);
        Ok(())
    }

    /// Return a previously reserved allocation to the interface budget.
    pub fn release(&mut self, iface: u32, rates: &RateSpec) {
        if let Some(entry) = self.entries.get_mut(&iface) {
            entry.avail.add(rates);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &IfaceEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Page of entries starting at `from` (0 means the first), in id
    /// order. Returns the entries and the id following the page, or 0
    /// when the table is exhausted.
    pub fn page(&self, from: u32, count: usize) -> (Vec<(u32, IfaceEntry)>, u32) {
        let mut out = Vec::with_capacity(count);
        let mut it = self.entries.range(from.max(1)..);
        for (id, e) in it.by_ref().take(count) {
            out.push((*id, e.clone()));
        }
        let next = it.next().map(|(id, _)| *id).unwrap_or(0);
        (out, next)
    }
}
