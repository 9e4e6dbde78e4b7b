//! Comtree table.
//!
//! A comtree is a distribution tree identified by a comtree number. The
//! router participates through a set of *comtree-links*: (comtree, link)
//! pairs that each own a rate budget carved out of the link, a queue, and
//! role flags (core member, parent direction, router peer).
//!
//! The table also tracks leaf membership per comtree through a small
//! state machine so duplicate joins are rejected and rate accounting with
//! the external comtree controller stays ordered:
//!
//! ```text
//!   absent ──join──▶ Pending ──ack──▶ Joined ──leave──▶ Leaving ──ack──▶ absent
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use forest_proto::addr::ForestAdr;
use forest_proto::rate::RateSpec;

use crate::error::CtlError;

/// Per-comtree-link state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClnkInfo {
    pub rates: RateSpec,
    /// Queue bound to this comtree-link; owned by the comtree-link's link.
    pub qid: u32,
    /// Peer on this link is another router.
    pub is_rtr: bool,
    /// Peer is a core node of the comtree.
    pub is_core: bool,
    /// Destination restriction for packets from this peer (0 = none).
    pub dest: ForestAdr,
}

#[derive(Debug, Clone, Default)]
pub struct ComtreeEntry {
    pub core_flag: bool,
    /// Link toward the comtree root (0 = this router is the root or the
    /// parent is not yet set).
    pub parent_link: u32,
    pub links: BTreeMap<u32, ClnkInfo>,
}

/// Leaf membership progress at this router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Pending,
    Joined,
    Leaving,
}

#[derive(Debug, Default)]
pub struct ComtreeTable {
    entries: BTreeMap<u32, ComtreeEntry>,
    /// link → comtrees that include it; drives cascade drops.
    link_index: HashMap<u32, BTreeSet<u32>>,
    members: HashMap<(u32, ForestAdr), JoinState>,
}

impl ComtreeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an empty comtree. Adding an existing comtree is a no-op
    /// success, matching controller retries.
    pub fn add(&mut self, comt: u32) -> Result<(), CtlError> {
        if comt == 0 {
            return Err(CtlError::InvalidParameter("comtree number must be non-zero".into()));
        }
        self.entries.entry(comt).or_default();
        Ok(())
    }

    pub fn contains(&self, comt: u32) -> bool {
        self.entries.contains_key(&comt)
    }

    pub fn get(&self, comt: u32) -> Option<&ComtreeEntry> {
        self.entries.get(&comt)
    }

    pub fn get_mut(&mut self, comt: u32) -> Option<&mut ComtreeEntry> {
        self.entries.get_mut(&comt)
    }

    /// Remove a comtree entry. The caller is responsible for having
    /// released queues, rates and routes first (the control handler
    /// cascades in that order).
    pub fn remove(&mut self, comt: u32) -> Option<ComtreeEntry> {
        let entry = self.entries.remove(&comt)?;
        for link in entry.links.keys() {
            let empty = match self.link_index.get_mut(link) {
                Some(set) => {
                    set.remove(&comt);
                    set.is_empty()
                }
                None => false,
            };
            if empty {
                self.link_index.remove(link);
            }
        }
        self.members.retain(|(c, _), _| *c != comt);
        Some(entry)
    }

    /// Register a link as a member of a comtree.
    pub fn add_link(
        &mut self,
        comt: u32,
        link: u32,
        is_rtr: bool,
        is_core: bool,
    ) -> Result<(), CtlError> {
        let entry = self
            .entries
            .get_mut(&comt)
            .ok_or_else(|| CtlError::NotFound(format!("invalid comtree {comt}")))?;
        if entry.links.contains_key(&link) {
            return Err(CtlError::Duplicate(format!(
                "link {link} already in comtree {comt}"
            )));
        }
        entry.links.insert(
            link,
            ClnkInfo { rates: RateSpec::default(), qid: 0, is_rtr, is_core, dest: ForestAdr::NONE },
        );
        self.link_index.entry(link).or_default().insert(comt);
        Ok(())
    }

    pub fn remove_link(&mut self, comt: u32, link: u32) -> Option<ClnkInfo> {
        let entry = self.entries.get_mut(&comt)?;
        let info = entry.links.remove(&link)?;
        if entry.parent_link == link {
            entry.parent_link = 0;
        }
        let empty = match self.link_index.get_mut(&link) {
            Some(set) => {
                set.remove(&comt);
                set.is_empty()
            }
            None => false,
        };
        if empty {
            self.link_index.remove(&link);
        }
        Some(info)
    }

    pub fn clnk(&self, comt: u32, link: u32) -> Option<&ClnkInfo> {
        self.entries.get(&comt)?.links.get(&link)
    }

    pub fn clnk_mut(&mut self, comt: u32, link: u32) -> Option<&mut ClnkInfo> {
        self.entries.get_mut(&comt)?.links.get_mut(&link)
    }

    /// Comtrees that include the given link, in ascending order.
    pub fn comtrees_for_link(&self, link: u32) -> Vec<u32> {
        self.link_index
            .get(&link)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &ComtreeEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Page of comtrees starting at `from` (0 means the first).
    pub fn page(&self, from: u32, count: usize) -> (Vec<(u32, ComtreeEntry)>, u32) {
        let mut out = Vec::with_capacity(count);
        let mut it = self.entries.range(from.max(1)..);
        for (id, e) in it.by_ref().take(count) {
            out.push((*id, e.clone()));
        }
        let next = it.next().map(|(id, _)| *id).unwrap_or(0);
        (out, next)
    }

    // ─── Leaf membership ────────────────────────────────────────────────

    pub fn member_state(&self, comt: u32, leaf: ForestAdr) -> Option<JoinState> {
        self.members.get(&(comt, leaf)).copied()
    }

    /// A leaf asks to join. Rejected while a join is pending or complete.
    pub fn join_request(&mut self, comt: u32, leaf: ForestAdr) -> Result<(), CtlError> {
        if !self.entries.contains_key(&comt) {
            return Err(CtlError::NotFound(format!("invalid comtree {comt}")));
        }
        match self.members.get(&(comt, leaf)) {
            Some(JoinState::Pending) | Some(JoinState::Joined) => Err(CtlError::Duplicate(
                format!("{leaf} already joining or joined comtree {comt}"),
            )),
            Some(JoinState::Leaving) => Err(CtlError::InvalidParameter(format!(
                "{leaf} still leaving comtree {comt}"
            ))),
            None => {
                self.members.insert((comt, leaf), JoinState::Pending);
                Ok(())
            }
        }
    }

    /// Controller acknowledged the join (or refused it).
    pub fn join_commit(&mut self, comt: u32, leaf: ForestAdr, accepted: bool) -> Result<(), CtlError> {
        match self.members.get(&(comt, leaf)) {
            Some(JoinState::Pending) => {
                if accepted {
                    self.members.insert((comt, leaf), JoinState::Joined);
                } else {
                    self.members.remove(&(comt, leaf));
                }
                Ok(())
            }
            _ => Err(CtlError::NotFound(format!("no pending join for {leaf} in comtree {comt}"))),
        }
    }

    /// A joined leaf asks to leave.
    pub fn leave_request(&mut self, comt: u32, leaf: ForestAdr) -> Result<(), CtlError> {
        match self.members.get(&(comt, leaf)) {
            Some(JoinState::Joined) => {
                self.members.insert((comt, leaf), JoinState::Leaving);
                Ok(())
            }
            Some(JoinState::Leaving) => Err(CtlError::Duplicate(format!(
                "{leaf} already leaving comtree {comt}"
            ))),
            _ => Err(CtlError::NotFound(format!("{leaf} is not joined to comtree {comt}"))),
        }
    }

    /// Controller acknowledged the leave.
    pub fn leave_commit(&mut self, comt: u32, leaf: ForestAdr) -> Result<(), CtlError> {
        match self.members.get(&(comt, leaf)) {
            Some(JoinState::Leaving) => {
                self.members.remove(&(comt, leaf));
                Ok(())
            }
            _ => Err(CtlError::NotFound(format!("no pending leave for {leaf} in comtree {comt}"))),
        }
    }
}
