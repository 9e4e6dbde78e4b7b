//! The four shared tables of the router.
//!
//! Each table lives behind its own mutex on [`crate::router::Router`].
//! Multi-table mutations must acquire locks in the canonical order
//! interface → link → comtree → route; the combination helpers on
//! `Router` encode that order so no handler acquires ad hoc.

pub mod comtree;
pub mod iface;
pub mod link;
pub mod route;

pub use comtree::{ClnkInfo, ComtreeEntry, ComtreeTable, JoinState};
pub use iface::{IfaceEntry, IfaceTable};
pub use link::{LinkEntry, LinkTable};
pub use route::RouteTable;
