//! Startup configuration.
//!
//! The router reads a TOML file naming its forest address, the substrate
//! bind point, and the initial interfaces, links, comtrees and routes.
//! Input structs deserialize loosely; [`RouterConfigInput::validate`]
//! turns them into a [`RouterConfig`] and enforces the loader invariant:
//! every link referenced by a comtree-link exists, and every comtree
//! referenced by a route exists.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use forest_proto::addr::{ForestAdr, PeerType};
use forest_proto::rate::RateSpec;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterConfigInput {
    pub version: u32,
    /// This router's forest address, `zip.0` notation.
    pub address: String,
    pub bind_ip: Option<Ipv4Addr>,
    pub bind_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub workers: Option<usize>,
    pub store_capacity: Option<usize>,
    /// Local parts of the leaf address range, inclusive.
    pub leaf_first: Option<u16>,
    pub leaf_last: Option<u16>,
    pub ifaces: Vec<IfaceConfigInput>,
    pub links: Vec<LinkConfigInput>,
    pub comtrees: Vec<ComtreeConfigInput>,
    pub routes: Vec<RouteConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IfaceConfigInput {
    pub iface: u32,
    pub ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub rates: Option<RateSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkConfigInput {
    /// 0 lets the router pick the link number.
    pub link: u32,
    pub iface: u32,
    pub peer_ip: Option<Ipv4Addr>,
    pub peer_port: Option<u16>,
    /// "router", "leaf" or "controller".
    pub peer_type: Option<String>,
    pub peer_adr: Option<String>,
    pub nonce: Option<u64>,
    pub rates: Option<RateSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComtreeConfigInput {
    pub comtree: u32,
    pub core: bool,
    pub parent_link: Option<u32>,
    pub links: Vec<ComtreeLinkConfigInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComtreeLinkConfigInput {
    pub link: u32,
    pub core: bool,
    pub rates: Option<RateSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteConfigInput {
    pub comtree: u32,
    /// `zip.local` or `&group` notation.
    pub dest: String,
    pub links: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: {0}")]
    Invalid(String),
    #[error("config references undefined link {0}")]
    UndefinedLink(u32),
    #[error("config references undefined comtree {0}")]
    UndefinedComtree(u32),
    #[error("config references undefined interface {0}")]
    UndefinedIface(u32),
}

// ─── Validated configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub address: ForestAdr,
    pub bind_ip: Ipv4Addr,
    pub bind_port: u16,
    pub admin_port: u16,
    pub workers: usize,
    pub store_capacity: usize,
    pub leaf_range: (u16, u16),
    pub ifaces: Vec<IfaceConfig>,
    pub links: Vec<LinkConfig>,
    pub comtrees: Vec<ComtreeConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone)]
pub struct IfaceConfig {
    pub iface: u32,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub rates: RateSpec,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub link: u32,
    pub iface: u32,
    pub peer: Option<(Ipv4Addr, u16)>,
    pub peer_type: PeerType,
    pub peer_adr: ForestAdr,
    pub nonce: u64,
    pub rates: RateSpec,
}

#[derive(Debug, Clone)]
pub struct ComtreeConfig {
    pub comtree: u32,
    pub core: bool,
    pub parent_link: u32,
    pub links: Vec<ComtreeLinkConfig>,
}

#[derive(Debug, Clone)]
pub struct ComtreeLinkConfig {
    pub link: u32,
    pub core: bool,
    pub rates: RateSpec,
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub comtree: u32,
    pub dest: ForestAdr,
    pub links: Vec<u32>,
}

impl RouterConfigInput {
    pub fn validate(self) -> Result<RouterConfig, ConfigError> {
        let address: ForestAdr = self
            .address
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bad router address: {e}")))?;
        if !address.is_router() {
            return Err(ConfigError::Invalid(format!(
                "{address} is not a router address (local part must be zero)"
            )));
        }

        let mut ifaces = Vec::new();
        for i in &self.ifaces {
            if i.iface == 0 {
                return Err(ConfigError::Invalid("interface number must be non-zero".into()));
            }
            ifaces.push(IfaceConfig {
                iface: i.iface,
                ip: i.ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
                port: i.port.unwrap_or(0),
                rates: i.rates.unwrap_or(RateSpec::uniform(10_000)).clamped(),
            });
        }

        let mut links = Vec::new();
        for l in &self.links {
            if !ifaces.iter().any(|i| i.iface == l.iface) {
                return Err(ConfigError::UndefinedIface(l.iface));
            }
            let peer_type = match l.peer_type.as_deref() {
                None | Some("leaf") => PeerType::Leaf,
                Some("router") => PeerType::Router,
                Some("controller") => PeerType::Controller,
                Some(other) => {
                    return Err(ConfigError::Invalid(format!("unknown peer type {other:?}")))
                }
            };
            let peer_adr = match &l.peer_adr {
                Some(s) => s
                    .parse()
                    .map_err(|e| ConfigError::Invalid(format!("bad peer address: {e}")))?,
                None => ForestAdr::NONE,
            };
            let peer = match (l.peer_ip, l.peer_port) {
                (Some(ip), Some(port)) if port != 0 => Some((ip, port)),
                _ => None,
            };
            if peer.is_none() && l.nonce.unwrap_or(0) == 0 {
                return Err(ConfigError::Invalid(format!(
                    "link {} needs a peer endpoint or a nonce",
                    l.link
                )));
            }
            links.push(LinkConfig {
                link: l.link,
                iface: l.iface,
                peer,
                peer_type,
                peer_adr,
                nonce: l.nonce.unwrap_or(0),
                rates: l.rates.unwrap_or(RateSpec::minimum()).clamped(),
            });
        }

        let link_defined =
            |n: u32| n != 0 && links.iter().any(|l| l.link == n);

        let mut comtrees = Vec::new();
        for c in &self.comtrees {
            if c.comtree == 0 {
                return Err(ConfigError::Invalid("comtree number must be non-zero".into()));
            }
            let mut clinks = Vec::new();
            for cl in &c.links {
                if !link_defined(cl.link) {
                    return Err(ConfigError::UndefinedLink(cl.link));
                }
                clinks.push(ComtreeLinkConfig {
                    link: cl.link,
                    core: cl.core,
                    rates: cl.rates.unwrap_or(RateSpec::minimum()).clamped(),
                });
            }
            let parent = c.parent_link.unwrap_or(0);
            if parent != 0 && !clinks.iter().any(|cl| cl.link == parent) {
                return Err(ConfigError::Invalid(format!(
                    "comtree {} parent link {parent} is not a member",
                    c.comtree
                )));
            }
            comtrees.push(ComtreeConfig {
                comtree: c.comtree,
                core: c.core,
                parent_link: parent,
                links: clinks,
            });
        }

        let mut routes = Vec::new();
        for r in &self.routes {
            if !comtrees.iter().any(|c| c.comtree == r.comtree) {
                return Err(ConfigError::UndefinedComtree(r.comtree));
            }
            let dest: ForestAdr = r
                .dest
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("bad route destination: {e}")))?;
            for l in &r.links {
                if !link_defined(*l) {
                    return Err(ConfigError::UndefinedLink(*l));
                }
            }
            routes.push(RouteConfig { comtree: r.comtree, dest, links: r.links.clone() });
        }

        let leaf_first = self.leaf_first.unwrap_or(1);
        let leaf_last = self.leaf_last.unwrap_or(0xefff);
        if leaf_first == 0 || leaf_first > leaf_last {
            return Err(ConfigError::Invalid(format!(
                "bad leaf range {leaf_first}..{leaf_last}"
            )));
        }

        Ok(RouterConfig {
            address,
            bind_ip: self.bind_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            bind_port: self.bind_port.unwrap_or(0),
            admin_port: self.admin_port.unwrap_or(0),
            workers: self.workers.unwrap_or(2).max(1),
            store_capacity: self.store_capacity.unwrap_or(4096),
            leaf_range: (leaf_first, leaf_last),
            ifaces,
            links,
            comtrees,
            routes,
        })
    }
}

/// Read and validate a configuration file.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<RouterConfig> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let input: RouterConfigInput = toml::from_str(&text)?;
    Ok(input.validate()?)
}
