//! # Packet Log
//!
//! Filter-driven packet capture for remote debugging. A controller
//! installs filters matching on links, comtree, type and addresses; when
//! logging is enabled, packets crossing the data plane that match a
//! filter are summarized into a bounded ring, which the controller drains
//! with `GetLoggedPackets`.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use slab::Slab;

use forest_proto::addr::ForestAdr;
use forest_proto::pool::Packet;
use forest_proto::wire::PktType;

use crate::error::CtlError;

const MAX_FILTERS: usize = 64;
const LOG_CAPACITY: usize = 1024;

// ─── PacketFilter ────────────────────────────────────────────────────────────

/// Match criteria; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketFilter {
    pub in_link: Option<u32>,
    pub out_link: Option<u32>,
    pub comtree: Option<u32>,
    pub typ: Option<PktType>,
    pub src: Option<ForestAdr>,
    pub dst: Option<ForestAdr>,
}

impl PacketFilter {
    pub fn matches(&self, pkt: &Packet) -> bool {
        if let Some(l) = self.in_link {
            if pkt.in_link != l {
                return false;
            }
        }
        if let Some(l) = self.out_link {
            if pkt.out_link != l {
                return false;
            }
        }
        if let Some(c) = self.comtree {
            if pkt.hdr.comtree != c {
                return false;
            }
        }
        if let Some(t) = self.typ {
            if pkt.hdr.typ != t {
                return false;
            }
        }
        if let Some(a) = self.src {
            if pkt.hdr.src != a {
                return false;
            }
        }
        if let Some(a) = self.dst {
            if pkt.hdr.dst != a {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for PacketFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        let mut field = |f: &mut fmt::Formatter<'_>, name: &str, v: String| -> fmt::Result {
            if wrote {
                write!(f, " ")?;
            }
            wrote = true;
            write!(f, "{name}={v}")
        };
        if let Some(l) = self.in_link {
            field(f, "in", l.to_string())?;
        }
        if let Some(l) = self.out_link {
            field(f, "out", l.to_string())?;
        }
        if let Some(c) = self.comtree {
            field(f, "comtree", c.to_string())?;
        }
        if let Some(t) = self.typ {
            field(f, "type", (t.code()).to_string())?;
        }
        if let Some(a) = self.src {
            field(f, "src", a.to_string())?;
        }
        if let Some(a) = self.dst {
            field(f, "dst", a.to_string())?;
        }
        if !wrote {
            write!(f, "any")?;
        }
        Ok(())
    }
}

impl FromStr for PacketFilter {
    type Err = CtlError;

    /// Parse `key=value` pairs separated by whitespace; `any` clears all
    /// criteria.
    fn from_str(s: &str) -> Result<Self, CtlError> {
        let mut filter = PacketFilter::default();
        let s = s.trim();
        if s.is_empty() || s == "any" {
            return Ok(filter);
        }
        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| CtlError::InvalidParameter(format!("bad filter token {token:?}")))?;
            let bad = || CtlError::InvalidParameter(format!("bad filter value {value:?}"));
            match key {
                "in" => filter.in_link = Some(value.parse().map_err(|_| bad())?),
                "out" => filter.out_link = Some(value.parse().map_err(|_| bad())?),
                "comtree" => filter.comtree = Some(value.parse().map_err(|_| bad())?),
                "type" => {
                    let code: u8 = value.parse().map_err(|_| bad())?;
                    filter.typ = Some(PktType::from_code(code).ok_or_else(bad)?);
                }
                "src" => filter.src = Some(value.parse().map_err(|_| bad())?),
                "dst" => filter.dst = Some(value.parse().map_err(|_| bad())?),
                _ => {
                    return Err(CtlError::InvalidParameter(format!(
                        "unknown filter field {key:?}"
                    )))
                }
            }
        }
        Ok(filter)
    }
}

// ─── PacketLog ───────────────────────────────────────────────────────────────

struct LogInner {
    filters: Slab<PacketFilter>,
    enabled: bool,
    local_echo: bool,
    ring: std::collections::VecDeque<String>,
    dropped: u64,
}

pub struct PacketLog {
    inner: Mutex<LogInner>,
}

impl PacketLog {
    pub fn new() -> Self {
        PacketLog {
            inner: Mutex::new(LogInner {
                filters: Slab::new(),
                enabled: false,
                local_echo: false,
                ring: std::collections::VecDeque::new(),
                dropped: 0,
            }),
        }
    }

    pub fn add_filter(&self) -> Result<u32, CtlError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.filters.len() >= MAX_FILTERS {
            return Err(CtlError::NoCapacity("filter table is full".into()));
        }
        Ok(inner.filters.insert(PacketFilter::default()) as u32 + 1)
    }

    pub fn drop_filter(&self, fx: u32) -> Result<(), CtlError> {
        let mut inner = self.inner.lock().unwrap();
        let key = fx as usize - 1;
        if !inner.filters.contains(key) {
            return Err(CtlError::NotFound(format!("invalid filter {fx}")));
        }
        inner.filters.remove(key);
        Ok(())
    }

    pub fn get_filter(&self, fx: u32) -> Result<PacketFilter, CtlError> {
        let inner = self.inner.lock().unwrap();
        inner
            .filters
            .get(fx as usize - 1)
            .cloned()
            .ok_or_else(|| CtlError::NotFound(format!("invalid filter {fx}")))
    }

    pub fn mod_filter(&self, fx: u32, spec: &str) -> Result<(), CtlError> {
        let parsed: PacketFilter = spec.parse()?;
        let mut inner = self.inner.lock().unwrap();
        match inner.filters.get_mut(fx as usize - 1) {
            Some(slot) => {
                *slot = parsed;
                Ok(())
            }
            None => Err(CtlError::NotFound(format!("invalid filter {fx}"))),
        }
    }

    /// Page of filters starting at `from` (0 = first): formatted entries
    /// plus the continuation id.
    pub fn page(&self, from: u32, count: usize) -> (Vec<(u32, String)>, u32) {
        let inner = self.inner.lock().unwrap();
        let start = from.max(1) as usize - 1;
        let mut ids: Vec<usize> = inner.filters.iter().map(|(k, _)| k).collect();
        ids.sort_unstable();
        let mut out = Vec::new();
        let mut next = 0;
        for key in ids.into_iter().filter(|k| *k >= start) {
            if out.len() == count {
                next = key as u32 + 1;
                break;
            }
            if let Some(filter) = inner.filters.get(key) {
                out.push((key as u32 + 1, filter.to_string()));
            }
        }
        (out, next)
    }

    pub fn enable(&self, on: bool, local_echo: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.enabled = on;
        inner.local_echo = local_echo;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    /// Offer a packet crossing the data plane. Summarized into the ring
    /// when logging is on and some filter matches.
    pub fn offer(&self, pkt: &Packet, dir: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled || !inner.filters.iter().any(|(_, f)| f.matches(pkt)) {
            return;
        }
        let line = format!(
            "{dir} in={} out={} comt={} type={} {}->{} len={}",
            pkt.in_link,
            pkt.out_link,
            pkt.hdr.comtree,
            pkt.hdr.typ.code(),
            pkt.hdr.src,
            pkt.hdr.dst,
            pkt.length(),
        );
        if inner.local_echo {
            tracing::debug!(target: "pktlog", "{line}");
        }
        if inner.ring.len() == LOG_CAPACITY {
            inner.ring.pop_front();
            inner.dropped += 1;
        }
        inner.ring.push_back(line);
    }

    /// Drain logged lines, up to `max_bytes` of formatted text. Returns
    /// the line count and the text.
    pub fn extract(&self, max_bytes: usize) -> (usize, String) {
        let mut inner = self.inner.lock().unwrap();
        let mut text = String::new();
        let mut count = 0;
        loop {
            let fits = match inner.ring.front() {
                Some(line) => text.is_empty() || text.len() + line.len() + 1 <= max_bytes,
                None => false,
            };
            if !fits {
                break;
            }
            if let Some(line) = inner.ring.pop_front() {
                text.push_str(&line);
                text.push('\n');
                count += 1;
            }
        }
        (count, text)
    }
}

impl Default for PacketLog {
    fn default() -> Self {
        Self::new()
    }
}
