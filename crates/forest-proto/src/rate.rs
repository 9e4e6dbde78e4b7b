//! Rate specifications.
//!
//! Every interface, link and comtree-link carries a four-component rate
//! budget: bit rate and packet rate, each in both directions. "Up" points
//! toward the comtree root, "down" toward the leaves. Budgets are compared
//! and adjusted componentwise; a consumer fits inside a provider exactly
//! when `consumer.leq(&provider)` holds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Smallest admissible bit rate, Kb/s.
pub const MIN_BITRATE: i32 = 50;
/// Largest admissible bit rate, Kb/s.
pub const MAX_BITRATE: i32 = 1_000_000;
/// Smallest admissible packet rate, packets/s.
pub const MIN_PKTRATE: i32 = 25;
/// Largest admissible packet rate, packets/s.
pub const MAX_PKTRATE: i32 = 500_000;

/// Bit and packet rates in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateSpec {
    /// Upstream bit rate, Kb/s.
    pub bit_up: i32,
    /// Downstream bit rate, Kb/s.
    pub bit_down: i32,
    /// Upstream packet rate, packets/s.
    pub pkt_up: i32,
    /// Downstream packet rate, packets/s.
    pub pkt_down: i32,
}

impl RateSpec {
    pub const fn new(bit_up: i32, bit_down: i32, pkt_up: i32, pkt_down: i32) -> Self {
        RateSpec { bit_up, bit_down, pkt_up, pkt_down }
    }

    /// All four components set to the same value.
    pub const fn uniform(r: i32) -> Self {
        RateSpec::new(r, r, r, r)
    }

    /// The minimum admissible rate spec. Freshly added links and
    /// comtree-links start here.
    pub const fn minimum() -> Self {
        RateSpec::new(MIN_BITRATE, MIN_BITRATE, MIN_PKTRATE, MIN_PKTRATE)
    }

    pub fn is_zero(&self) -> bool {
        self.bit_up == 0 && self.bit_down == 0 && self.pkt_up == 0 && self.pkt_down == 0
    }

    /// Swap the up/down direction of both rates.
    pub fn flip(&mut self) {
        std::mem::swap(&mut self.bit_up, &mut self.bit_down);
        std::mem::swap(&mut self.pkt_up, &mut self.pkt_down);
    }

    pub fn add(&mut self, rhs: &RateSpec) {
        self.bit_up += rhs.bit_up;
        self.bit_down += rhs.bit_down;
        self.pkt_up += rhs.pkt_up;
        self.pkt_down += rhs.pkt_down;
    }

    pub fn subtract(&mut self, rhs: &RateSpec) {
        self.bit_up -= rhs.bit_up;
        self.bit_down -= rhs.bit_down;
        self.pkt_up -= rhs.pkt_up;
        self.pkt_down -= rhs.pkt_down;
    }

    /// Componentwise less-or-equal.
    pub fn leq(&self, rhs: &RateSpec) -> bool {
        self.bit_up <= rhs.bit_up
            && self.bit_down <= rhs.bit_down
            && self.pkt_up <= rhs.pkt_up
            && self.pkt_down <= rhs.pkt_down
    }

    /// True when no component is negative.
    pub fn nonnegative(&self) -> bool {
        self.bit_up >= 0 && self.bit_down >= 0 && self.pkt_up >= 0 && self.pkt_down >= 0
    }

    /// Clamp every component into its admissible range.
    pub fn clamped(self) -> Self {
        RateSpec {
            bit_up: self.bit_up.clamp(MIN_BITRATE, MAX_BITRATE),
            bit_down: self.bit_down.clamp(MIN_BITRATE, MAX_BITRATE),
            pkt_up: self.pkt_up.clamp(MIN_PKTRATE, MAX_PKTRATE),
            pkt_down: self.pkt_down.clamp(MIN_PKTRATE, MAX_PKTRATE),
        }
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.bit_up, self.bit_down, self.pkt_up, self.pkt_down
        )
    }
}
