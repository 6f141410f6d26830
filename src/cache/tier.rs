//! Cache tiers.

use serde::{Deserialize, Serialize};

/// Which tier a cached balance currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Tier 0: recently written or re-read (short TTL).
    Hot,
    /// Tier 1: aged out of hot or displaced by newer hot entries.
    Warm,
    /// Tier 2: read-through from the store, or aged out of warm.
    Cold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> usize {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }

    /// Returns the next colder tier, or None if already coldest.
    pub fn demote(&self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live entry counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSizes {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
}

impl TierSizes {
    pub fn total(&self) -> usize {
        self.hot + self.warm + self.cold
    }

    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Hot => self.hot,
            Tier::Warm => self.warm,
            Tier::Cold => self.cold,
        }
    }

    pub(crate) fn add(&mut self, tier: Tier, n: usize) {
        match tier {
            Tier::Hot => self.hot += n,
            Tier::Warm => self.warm += n,
            Tier::Cold => self.cold += n,
        }
    }
}
