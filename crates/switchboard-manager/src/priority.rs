//! Ranked candidate order built from the discovery tiers.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A dispatcher node as learned from discovery. Keyed by `authority`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// `host:port`
    pub authority: String,
    pub shortname: String,
    pub zonename: String,
}

/// Source of a priority group list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Server-ranked list for this user; replaces the other two when non-empty.
    Tailored,
    /// Tailored list remembered from a previous session.
    Cached,
    /// Bootstrap list fetched from a fixed location.
    Fallback,
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Tailored => "tailored",
            Tier::Cached => "cached",
            Tier::Fallback => "fallback",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid list name: {0}")]
pub struct TierParseError(pub String);

impl FromStr for Tier {
    type Err = TierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tailored" => Ok(Tier::Tailored),
            "cached" => Ok(Tier::Cached),
            "fallback" => Ok(Tier::Fallback),
            other => Err(TierParseError(other.to_string())),
        }
    }
}

/// Groups of authorities, in preference order, per tier.
#[derive(Debug, Clone, Default)]
pub(crate) struct TierLists {
    pub tailored: Vec<Vec<String>>,
    pub cached: Vec<Vec<String>>,
    pub fallback: Vec<Vec<String>>,
}

impl TierLists {
    pub fn set(&mut self, tier: Tier, groups: Vec<Vec<String>>) {
        match tier {
            Tier::Tailored => self.tailored = groups,
            Tier::Cached => self.cached = groups,
            Tier::Fallback => self.fallback = groups,
        }
    }

    /// Tailored groups if there are any, else cached followed by fallback.
    pub fn effective(&self) -> Vec<Vec<String>> {
        if !self.tailored.is_empty() {
            self.tailored.clone()
        } else {
            self.cached
                .iter()
                .chain(self.fallback.iter())
                .cloned()
                .collect()
        }
    }
}

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityEntry {
    pub node: NodeDescriptor,
    /// RTT multiplier; lower is preferred.
    pub penalty: f64,
}

/// Ordered candidate list plus authority -> penalty lookup, always rebuilt together.
#[derive(Debug, Clone, Default)]
pub struct PriorityList {
    order: Vec<PriorityEntry>,
    penalties: HashMap<String, f64>,
}

impl PriorityList {
    /// Flatten `groups` in order, first occurrence wins. Group `i` gets
    /// penalty `step^i`. Authorities missing from `known` are skipped.
    pub fn build(
        groups: &[Vec<String>],
        known: &HashMap<String, NodeDescriptor>,
        step: f64,
    ) -> Self {
        let mut list = PriorityList::default();
        let mut penalty = 1.0;

        for group in groups {
            for auth in group {
                if list.penalties.contains_key(auth) {
                    continue;
                }
                let Some(node) = known.get(auth) else {
                    tracing::debug!(authority = %auth, "priority: skipping unknown node");
                    continue;
                };
                list.penalties.insert(auth.clone(), penalty);
                list.order.push(PriorityEntry {
                    node: node.clone(),
                    penalty,
                });
            }
            penalty *= step;
        }

        list
    }

    pub fn entries(&self) -> &[PriorityEntry] {
        &self.order
    }

    pub fn penalty(&self, authority: &str) -> Option<f64> {
        self.penalties.get(authority).copied()
    }

    pub fn contains(&self, authority: &str) -> bool {
        self.penalties.contains_key(authority)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
