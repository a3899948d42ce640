//! Discovery payload -> known nodes + tiered priority groups.

use rand::seq::SliceRandom;
use rand::Rng;
use switchboard_protocol::DiscoveryPayload;

use crate::priority::{NodeDescriptor, Tier};
use crate::ConnectionManager;

/// Nodes per zone that go into the zone's own group. The rest of every
/// zone is pooled into one trailing balance group.
pub const NODES_PER_ZONE_GROUP: usize = 2;

/// Parsed form of one discovery payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneLayout {
    pub nodes: Vec<NodeDescriptor>,
    pub groups: Vec<Vec<String>>,
}

pub struct ZoneDirectory;

impl ZoneDirectory {
    /// Parse `payload` and feed it to `manager` as `tier`.
    ///
    /// Returns false, leaving the manager untouched, if the payload does not
    /// have the discovery shape.
    pub fn parse_zone(
        tier: Tier,
        tailored: bool,
        payload: &serde_json::Value,
        manager: &mut ConnectionManager,
    ) -> bool {
        Self::parse_zone_with_rng(tier, tailored, payload, manager, &mut rand::thread_rng())
    }

    pub fn parse_zone_with_rng<R: Rng + ?Sized>(
        tier: Tier,
        tailored: bool,
        payload: &serde_json::Value,
        manager: &mut ConnectionManager,
        rng: &mut R,
    ) -> bool {
        let layout = match Self::layout(tailored, payload, rng) {
            Ok(layout) => layout,
            Err(e) => {
                tracing::warn!(tier = tier.name(), error = %e, "failed to parse discovery payload");
                return false;
            }
        };

        tracing::info!(
            tier = tier.name(),
            nodes = layout.nodes.len(),
            groups = layout.groups.len(),
            "zone list loaded"
        );
        manager.assert_nodes(layout.nodes);
        manager.set_priority_list(tier, layout.groups);
        true
    }

    /// Build the node list and groups. Zone order is shuffled unless the
    /// list is tailored; node order within a zone is always shuffled.
    pub fn layout<R: Rng + ?Sized>(
        tailored: bool,
        payload: &serde_json::Value,
        rng: &mut R,
    ) -> Result<ZoneLayout, serde_json::Error> {
        let mut discovery: DiscoveryPayload = serde_json::from_value(payload.clone())?;

        if !tailored {
            discovery.zones.shuffle(rng);
        }

        let mut layout = ZoneLayout::default();
        let mut balance = Vec::new();

        for mut zone in discovery.zones {
            zone.nodes.shuffle(rng);
            let mut group = Vec::new();
            for (i, node) in zone.nodes.into_iter().enumerate() {
                if i < NODES_PER_ZONE_GROUP {
                    group.push(node.authority.clone());
                } else {
                    balance.push(node.authority.clone());
                }
                layout.nodes.push(NodeDescriptor {
                    authority: node.authority,
                    shortname: node.shortname,
                    zonename: zone.name.clone(),
                });
            }
            layout.groups.push(group);
        }

        if !balance.is_empty() {
            layout.groups.push(balance);
        }
        Ok(layout)
    }
}
