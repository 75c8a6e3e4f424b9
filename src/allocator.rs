use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::SiteCatalog;
use crate::domain::{DemandNode, NodeId, SiteId};
use crate::spatial::SpatialIndex;

/// One site's contribution to a node: the fraction of the site's rated
/// capacity assigned to that node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteShare {
    pub site_id: SiteId,
    pub fraction: f64,
}

/// Per-node allocation result. Shares are in allocation order, nearest
/// first, which callers use as a file preference order. A positive
/// `unmet_capacity` means the catalog ran out of capacity for this node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeAllocation {
    pub node_id: NodeId,
    pub shares: Vec<SiteShare>,
    pub unmet_capacity: f64,
}

impl NodeAllocation {
    pub fn is_under_allocated(&self) -> bool {
        self.unmet_capacity > 0.0
    }

    pub fn site_ids(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.shares.iter().map(|share| share.site_id)
    }
}

/// Outcome of one allocation run, in input node order.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationOutcome {
    pub allocations: Vec<NodeAllocation>,
}

impl AllocationOutcome {
    pub fn under_allocated(&self) -> Vec<NodeId> {
        self.allocations
            .iter()
            .filter(|allocation| allocation.is_under_allocated())
            .map(|allocation| allocation.node_id)
            .collect()
    }

    /// Unique referenced site ids, ascending.
    pub fn site_ids(&self) -> Vec<SiteId> {
        let mut ids: Vec<SiteId> = self
            .allocations
            .iter()
            .flat_map(|allocation| allocation.site_ids())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Assign each weather node its nearest site. No capacity bookkeeping:
/// every node gets a single full share against the static site set, so
/// the result is independent of input order.
pub fn resolve_weather(nodes: &[DemandNode], catalog: &SiteCatalog) -> AllocationOutcome {
    let index = SpatialIndex::from_catalog(catalog);
    let allocations = nodes
        .iter()
        .map(|node| {
            let shares = match index.nearest(node.latitude, node.longitude) {
                Some(site_id) => vec![SiteShare {
                    site_id,
                    fraction: 1.0,
                }],
                None => Vec::new(),
            };
            NodeAllocation {
                node_id: node.id,
                shares,
                unmet_capacity: 0.0,
            }
        })
        .collect();
    AllocationOutcome { allocations }
}

/// Fill each generation node's required capacity from its nearest sites,
/// greedily. Every pass, each unsatisfied node bids for its nearest live
/// site; contended sites go to the globally closest bidder (distance
/// ties to the lower node id) and each winner takes
/// `min(node remaining, site remaining)`. Drained sites leave the live
/// set, so blocked nodes search farther out on later passes. Terminates
/// when every node is satisfied or no site capacity remains; leftover
/// demand is reported as unmet, not an error.
pub fn resolve_generation(nodes: &[DemandNode], catalog: &SiteCatalog) -> AllocationOutcome {
    let mut index = SpatialIndex::from_generation_sites(catalog);

    let mut node_remaining: Vec<f64> = nodes
        .iter()
        .map(|node| node.capacity_mw.unwrap_or(0.0).max(0.0))
        .collect();
    let mut shares: Vec<Vec<SiteShare>> = vec![Vec::new(); nodes.len()];

    struct SiteBudget {
        capacity: f64,
        remaining: f64,
    }

    let mut sites: BTreeMap<SiteId, SiteBudget> = catalog
        .generation_sites()
        .map(|site| {
            let capacity = site.rated_capacity.unwrap_or(0.0);
            (
                site.site_id,
                SiteBudget {
                    capacity,
                    remaining: capacity,
                },
            )
        })
        .collect();

    while node_remaining.iter().any(|remaining| *remaining > 0.0) && !index.is_empty() {
        // One bid per unsatisfied node; keep the closest bidder per site.
        let mut winners: BTreeMap<SiteId, (usize, f64)> = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if node_remaining[i] <= 0.0 {
                continue;
            }
            let Some((site_id, d2)) = index.nearest_with_distance2(node.latitude, node.longitude)
            else {
                break;
            };
            match winners.get(&site_id) {
                Some((best, best_d2))
                    if *best_d2 < d2 || (*best_d2 == d2 && nodes[*best].id < node.id) => {}
                _ => {
                    winners.insert(site_id, (i, d2));
                }
            }
        }

        for (site_id, (i, _)) in winners {
            let Some(budget) = sites.get_mut(&site_id) else {
                continue;
            };
            let amount = node_remaining[i].min(budget.remaining);
            shares[i].push(SiteShare {
                site_id,
                fraction: amount / budget.capacity,
            });
            node_remaining[i] -= amount;
            budget.remaining -= amount;
            if budget.remaining <= 0.0 {
                debug!("site {} capacity exhausted", site_id);
                index.remove(site_id);
            }
        }
    }

    let allocations: Vec<NodeAllocation> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| NodeAllocation {
            node_id: node.id,
            shares: std::mem::take(&mut shares[i]),
            unmet_capacity: node_remaining[i],
        })
        .collect();

    for allocation in &allocations {
        if allocation.is_under_allocated() {
            warn!(
                "node {} under-allocated: {:.2} MW unmet",
                allocation.node_id, allocation.unmet_capacity
            );
        }
    }

    AllocationOutcome { allocations }
}

#[cfg(test)]
mod tests {
    use crate::catalog::Site;
    use crate::domain::ResourceCategory;

    use super::*;

    fn site(id: u64, latitude: f64, longitude: f64, capacity: f64) -> Site {
        Site {
            site_id: SiteId(id),
            latitude,
            longitude,
            rated_capacity: Some(capacity),
        }
    }

    fn catalog(sites: Vec<Site>) -> SiteCatalog {
        SiteCatalog::from_sites(ResourceCategory::Wind, sites).unwrap()
    }

    #[test]
    fn one_node_spills_to_second_site() {
        let catalog = catalog(vec![site(1, 0.0, 0.0, 10.0), site(2, 1.0, 1.0, 10.0)]);
        let nodes = vec![DemandNode::generation(NodeId(1), 0.0, 0.0, 15.0)];

        let outcome = resolve_generation(&nodes, &catalog);
        let allocation = &outcome.allocations[0];
        assert_eq!(
            allocation.shares,
            vec![
                SiteShare {
                    site_id: SiteId(1),
                    fraction: 1.0,
                },
                SiteShare {
                    site_id: SiteId(2),
                    fraction: 0.5,
                },
            ]
        );
        assert!(!allocation.is_under_allocated());
    }

    #[test]
    fn contended_site_goes_to_closest_node() {
        let catalog = catalog(vec![site(1, 0.0, 0.0, 10.0)]);
        let nodes = vec![
            DemandNode::generation(NodeId(1), 0.01, 0.01, 10.0),
            DemandNode::generation(NodeId(2), 0.0, 0.0, 10.0),
        ];

        let outcome = resolve_generation(&nodes, &catalog);
        let closest = &outcome.allocations[1];
        assert_eq!(closest.shares.len(), 1);
        assert_eq!(closest.shares[0].fraction, 1.0);
        assert!(!closest.is_under_allocated());

        let blocked = &outcome.allocations[0];
        assert!(blocked.shares.is_empty());
        assert_eq!(blocked.unmet_capacity, 10.0);
        assert_eq!(outcome.under_allocated(), vec![NodeId(1)]);
    }

    #[test]
    fn zero_required_capacity_is_a_no_op() {
        let catalog = catalog(vec![site(1, 0.0, 0.0, 10.0)]);
        let nodes = vec![DemandNode::generation(NodeId(1), 0.0, 0.0, 0.0)];

        let outcome = resolve_generation(&nodes, &catalog);
        assert!(outcome.allocations[0].shares.is_empty());
        assert!(!outcome.allocations[0].is_under_allocated());
    }

    #[test]
    fn weather_nodes_take_nearest_site() {
        let catalog = catalog(vec![site(1, 0.0, 0.0, 10.0), site(2, 5.0, 5.0, 10.0)]);
        let nodes = vec![
            DemandNode::weather(NodeId(1), 4.0, 4.0),
            DemandNode::weather(NodeId(2), 1.0, 1.0),
        ];

        let outcome = resolve_weather(&nodes, &catalog);
        assert_eq!(outcome.allocations[0].shares[0].site_id, SiteId(2));
        assert_eq!(outcome.allocations[0].shares[0].fraction, 1.0);
        assert_eq!(outcome.allocations[1].shares[0].site_id, SiteId(1));
    }

    #[test]
    fn sites_collected_unique_and_sorted() {
        let catalog = catalog(vec![site(2, 0.0, 0.0, 5.0), site(1, 1.0, 1.0, 20.0)]);
        let nodes = vec![
            DemandNode::generation(NodeId(1), 0.0, 0.0, 10.0),
            DemandNode::generation(NodeId(2), 1.0, 1.0, 5.0),
        ];

        let outcome = resolve_generation(&nodes, &catalog);
        assert_eq!(outcome.site_ids(), vec![SiteId(1), SiteId(2)]);
    }
}
