//! Declarative resource graph
//!
//! Nodes are array resources, edges read "must exist before". Reconcilers walk
//! [`ResourceGraph::create_order`] to converge and
//! [`ResourceGraph::delete_order`] to tear down, so dependency ordering lives
//! in one table per profile instead of in hand-written call sequences.

use crate::error::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

// =============================================================================
// Resources
// =============================================================================

/// Role a LUN plays for the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LunRole {
    Boot,
    Data,
    Seed,
    Bootstrap,
}

impl std::fmt::Display for LunRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LunRole::Boot => write!(f, "boot"),
            LunRole::Data => write!(f, "data"),
            LunRole::Seed => write!(f, "seed"),
            LunRole::Bootstrap => write!(f, "bootstrap"),
        }
    }
}

/// One node of the per-node resource graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Volume,
    Igroup,
    Lun(LunRole),
    /// Mapping of a LUN into the igroup
    LunMap(LunRole),
    /// Read-back of target names and interfaces
    IscsiTargets,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Volume => write!(f, "volume"),
            Resource::Igroup => write!(f, "igroup"),
            Resource::Lun(role) => write!(f, "{} LUN", role),
            Resource::LunMap(role) => write!(f, "{} LUN mapping", role),
            Resource::IscsiTargets => write!(f, "iSCSI targets"),
        }
    }
}

// =============================================================================
// Graph
// =============================================================================

/// Resources with their dependencies, in insertion order
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: IndexMap<Resource, Vec<Resource>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `resource`, which must come after every entry of `after`
    pub fn node(mut self, resource: Resource, after: &[Resource]) -> Self {
        self.nodes.insert(resource, after.to_vec());
        self
    }

    pub fn contains(&self, resource: Resource) -> bool {
        self.nodes.contains_key(&resource)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topological order, dependencies first.
    ///
    /// Among resources whose dependencies are satisfied, the earliest inserted
    /// goes first, so the order is stable for a given table.
    pub fn create_order(&self) -> Result<Vec<Resource>> {
        for (resource, after) in &self.nodes {
            if let Some(unknown) = after.iter().find(|d| !self.nodes.contains_key(*d)) {
                return Err(Error::Internal(format!(
                    "{} depends on {} which is not in the graph",
                    resource, unknown
                )));
            }
        }

        let mut placed: IndexSet<Resource> = IndexSet::with_capacity(self.nodes.len());
        while placed.len() < self.nodes.len() {
            let ready = self
                .nodes
                .iter()
                .find(|(r, after)| !placed.contains(*r) && after.iter().all(|d| placed.contains(d)))
                .map(|(r, _)| *r);
            match ready {
                Some(resource) => {
                    placed.insert(resource);
                }
                None => {
                    let stuck: Vec<String> = self
                        .nodes
                        .keys()
                        .filter(|r| !placed.contains(*r))
                        .map(|r| r.to_string())
                        .collect();
                    return Err(Error::Internal(format!(
                        "dependency cycle among {}",
                        stuck.join(", ")
                    )));
                }
            }
        }
        Ok(placed.into_iter().collect())
    }

    /// Reverse topological order, dependents first
    pub fn delete_order(&self) -> Result<Vec<Resource>> {
        let mut order = self.create_order()?;
        order.reverse();
        Ok(order)
    }
}

// =============================================================================
// Profile Tables
// =============================================================================

/// Volume, igroup, boot LUN copied from an image at id 0, optional data LUN
pub fn classic_graph(with_data: bool) -> ResourceGraph {
    let mut graph = ResourceGraph::new()
        .node(Resource::Volume, &[])
        .node(Resource::Igroup, &[])
        .node(Resource::Lun(LunRole::Boot), &[Resource::Volume])
        .node(
            Resource::LunMap(LunRole::Boot),
            &[Resource::Lun(LunRole::Boot), Resource::Igroup],
        );
    if with_data {
        graph = graph
            .node(Resource::Lun(LunRole::Data), &[Resource::Volume])
            .node(
                Resource::LunMap(LunRole::Data),
                &[Resource::Lun(LunRole::Data), Resource::Igroup],
            );
    }
    graph.node(Resource::IscsiTargets, &[Resource::LunMap(LunRole::Boot)])
}

/// Volume, igroup, bootstrap LUN copied from an image at id 0, blank boot LUN
pub fn bootstrap_graph() -> ResourceGraph {
    ResourceGraph::new()
        .node(Resource::Volume, &[])
        .node(Resource::Igroup, &[])
        .node(Resource::Lun(LunRole::Bootstrap), &[Resource::Volume])
        .node(
            Resource::LunMap(LunRole::Bootstrap),
            &[Resource::Lun(LunRole::Bootstrap), Resource::Igroup],
        )
        .node(Resource::Lun(LunRole::Boot), &[Resource::Volume])
        .node(
            Resource::LunMap(LunRole::Boot),
            &[Resource::Lun(LunRole::Boot), Resource::Igroup],
        )
        .node(Resource::IscsiTargets, &[Resource::LunMap(LunRole::Boot)])
}

/// Everything a delete walks for the given LUN roles
pub fn teardown_graph(roles: &[LunRole]) -> ResourceGraph {
    let mut graph = ResourceGraph::new()
        .node(Resource::Volume, &[])
        .node(Resource::Igroup, &[]);
    for role in roles {
        graph = graph
            .node(Resource::Lun(*role), &[Resource::Volume])
            .node(
                Resource::LunMap(*role),
                &[Resource::Lun(*role), Resource::Igroup],
            );
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn position(order: &[Resource], resource: Resource) -> usize {
        order.iter().position(|r| *r == resource).unwrap()
    }

    #[test]
    fn test_classic_create_order() {
        let order = classic_graph(false).create_order().unwrap();
        assert_eq!(
            order,
            vec![
                Resource::Volume,
                Resource::Igroup,
                Resource::Lun(LunRole::Boot),
                Resource::LunMap(LunRole::Boot),
                Resource::IscsiTargets,
            ]
        );
    }

    #[test]
    fn test_data_lun_is_optional() {
        assert!(!classic_graph(false).contains(Resource::Lun(LunRole::Data)));

        let order = classic_graph(true).create_order().unwrap();
        assert!(position(&order, Resource::Lun(LunRole::Data)) > position(&order, Resource::Volume));
        assert!(
            position(&order, Resource::LunMap(LunRole::Data))
                > position(&order, Resource::Lun(LunRole::Data))
        );
    }

    #[test]
    fn test_teardown_unmaps_before_destroy() {
        let order = teardown_graph(&[LunRole::Boot, LunRole::Data, LunRole::Seed])
            .delete_order()
            .unwrap();
        for role in [LunRole::Boot, LunRole::Data, LunRole::Seed] {
            assert!(position(&order, Resource::LunMap(role)) < position(&order, Resource::Lun(role)));
            assert!(position(&order, Resource::Lun(role)) < position(&order, Resource::Volume));
            assert!(position(&order, Resource::LunMap(role)) < position(&order, Resource::Igroup));
        }
        assert!(position(&order, Resource::Igroup) < position(&order, Resource::Volume));
    }

    #[test]
    fn test_bootstrap_maps_bootstrap_before_boot() {
        let order = bootstrap_graph().create_order().unwrap();
        assert!(
            position(&order, Resource::LunMap(LunRole::Bootstrap))
                < position(&order, Resource::LunMap(LunRole::Boot))
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let graph = ResourceGraph::new().node(Resource::Lun(LunRole::Boot), &[Resource::Volume]);
        assert_matches!(graph.create_order(), Err(Error::Internal(_)));
    }

    #[test]
    fn test_cycle_detected() {
        let graph = ResourceGraph::new()
            .node(Resource::Volume, &[Resource::Igroup])
            .node(Resource::Igroup, &[Resource::Volume]);
        assert_matches!(graph.create_order(), Err(Error::Internal(msg)) if msg.contains("cycle"));
    }
}
