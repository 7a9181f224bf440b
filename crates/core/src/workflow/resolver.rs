use super::graph::WorkflowDag;
use crate::types::{NodeId, NodeStatus, WorkflowRunState};
use std::collections::{HashMap, HashSet};

/// Classification of schedulable nodes at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Every upstream succeeded (or there is none); may start now
    pub ready: Vec<NodeId>,
    /// At least one upstream is still in flight
    pub waiting: Vec<NodeId>,
    /// At least one upstream failed; can never start
    pub blocked: Vec<NodeId>,
}

/// Classify every node that has not started yet.
///
/// Nodes already running, terminal, or parked on an approval gate are left
/// out, as are nodes whose upstreams have not been reached at all. Order
/// follows edge declaration order, entry nodes first.
pub fn runnable_now(dag: &WorkflowDag, state: &WorkflowRunState) -> Readiness {
    let mut readiness = Readiness::default();

    for node_id in scheduling_order(dag) {
        let unstarted = match state.record(&node_id) {
            None => true,
            Some(r) => {
                r.status == NodeStatus::Idle
                    || (r.status == NodeStatus::Waiting && !r.awaiting_approval)
            }
        };
        if !unstarted {
            continue;
        }

        let statuses: Vec<NodeStatus> = dag
            .dependencies(&node_id)
            .iter()
            .map(|dep| state.node_status(dep))
            .collect();

        if statuses.iter().any(|s| *s == NodeStatus::Failed) {
            readiness.blocked.push(node_id);
        } else if statuses.iter().all(|s| *s == NodeStatus::Succeeded) {
            readiness.ready.push(node_id);
        } else if statuses
            .iter()
            .any(|s| s.is_active() || *s == NodeStatus::Waiting)
        {
            readiness.waiting.push(node_id);
        }
    }

    readiness
}

/// Entry nodes in declaration order, then edge targets in edge order
pub fn scheduling_order(dag: &WorkflowDag) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    dag.entry_nodes()
        .into_iter()
        .chain(dag.edges().iter().map(|e| e.target_node_id.clone()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Remaining-dependency bookkeeping for one run.
///
/// Each node keeps the upstream ids that have not succeeded yet; a node is
/// ready once its list is empty. Completing a node only touches its direct
/// dependents, so a whole run costs O(edges).
#[derive(Debug, Clone)]
pub struct DependencyTracker {
    remaining: HashMap<NodeId, Vec<NodeId>>,
}

impl DependencyTracker {
    pub fn new(dag: &WorkflowDag) -> Self {
        let remaining = dag
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), dag.dependencies(&n.id)))
            .collect();
        Self { remaining }
    }

    /// Upstream ids still blocking `node_id`, in declaration order
    pub fn blocking(&self, node_id: &NodeId) -> &[NodeId] {
        self.remaining
            .get(node_id)
            .map(|deps| deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_ready(&self, node_id: &NodeId) -> bool {
        self.blocking(node_id).is_empty()
    }

    /// Record that `upstream` succeeded. Returns the dependents that became
    /// ready as a result, preserving the order of `dependents`.
    pub fn resolve(&mut self, upstream: &NodeId, dependents: &[NodeId]) -> Vec<NodeId> {
        let mut unblocked = Vec::new();
        for dependent in dependents {
            if let Some(deps) = self.remaining.get_mut(dependent) {
                let before = deps.len();
                deps.retain(|d| d != upstream);
                if before > 0 && deps.is_empty() {
                    unblocked.push(dependent.clone());
                }
            }
        }
        unblocked
    }
}
