//! Bounded neighbourhood traversal.

use std::collections::{HashSet, VecDeque};

use crate::errors::{TrellisError, TrellisResult};
use crate::models::{EdgeKind, NodeId, NodeSet};
use crate::query::guards::{clamp_depth, MAX_NEIGHBOR_HOPS};
use crate::store::GraphState;

/// Nodes within `hops` of `node_id` along `edge_types` in either direction,
/// excluding the start node. An empty `edge_types` follows every kind.
pub fn neighbors(
    state: &GraphState,
    node_id: &NodeId,
    hops: u32,
    edge_types: &[EdgeKind],
) -> TrellisResult<NodeSet> {
    if !state.contains_node(node_id) {
        return Err(TrellisError::NodeNotFound(node_id.to_string()));
    }
    let hops = clamp_depth(hops, MAX_NEIGHBOR_HOPS);
    let follows = |kind: EdgeKind| edge_types.is_empty() || edge_types.contains(&kind);

    let mut visited: HashSet<&NodeId> = HashSet::from([node_id]);
    let mut queue: VecDeque<(&NodeId, u32)> = VecDeque::from([(node_id, 0)]);
    let mut found = Vec::new();
    while let Some((current, depth)) = queue.pop_front() {
        if depth >= hops {
            continue;
        }
        let edges = state.outgoing(current).chain(state.incoming(current));
        for edge in edges.filter(|e| follows(e.kind)) {
            let next = edge.other_end(current);
            if !visited.insert(next) {
                continue;
            }
            if let Some(node) = state.node(next) {
                found.push(node.clone());
                queue.push_back((next, depth + 1));
            }
        }
    }
    Ok(NodeSet::from_nodes(found))
}
