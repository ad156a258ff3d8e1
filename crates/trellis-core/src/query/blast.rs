//! Blast radius and test coverage analysis over the committed graph.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::errors::{TrellisError, TrellisResult};
use crate::models::{
    Edge, EdgeKind, ImpactNode, ImpactReport, Node, NodeId, NodeKind, RelatedTest, RiskLevel, TestSet,
};
use crate::query::guards::{clamp_depth, MAX_IMPACT_DEPTH, MAX_TEST_DEPTH};
use crate::store::GraphState;

const DEPENDENCY_EDGES: [EdgeKind; 5] = [
    EdgeKind::Calls,
    EdgeKind::Imports,
    EdgeKind::Inherits,
    EdgeKind::ReadsWrites,
    EdgeKind::Tests,
];

pub fn risk_level(dependents: usize) -> RiskLevel {
    if dependents >= 10 {
        RiskLevel::High
    } else if dependents >= 3 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// The node itself plus whatever changes along with it: members of a class,
/// declarations and the module of a file.
fn change_set<'a>(state: &'a GraphState, node: &'a Node) -> Vec<&'a NodeId> {
    let mut ids = vec![node.id()];
    match node {
        Node::Class(_) => ids.extend(
            state
                .outgoing(node.id())
                .filter(|e| e.kind == EdgeKind::Contains)
                .map(|e| &e.target),
        ),
        Node::File(file) => {
            ids.extend(
                state
                    .nodes_in_file(&file.path)
                    .map(Node::id)
                    .filter(|id| *id != node.id()),
            );
            if let Some(module) = &file.module {
                if let Some(m) = state.node(&NodeId::module(module)) {
                    ids.push(m.id());
                }
            }
        }
        _ => {}
    }
    ids
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Walk {
    Upstream,
    Downstream,
}

fn walk(state: &GraphState, start: &[&NodeId], depth: u32, direction: Walk) -> Vec<ImpactNode> {
    let mut visited: HashSet<&NodeId> = start.iter().copied().collect();
    let mut queue: VecDeque<(&NodeId, u32, f64)> = start.iter().map(|id| (*id, 0, 1.0)).collect();
    let mut out = Vec::new();
    while let Some((current, level, confidence)) = queue.pop_front() {
        if level >= depth {
            continue;
        }
        let edges: Vec<&Edge> = match direction {
            Walk::Upstream => state.incoming(current).collect(),
            Walk::Downstream => state.outgoing(current).collect(),
        };
        for edge in edges.into_iter().filter(|e| DEPENDENCY_EDGES.contains(&e.kind)) {
            let next = edge.other_end(current);
            if !visited.insert(next) {
                continue;
            }
            let Some(node) = state.node(next) else {
                continue;
            };
            let reach = confidence * edge.confidence.value();
            out.push(ImpactNode {
                node_id: next.clone(),
                qualified_name: node.qualified_name().to_string(),
                file_path: node.file_path().map(str::to_string),
                depth: level + 1,
                via: edge.kind,
                confidence: reach,
            });
            queue.push_back((next, level + 1, reach));
        }
    }
    out
}

/// Dependents (upstream) and dependencies (downstream) of `node_id`.
pub fn impact(state: &GraphState, node_id: &NodeId, depth: u32) -> TrellisResult<ImpactReport> {
    let node = state
        .node(node_id)
        .ok_or_else(|| TrellisError::NodeNotFound(node_id.to_string()))?;
    let depth = clamp_depth(depth, MAX_IMPACT_DEPTH);
    let start = change_set(state, node);
    let upstream = walk(state, &start, depth, Walk::Upstream);
    let downstream = walk(state, &start, depth, Walk::Downstream);

    let mut affected: BTreeSet<String> = upstream
        .iter()
        .filter_map(|n| n.file_path.clone())
        .collect();
    if let Some(path) = node.file_path() {
        affected.insert(path.to_string());
    }
    Ok(ImpactReport {
        node_id: node_id.clone(),
        blast_radius: upstream.len(),
        risk: risk_level(upstream.len()),
        upstream,
        downstream,
        affected_files: affected.into_iter().collect(),
    })
}

// ---------------------------------------------------------------------------
// Related tests
// ---------------------------------------------------------------------------

fn tests_reaching<'a>(state: &'a GraphState, id: &NodeId) -> impl Iterator<Item = (&'a Node, f64)> {
    state
        .incoming(id)
        .filter(|e| e.kind == EdgeKind::Tests)
        .filter_map(|e| state.node(&e.source).map(|n| (n, e.confidence.value())))
        .filter(|(n, _)| n.kind() == NodeKind::Test)
}

fn record(
    found: &mut HashMap<(NodeId, NodeId), RelatedTest>,
    test: &Node,
    covers: &NodeId,
    depth: u32,
    confidence: f64,
) {
    let candidate = RelatedTest {
        node_id: test.id().clone(),
        qualified_name: test.qualified_name().to_string(),
        file_path: test.file_path().unwrap_or_default().to_string(),
        covers: covers.clone(),
        direct: depth == 1,
        depth,
        confidence,
    };
    let key = (candidate.node_id.clone(), covers.clone());
    match found.get(&key) {
        Some(existing)
            if existing.depth < depth
                || (existing.depth == depth && existing.confidence >= confidence) => {}
        _ => {
            found.insert(key, candidate);
        }
    }
}

/// Tests exercising any of `node_ids`, directly or through a chain of
/// callers. Unknown ids are skipped.
pub fn related_tests(state: &GraphState, node_ids: &[NodeId]) -> TestSet {
    let mut found: HashMap<(NodeId, NodeId), RelatedTest> = HashMap::new();
    for target in node_ids {
        let Some(node) = state.node(target) else {
            continue;
        };
        for member in change_set(state, node) {
            let mut visited: HashSet<&NodeId> = HashSet::from([member]);
            let mut queue: VecDeque<(&NodeId, u32, f64)> = VecDeque::from([(member, 0, 1.0)]);
            while let Some((current, level, confidence)) = queue.pop_front() {
                for (test, edge_confidence) in tests_reaching(state, current) {
                    record(&mut found, test, target, level + 1, confidence * edge_confidence);
                }
                if level + 1 >= MAX_TEST_DEPTH {
                    continue;
                }
                for edge in state.incoming(current).filter(|e| e.kind == EdgeKind::Calls) {
                    if visited.insert(&edge.source) {
                        queue.push_back((&edge.source, level + 1, confidence * edge.confidence.value()));
                    }
                }
            }
        }
    }
    let mut tests: Vec<RelatedTest> = found.into_values().collect();
    tests.sort_by(|a, b| {
        a.covers
            .cmp(&b.covers)
            .then(a.depth.cmp(&b.depth))
            .then_with(|| a.qualified_name.cmp(&b.qualified_name))
    });
    TestSet { tests }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParseStatus;
    use crate::store::test_support::{
        class_node, edge, file_node, function_node, graph_with, test_node,
    };

    /// save <- register <- signup; test_register -> register; test_save -> save.
    fn fixture() -> GraphState {
        let file = file_node("app.py", ParseStatus::Success);
        let tests_file = file_node("test_app.py", ParseStatus::Success);
        let save = function_node("app.py", "app", "save", 1);
        let register = function_node("app.py", "app", "register", 5);
        let signup = function_node("app.py", "app", "signup", 9);
        let helper = function_node("app.py", "app", "hash_password", 13);
        let test_register = test_node("test_app.py", "test_app", "test_register", 1);
        let test_save = test_node("test_app.py", "test_app", "test_save", 5);
        let edges = vec![
            edge(EdgeKind::Calls, &register, &save, 1.0),
            edge(EdgeKind::Calls, &signup, &register, 0.6),
            edge(EdgeKind::Calls, &register, &helper, 1.0),
            edge(EdgeKind::Tests, &test_register, &register, 1.0),
            edge(EdgeKind::Tests, &test_save, &save, 1.0),
        ];
        graph_with(
            vec![file, tests_file, save, register, signup, helper, test_register, test_save],
            edges,
        )
    }

    #[test]
    fn test_impact_upstream_and_downstream() {
        let state = fixture();
        let report = impact(&state, &NodeId::from("function:app.register"), 3).unwrap();
        let up: Vec<&str> = report.upstream.iter().map(|n| n.qualified_name.as_str()).collect();
        assert!(up.contains(&"app.signup"));
        assert!(up.contains(&"test_app.test_register"));
        assert_eq!(report.blast_radius, 2);
        assert_eq!(report.risk, RiskLevel::Low);
        let down: Vec<&str> = report.downstream.iter().map(|n| n.qualified_name.as_str()).collect();
        assert_eq!(down.len(), 2);
        assert!(down.contains(&"app.save") && down.contains(&"app.hash_password"));
        assert_eq!(report.affected_files, vec!["app.py".to_string(), "test_app.py".to_string()]);
    }

    #[test]
    fn test_impact_depth_and_confidence_compound() {
        let state = fixture();
        let report = impact(&state, &NodeId::from("function:app.save"), 2).unwrap();
        let signup = report
            .upstream
            .iter()
            .find(|n| n.qualified_name == "app.signup");
        assert!(signup.is_some_and(|n| n.depth == 2 && (n.confidence - 0.6).abs() < 1e-9));
        let shallow = impact(&state, &NodeId::from("function:app.save"), 1).unwrap();
        assert!(shallow.upstream.iter().all(|n| n.depth == 1));
        assert!(impact(&state, &NodeId::from("function:missing"), 2).is_err());
    }

    #[test]
    fn test_class_impact_includes_member_callers() {
        let user = class_node("models.py", "models", "User", 1);
        let mut method = function_node("models.py", "models", "User.save", 2);
        if let Node::Function(f) = &mut method {
            f.parent = user.id().clone();
        }
        let caller = function_node("api.py", "api", "create", 1);
        let edges = vec![edge(EdgeKind::Calls, &caller, &method, 1.0)];
        let state = graph_with(vec![user, method, caller], edges);
        let report = impact(&state, &NodeId::from("class:models.User"), 2).unwrap();
        assert_eq!(report.blast_radius, 1);
        assert_eq!(report.upstream[0].qualified_name, "api.create");
    }

    #[test]
    fn test_risk_levels() {
        assert_eq!(risk_level(0), RiskLevel::Low);
        assert_eq!(risk_level(3), RiskLevel::Medium);
        assert_eq!(risk_level(10), RiskLevel::High);
    }

    #[test]
    fn test_related_tests_direct_and_transitive() {
        let state = fixture();
        let set = related_tests(
            &state,
            &[NodeId::from("function:app.save"), NodeId::from("function:nope")],
        );
        assert_eq!(set.len(), 2);
        let direct = &set.tests[0];
        assert_eq!(direct.qualified_name, "test_app.test_save");
        assert!(direct.direct);
        let transitive = &set.tests[1];
        assert_eq!(transitive.qualified_name, "test_app.test_register");
        assert!(!transitive.direct);
        assert_eq!(transitive.depth, 2);

        let helper = related_tests(&state, &[NodeId::from("function:app.hash_password")]);
        assert!(helper.contains(&NodeId::from("test:test_app.test_register")));
    }
}
