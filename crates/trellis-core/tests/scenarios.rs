//! End-to-end behaviour of the engine against small on-disk repositories.

use std::fs;
use std::path::Path;

use trellis_core::config::StoreConfig;
use trellis_core::indexer::parse_and_build;
use trellis_core::models::{
    Confidence, Edge, EdgeKind, EdgeMetadata, InheritKind, Language, NodeId, NodeKind, ParseStatus,
};
use trellis_core::query::hybrid::{HybridScorer, Signals};
use trellis_core::store::{StoreError, Transaction, Violation};
use trellis_core::{Engine, EngineConfig, QueryRequest};

const VALIDATORS: &str = "\
import re


def validate_email(email):
    return re.match(r\"[^@]+@[^@]+\", email) is not None
";

const REGISTER: &str = "\
from auth.validators import validate_email


def register_user(email, password):
    if not validate_email(email):
        raise ValueError(\"invalid email\")
    return {\"email\": email}
";

const CHARTS: &str = "\
def render_chart(series):
    return [point * 2 for point in series]


def chart_legend(labels):
    return \", \".join(labels)
";

const BILLING: &str = "\
def compute_invoice_total(lines):
    return sum(line.amount for line in lines)
";

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn fixture_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "auth/validators.py", VALIDATORS);
    write(dir.path(), "auth/register.py", REGISTER);
    write(dir.path(), "ui/charts.py", CHARTS);
    write(dir.path(), "billing/invoices.py", BILLING);
    dir
}

fn quiet_store() -> StoreConfig {
    StoreConfig {
        sync_writes: false,
        snapshot_every_entries: None,
        ..StoreConfig::default()
    }
}

fn in_memory(root: &Path) -> Engine {
    let config = EngineConfig {
        store: quiet_store(),
        ..EngineConfig::default()
    };
    Engine::open(root, config).unwrap()
}

fn persistent(root: &Path, state: &Path) -> Engine {
    let config = EngineConfig {
        state_dir: Some(state.to_path_buf()),
        store: quiet_store(),
        ..EngineConfig::default()
    };
    Engine::open(root, config).unwrap()
}

#[test]
fn test_partial_parse_keeps_preceding_functions() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "app/greeting.py",
        "def greet(name):\n    return \"hello \" + name\n\n\ndef shout(name):\n    return \"HELLO\n",
    );
    let engine = in_memory(dir.path());
    let result = engine.index_full(None).unwrap();
    assert_eq!(result.files_indexed, 1);

    let state = engine.store().read();
    let file = state.file("app/greeting.py").unwrap();
    assert_eq!(file.parse_status, ParseStatus::Partial);
    assert!(file.error_count >= 1);
    assert!(state.by_qualified_name("app.greeting.greet").is_some());
    assert!(result.coverage_pct > 0.0);
}

#[test]
fn test_registration_query_returns_both_files() {
    let dir = fixture_repo();
    let engine = in_memory(dir.path());
    engine.index_full(None).unwrap();

    let pack = engine.query(&QueryRequest::new("add email validation to user registration"));
    let top: Vec<&str> = pack.files.iter().take(3).map(|f| f.path.as_str()).collect();
    assert!(top.contains(&"auth/register.py"), "{top:?}");
    assert!(top.contains(&"auth/validators.py"), "{top:?}");
    for file in pack.files.iter().take(3) {
        assert!(!file.rationale.is_empty());
    }
    assert!((0.0..=1.0).contains(&pack.total_confidence));
}

#[test]
fn test_deleting_a_function_prunes_every_call_site() {
    let dir = fixture_repo();
    write(
        dir.path(),
        "auth/profile.py",
        "from auth.validators import validate_email\n\n\ndef change_email(user, email):\n    validate_email(email)\n    user.email = email\n",
    );
    write(
        dir.path(),
        "admin/users.py",
        "from auth.validators import validate_email\n\n\ndef import_users(rows):\n    return [r for r in rows if validate_email(r)]\n",
    );
    let engine = in_memory(dir.path());
    engine.index_full(None).unwrap();
    let target = NodeId::from("function:auth.validators.validate_email");
    let callers = engine
        .store()
        .read()
        .incoming(&target)
        .filter(|e| e.kind == EdgeKind::Calls)
        .count();
    assert_eq!(callers, 3);

    let patch = engine
        .index_incremental("auth/validators.py", b"import re\n\nPATTERN = re.compile('@')\n")
        .unwrap();
    assert_eq!(patch.removed, vec![target.clone()]);
    let pruned = patch
        .edges_removed
        .iter()
        .filter(|id| id.as_str().starts_with("calls:") && id.as_str().ends_with(target.as_str()))
        .count();
    assert_eq!(pruned, 3);
    assert!(engine.store().read().incoming(&target).next().is_none());

    let pack = engine.query(&QueryRequest::new("validate email"));
    assert!(pack.files.iter().all(|f| f.confidence >= 0.0));
    assert!(engine.impact(&target, 2).is_err());
}

#[test]
fn test_sequential_updates_match_full_reindex() {
    let dir = fixture_repo();
    let engine = in_memory(dir.path());
    engine.index_full(None).unwrap();

    let second = format!("{VALIDATORS}\n\ndef validate_password(password):\n    return len(password) >= 8\n");
    let third = second.replace(">= 8", ">= 12").replace("import re\n", "import re\nimport string\n");
    engine.index_incremental("auth/validators.py", second.as_bytes()).unwrap();
    engine.index_incremental("auth/validators.py", third.as_bytes()).unwrap();

    let fresh_dir = fixture_repo();
    write(fresh_dir.path(), "auth/validators.py", &third);
    let fresh = in_memory(fresh_dir.path());
    fresh.index_full(None).unwrap();

    assert_eq!(
        engine.store().read().fingerprint(),
        fresh.store().read().fingerprint()
    );
}

#[test]
fn test_reindexing_unchanged_repository_writes_nothing() {
    let dir = fixture_repo();
    let engine = in_memory(dir.path());
    let first = engine.index_full(None).unwrap();
    assert!(first.wal_entries > 0);
    let sequence = engine.store().last_sequence();

    let again = engine.index_full(None).unwrap();
    assert_eq!(again.wal_entries, 0);
    assert_eq!(again.files_unchanged, 4);
    let patch = engine.index_incremental("auth/register.py", REGISTER.as_bytes()).unwrap();
    assert!(patch.unchanged);
    assert_eq!(engine.store().last_sequence(), sequence);
}

#[test]
fn test_build_is_deterministic() {
    let one = parse_and_build("auth/register.py", Language::Python, REGISTER.as_bytes().to_vec());
    let two = parse_and_build("auth/register.py", Language::Python, REGISTER.as_bytes().to_vec());
    assert_eq!(
        serde_json::to_vec(&one.output.nodes).unwrap(),
        serde_json::to_vec(&two.output.nodes).unwrap()
    );
    assert_eq!(one.output.contains, two.output.contains);
}

#[test]
fn test_wal_replay_reconstructs_the_graph() {
    let dir = fixture_repo();
    let state = tempfile::tempdir().unwrap();
    let (fingerprint, nodes) = {
        let engine = persistent(dir.path(), state.path());
        engine.index_full(None).unwrap();
        engine
            .index_incremental("ui/charts.py", format!("{CHARTS}\n\ndef chart_title(t):\n    return t\n").as_bytes())
            .unwrap();
        let graph = engine.store().read();
        (graph.fingerprint(), graph.node_count())
    };

    let reopened = persistent(dir.path(), state.path());
    let graph = reopened.store().read();
    assert_eq!(graph.node_count(), nodes);
    assert_eq!(graph.fingerprint(), fingerprint);
}

#[test]
fn test_snapshot_restore_rolls_back_later_edits() {
    let dir = fixture_repo();
    let state = tempfile::tempdir().unwrap();
    let engine = persistent(dir.path(), state.path());
    engine.index_full(None).unwrap();
    let before = engine.store().read().fingerprint();
    let snapshot = engine.snapshot_create("baseline").unwrap();
    assert_eq!(engine.snapshot_list().unwrap().len(), 1);

    engine.index_remove("billing/invoices.py").unwrap();
    assert!(engine.store().read().file("billing/invoices.py").is_none());

    engine.snapshot_restore(&snapshot.id).unwrap();
    assert_eq!(engine.store().read().fingerprint(), before);
    assert!(engine.snapshot_restore("no-such-snapshot").is_err());
}

#[test]
fn test_inheritance_cycles_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "models/shapes.py",
        "class Shape:\n    pass\n\n\nclass Square(Shape):\n    pass\n",
    );
    let engine = in_memory(dir.path());
    engine.index_full(None).unwrap();
    let square = NodeId::from("class:models.shapes.Square");
    let shape = NodeId::from("class:models.shapes.Shape");
    assert_eq!(engine.store().read().count_edges(EdgeKind::Inherits), 1);

    let before = engine.store().read().fingerprint();
    let mut tx = Transaction::new();
    tx.create_edge(Edge::new(
        EdgeKind::Inherits,
        shape,
        square,
        Confidence::RESOLVED,
        true,
        EdgeMetadata::Inherits {
            relation: InheritKind::Extends,
        },
    ));
    assert!(matches!(
        engine.store().apply(tx),
        Err(StoreError::InvariantViolation(Violation::InheritsCycle(_)))
    ));
    assert_eq!(engine.store().read().fingerprint(), before);
}

#[test]
fn test_edge_confidence_bounds_hold_after_indexing() {
    let dir = fixture_repo();
    write(
        dir.path(),
        "ui/dashboard.py",
        "import requests\nfrom ui.charts import render_chart\n\n\ndef dashboard(client):\n    client.fetch()\n    return render_chart(unknown_helper())\n",
    );
    let engine = in_memory(dir.path());
    let result = engine.index_full(None).unwrap();
    assert!(result.unresolved_references > 0);

    let state = engine.store().read();
    assert!(state.edge_count() > 0);
    for edge in state.edges() {
        let value = edge.confidence.value();
        assert!((0.0..=1.0).contains(&value), "{}", edge.id);
        if !edge.is_resolved {
            assert!(value <= 0.7, "{}", edge.id);
        }
    }
    assert!(state.count_nodes(NodeKind::Module) > 0);
}

#[test]
fn test_score_without_embeddings_uses_graph_and_execution() {
    let scorer = HybridScorer::new(EngineConfig::default().query.weights, 5);
    let weights = scorer.weights_for(false, true);
    assert_eq!(weights.semantic, 0.0);
    assert!((weights.graph + weights.execution - 1.0).abs() < 1e-9);

    let breakdown = scorer.score(Signals {
        semantic: None,
        graph_distance: Some(1),
        execution: Some(1.0),
    });
    assert!((breakdown.score - (0.5 * 0.5 + 0.5 * 1.0)).abs() < 1e-9);
}

fn layered_classes() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "pkg/a.py", "class A:\n    def foo(self):\n        return 1\n");
    write(dir.path(), "pkg/b.py", "from pkg.a import A\n\n\nclass B(A):\n    pass\n");
    write(dir.path(), "pkg/c.py", "from pkg.b import B\n\n\nclass C(B):\n    pass\n");
    write(dir.path(), "pkg/d.py", "from pkg.c import C\n\n\ndef run():\n    return C.foo()\n");
    dir
}

#[test]
fn test_dropping_a_base_reresolves_calls_through_subclasses() {
    let run = NodeId::from("function:pkg.d.run");
    let foo = NodeId::from("function:pkg.a.A.foo");
    let call_to_foo = |engine: &Engine| {
        engine
            .store()
            .read()
            .outgoing(&run)
            .find(|e| e.kind == EdgeKind::Calls && e.target == foo)
            .cloned()
            .unwrap()
    };

    let dir = layered_classes();
    let engine = in_memory(dir.path());
    engine.index_full(None).unwrap();
    let before = call_to_foo(&engine);
    assert!(before.is_resolved);
    assert_eq!(before.confidence.value(), 1.0);

    let flat = "class B:\n    pass\n";
    engine.index_incremental("pkg/b.py", flat.as_bytes()).unwrap();
    let after = call_to_foo(&engine);
    assert!(!after.is_resolved);
    assert_eq!(after.confidence.value(), 0.6);

    let fresh_dir = layered_classes();
    write(fresh_dir.path(), "pkg/b.py", flat);
    let fresh = in_memory(fresh_dir.path());
    fresh.index_full(None).unwrap();
    assert_eq!(call_to_foo(&fresh), after);
    assert_eq!(
        engine.store().read().fingerprint(),
        fresh.store().read().fingerprint()
    );
}

#[test]
fn test_ambiguous_relations_carry_their_confidence() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "addr/one.py",
        "class One:\n    def validate_address(self):\n        return True\n",
    );
    write(
        dir.path(),
        "addr/two.py",
        "class Two:\n    def validate_address(self):\n        return False\n",
    );
    write(
        dir.path(),
        "auth/register.py",
        "def register_user(client):\n    return client.validate_address()\n",
    );
    let engine = in_memory(dir.path());
    engine.index_full(None).unwrap();

    let pack = engine.query(&QueryRequest::new("register user"));
    let register = pack
        .files
        .iter()
        .find(|f| f.path == "auth/register.py")
        .unwrap();
    let guessed: Vec<_> = register
        .related
        .iter()
        .filter(|r| r.qualified_name.ends_with(".validate_address"))
        .collect();
    assert_eq!(guessed.len(), 2, "{:?}", register.related);
    for reference in &guessed {
        assert_eq!(reference.hops, 1);
        assert!(reference.confidence < 0.7, "{}", reference.confidence);
    }
    assert!(register
        .related
        .iter()
        .any(|r| r.hops == 0 && r.confidence == 1.0));
    assert!(
        register.rationale.contains("low-confidence relation to"),
        "{}",
        register.rationale
    );
}
