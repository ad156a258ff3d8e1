//! Retrieval backend: seeded graph distance, hybrid ranking and context pack
//! assembly.
//!
//! A query runs in three phases. Candidate descriptors are copied out of the
//! committed graph under a read lock, embeddings are computed with no lock
//! held, and the graph is read again to measure distances and assemble the
//! pack. Writers are never blocked behind the encoder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info_span, warn};

use crate::config::QueryConfig;
use crate::models::{
    Confidence, ContextPack, EdgeKind, FileReference, LineRange, Node, NodeId, NodeKind,
    NodeReference, ScoreBreakdown,
};
use crate::query::embedding::{cosine_similarity, node_cache_key, EmbeddingEngine};
use crate::query::guards::{
    clamp_hops, clamp_results, truncate_query, MAX_GRAPH_VISITED, MAX_RELATED_PER_FILE,
};
use crate::query::hybrid::{rank_order, Dominant, HybridScorer, Signals};
use crate::query::signals::{ExecutionLog, ExecutionSignals};
use crate::query::tokenizer::{lexical_match, term_matches, terms, LexicalMatch};
use crate::store::{GraphState, GraphStore};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Edges that define graph distance between a candidate and a seed.
const DISTANCE_EDGES: [EdgeKind; 5] = [
    EdgeKind::Calls,
    EdgeKind::Imports,
    EdgeKind::Inherits,
    EdgeKind::ReadsWrites,
    EdgeKind::Contains,
];

const MAX_LEXICAL_SEEDS: usize = 8;
/// Share of a name's terms the query must cover for the name to seed.
const LEXICAL_SEED_COVERAGE: f64 = 0.5;
/// Candidates scoring below this are noise and never reach the pack.
const MIN_RELEVANCE: f64 = 0.05;
/// Ranked nodes per file used as starting points for neighbour expansion.
const EXPANSION_ROOTS: usize = 3;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub text: String,
    pub max_results: Option<usize>,
    pub max_hops: Option<u32>,
    pub execution_log: Option<ExecutionLog>,
    /// Overrides the configured deadline.
    pub deadline: Option<Duration>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn max_results(mut self, value: usize) -> Self {
        self.max_results = Some(value);
        self
    }

    pub fn max_hops(mut self, value: u32) -> Self {
        self.max_hops = Some(value);
        self
    }

    pub fn execution_log(mut self, log: ExecutionLog) -> Self {
        self.execution_log = Some(log);
        self
    }

    pub fn deadline(mut self, value: Duration) -> Self {
        self.deadline = Some(value);
        self
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Candidate {
    id: NodeId,
    kind: NodeKind,
    name: String,
    qualified_name: String,
    file_path: String,
    lines: Option<LineRange>,
    cache_key: Option<String>,
    text: String,
    lexical: Option<LexicalMatch>,
    matched_terms: Vec<String>,
}

fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

fn collect_candidates(state: &GraphState, query_terms: &[String]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for node in state.nodes() {
        if node.kind() == NodeKind::Module {
            continue;
        }
        let Some(file_path) = node.file_path() else {
            continue;
        };
        let name_terms = match node {
            Node::File(_) => terms(file_stem(node.name())),
            _ => terms(node.name()),
        };
        let lexical = lexical_match(query_terms, &name_terms)
            .filter(|m| m.target_coverage >= LEXICAL_SEED_COVERAGE);
        let matched_terms = if lexical.is_some() {
            name_terms
                .iter()
                .filter(|t| query_terms.iter().any(|q| term_matches(q, t)))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        out.push(Candidate {
            id: node.id().clone(),
            kind: node.kind(),
            name: node.name().to_string(),
            qualified_name: node.qualified_name().to_string(),
            file_path: file_path.to_string(),
            lines: node.lines(),
            cache_key: node_cache_key(node),
            text: node.embedding_text(),
            lexical,
            matched_terms,
        });
    }
    out
}

/// Lexical seeds first, strongest match first, then everything else in id
/// order, so a deadline cuts the least promising candidates.
fn processing_order(candidates: &[Candidate]) -> Vec<usize> {
    let mut seeded: Vec<usize> = (0..candidates.len())
        .filter(|i| candidates[*i].lexical.is_some())
        .collect();
    seeded.sort_by(|a, b| {
        let (ca, cb) = (&candidates[*a], &candidates[*b]);
        let sa = ca.lexical.map_or(0.0, |m| m.score());
        let sb = cb.lexical.map_or(0.0, |m| m.score());
        sb.total_cmp(&sa)
            .then_with(|| ca.qualified_name.cmp(&cb.qualified_name))
    });
    let rest = (0..candidates.len()).filter(|i| candidates[*i].lexical.is_none());
    seeded.into_iter().chain(rest).collect()
}

// ---------------------------------------------------------------------------
// Graph distance
// ---------------------------------------------------------------------------

/// Last hop on the shortest path from a seed to a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub from: NodeId,
    pub from_name: String,
    pub kind: EdgeKind,
    /// True when the edge points from `from` to the reached node.
    pub forward: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Reach {
    distance: u32,
    seed_name: String,
    step: Option<Step>,
    confidence: f64,
}

/// Multi-source BFS over the undirected distance edges, bounded by
/// `max_distance` hops and [`MAX_GRAPH_VISITED`] nodes.
fn graph_distances(state: &GraphState, seeds: &[NodeId], max_distance: u32) -> HashMap<NodeId, Reach> {
    let mut reached: HashMap<NodeId, Reach> = HashMap::new();
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    for seed in seeds {
        let Some(node) = state.node(seed) else {
            continue;
        };
        if reached.contains_key(seed) {
            continue;
        }
        reached.insert(
            seed.clone(),
            Reach {
                distance: 0,
                seed_name: node.name().to_string(),
                step: None,
                confidence: 1.0,
            },
        );
        queue.push_back(seed.clone());
    }

    while let Some(current) = queue.pop_front() {
        if reached.len() >= MAX_GRAPH_VISITED {
            break;
        }
        let Some(here) = reached.get(&current).cloned() else {
            continue;
        };
        if here.distance >= max_distance {
            continue;
        }
        let current_name = state
            .node(&current)
            .map(|n| n.name().to_string())
            .unwrap_or_default();
        let edges = state
            .outgoing(&current)
            .chain(state.incoming(&current))
            .filter(|e| DISTANCE_EDGES.contains(&e.kind));
        for edge in edges {
            let next = edge.other_end(&current);
            if reached.contains_key(next) || !state.contains_node(next) {
                continue;
            }
            reached.insert(
                next.clone(),
                Reach {
                    distance: here.distance + 1,
                    seed_name: here.seed_name.clone(),
                    step: Some(Step {
                        from: current.clone(),
                        from_name: current_name.clone(),
                        kind: edge.kind,
                        forward: edge.source == current,
                    }),
                    confidence: here.confidence * edge.confidence.value(),
                },
            );
            queue.push_back(next.clone());
        }
    }
    reached
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Why a candidate was ranked where it was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Provenance {
    pub matched_terms: Vec<String>,
    pub semantic_seed: bool,
    pub seed_name: Option<String>,
    pub step: Option<Step>,
    /// Product of edge confidences along the path from the seed.
    pub path_confidence: f64,
    pub log_line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub qualified_name: String,
    pub file_path: String,
    pub lines: Option<LineRange>,
    pub breakdown: ScoreBreakdown,
    pub provenance: Provenance,
}

impl RankedCandidate {
    fn reference(&self, hops: u32, via: Option<EdgeKind>, score: f64) -> NodeReference {
        NodeReference {
            node_id: self.node_id.clone(),
            kind: self.kind,
            qualified_name: self.qualified_name.clone(),
            lines: self.lines,
            score,
            breakdown: if hops == 0 { Some(self.breakdown.clone()) } else { None },
            confidence: self.provenance.path_confidence,
            hops,
            via,
        }
    }
}

/// Run one retrieval query end to end. Never fails: problems become notes
/// on the returned pack.
pub fn run_query(
    store: &GraphStore,
    embeddings: &EmbeddingEngine,
    config: &QueryConfig,
    warning_threshold: f64,
    request: &QueryRequest,
) -> ContextPack {
    let span = info_span!("query", chars = request.text.len());
    let _enter = span.enter();
    let started = Instant::now();
    let deadline = started
        + request
            .deadline
            .unwrap_or(Duration::from_millis(config.deadline_ms));
    let text = truncate_query(&request.text);
    let max_hops = clamp_hops(request.max_hops.unwrap_or(config.max_hops));
    let max_results = clamp_results(request.max_results.unwrap_or(config.max_results));
    if text.is_empty() {
        return ContextPack::empty(text, max_hops, "query is empty");
    }
    let query_terms = terms(text);
    let mut notes: Vec<String> = Vec::new();

    let signals = match &request.execution_log {
        None => None,
        Some(log) => {
            let parsed = ExecutionSignals::parse(log);
            if parsed.is_none() {
                notes.push(format!(
                    "execution log version {} is not supported; execution signal ignored",
                    log.version
                ));
            }
            parsed
        }
    };

    let candidates = {
        let state = store.read();
        if state.node_count() == 0 {
            return ContextPack::empty(text, max_hops, "graph is empty; index the repository first");
        }
        collect_candidates(&state, &query_terms)
    };

    let query_vector = embeddings.embed(text);
    if query_vector.is_none() {
        warn!(encoder = embeddings.encoder_name(), "query embedding unavailable; falling back");
        notes.push("semantic similarity unavailable; ranked on graph and execution signals".into());
    }

    let mut truncated = false;
    let mut processed: Vec<(usize, Option<f64>)> = Vec::with_capacity(candidates.len());
    for index in processing_order(&candidates) {
        if Instant::now() >= deadline {
            truncated = true;
            break;
        }
        let candidate = &candidates[index];
        let semantic = query_vector.as_ref().and_then(|q| {
            let vector = match &candidate.cache_key {
                Some(key) => embeddings.embed_keyed(key, &candidate.text),
                None => embeddings.embed(&candidate.text),
            }?;
            Some(cosine_similarity(q, &vector))
        });
        processed.push((index, semantic));
    }
    if truncated {
        notes.push(format!(
            "deadline reached after scoring {} of {} candidates",
            processed.len(),
            candidates.len()
        ));
    }

    let mut seeds: Vec<NodeId> = Vec::new();
    let mut semantic_seeds: HashSet<NodeId> = HashSet::new();
    for (index, _) in processed.iter().take(MAX_LEXICAL_SEEDS) {
        if candidates[*index].lexical.is_some() {
            seeds.push(candidates[*index].id.clone());
        }
    }
    let mut by_similarity: Vec<(usize, f64)> = processed
        .iter()
        .filter_map(|(i, s)| s.map(|s| (*i, s)))
        .filter(|(i, s)| *s >= config.seed_similarity && candidates[*i].lexical.is_none())
        .collect();
    by_similarity.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| candidates[a.0].qualified_name.cmp(&candidates[b.0].qualified_name))
    });
    for (index, _) in by_similarity.into_iter().take(config.semantic_seed_count) {
        seeds.push(candidates[index].id.clone());
        semantic_seeds.insert(candidates[index].id.clone());
    }

    let scorer = HybridScorer::new(config.weights, config.max_graph_distance);
    let state = store.read();
    let distances = graph_distances(&state, &seeds, config.max_graph_distance);

    let raw_execution: Vec<f64> = processed
        .iter()
        .map(|(i, _)| {
            let c = &candidates[*i];
            signals
                .as_ref()
                .map_or(0.0, |s| s.raw_score(&c.file_path, c.lines))
        })
        .collect();
    let max_execution = raw_execution.iter().copied().fold(0.0f64, f64::max);

    let mut ranked: Vec<RankedCandidate> = Vec::new();
    for ((index, semantic), raw) in processed.iter().zip(&raw_execution) {
        let candidate = &candidates[*index];
        if !state.contains_node(&candidate.id) {
            continue;
        }
        let reach = distances.get(&candidate.id);
        let execution = signals.as_ref().map(|_| {
            if max_execution > 0.0 {
                raw / max_execution
            } else {
                0.0
            }
        });
        let breakdown = scorer.score(Signals {
            semantic: *semantic,
            graph_distance: reach.map(|r| r.distance),
            execution,
        });
        if breakdown.score < MIN_RELEVANCE {
            continue;
        }
        ranked.push(RankedCandidate {
            node_id: candidate.id.clone(),
            kind: candidate.kind,
            name: candidate.name.clone(),
            qualified_name: candidate.qualified_name.clone(),
            file_path: candidate.file_path.clone(),
            lines: candidate.lines,
            breakdown,
            provenance: Provenance {
                matched_terms: candidate.matched_terms.clone(),
                semantic_seed: semantic_seeds.contains(&candidate.id),
                seed_name: reach.map(|r| r.seed_name.clone()),
                step: reach.and_then(|r| r.step.clone()),
                path_confidence: reach.map_or(1.0, |r| r.confidence),
                log_line: signals
                    .as_ref()
                    .and_then(|s| s.first_hit(&candidate.file_path, candidate.lines)),
            },
        });
    }
    ranked.sort_by(|a, b| {
        rank_order(
            (&a.breakdown, a.qualified_name.as_str()),
            (&b.breakdown, b.qualified_name.as_str()),
        )
    });

    let options = AssembleOptions {
        max_results,
        max_hops,
        warning_threshold,
    };
    let mut pack = assemble(&state, &scorer, text, &ranked, &options);
    drop(state);
    if pack.files.is_empty() {
        notes.push("no code matched the query".into());
    }
    pack.truncated = truncated;
    pack.notes.extend(notes);
    debug!(
        seeds = seeds.len(),
        ranked = ranked.len(),
        files = pack.files.len(),
        truncated,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "query ranked"
    );
    pack
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssembleOptions {
    pub max_results: usize,
    pub max_hops: u32,
    pub warning_threshold: f64,
}

fn relation(kind: EdgeKind, forward: bool) -> &'static str {
    match (kind, forward) {
        (EdgeKind::Calls, true) => "called by",
        (EdgeKind::Calls, false) => "calls",
        (EdgeKind::Imports, true) => "imported by",
        (EdgeKind::Imports, false) => "imports",
        (EdgeKind::Inherits, true) => "inherited by",
        (EdgeKind::Inherits, false) => "inherits from",
        (EdgeKind::ReadsWrites, true) => "accessed by",
        (EdgeKind::ReadsWrites, false) => "accesses",
        (EdgeKind::Contains, true) => "declared in",
        (EdgeKind::Contains, false) => "contains",
        (EdgeKind::Tests, true) => "tested by",
        (EdgeKind::Tests, false) => "tests",
    }
}

fn subject(top: &RankedCandidate) -> String {
    match top.kind {
        NodeKind::File => "file".to_string(),
        kind => format!("contains {kind} {}", top.name),
    }
}

fn rationale(scorer: &HybridScorer, top: &RankedCandidate) -> String {
    let subject = subject(top);
    let b = &top.breakdown;
    match scorer.dominant(b) {
        Dominant::Graph => match (&top.provenance.step, b.graph_distance) {
            (Some(step), Some(distance)) => {
                let mut text = format!("{subject}, {} {}", relation(step.kind, step.forward), step.from_name);
                if distance > 1 {
                    if let Some(seed) = &top.provenance.seed_name {
                        text.push_str(&format!(" ({distance} hops from {seed})"));
                    }
                }
                text
            }
            _ if !top.provenance.matched_terms.is_empty() => format!(
                "{subject} matching query terms ({})",
                top.provenance.matched_terms.join(", ")
            ),
            _ => format!(
                "{subject}, semantically similar to the query ({:.2})",
                b.semantic.unwrap_or(0.0)
            ),
        },
        Dominant::Semantic => format!(
            "{subject}, semantically similar to the query ({:.2})",
            b.semantic.unwrap_or(0.0)
        ),
        Dominant::Execution => match top.provenance.log_line {
            Some(line) => format!("{subject}, referenced by the execution log at line {line}"),
            None => format!("{subject}, file referenced by the execution log"),
        },
    }
}

fn parse_confidence(state: &GraphState, path: &str) -> f64 {
    state
        .file(path)
        .map_or(1.0, |f| Confidence::for_parse(f.parse_status, f.error_count).value())
}

/// Flag the weakest related node when its path confidence is low.
fn annotate_related(entry: &mut FileEntry, threshold: f64) {
    let weakest = entry
        .related
        .iter()
        .filter(|r| Confidence::new(r.confidence).should_warn(threshold))
        .min_by(|a, b| a.confidence.total_cmp(&b.confidence));
    if let Some(weakest) = weakest {
        entry.rationale = format!(
            "{}; warning: low-confidence relation to {} ({:.2})",
            entry.rationale, weakest.qualified_name, weakest.confidence
        );
    }
}

fn annotate(rationale: String, confidence: f64, threshold: f64) -> String {
    if Confidence::new(confidence).should_warn(threshold) {
        format!("{rationale}; warning: low confidence ({confidence:.2})")
    } else {
        rationale
    }
}

struct Expansion {
    node_id: NodeId,
    hops: u32,
    via: EdgeKind,
    /// True when the edge points from `from_name` to the reached node.
    forward: bool,
    from_name: String,
    confidence: f64,
}

/// BFS along retrieval edges only; structural and test edges never widen a
/// pack.
fn expand(state: &GraphState, root: &NodeId, max_hops: u32) -> Vec<Expansion> {
    let mut visited: HashSet<&NodeId> = HashSet::from([root]);
    let mut queue: VecDeque<(&NodeId, u32, f64)> = VecDeque::from([(root, 0, 1.0)]);
    let mut out = Vec::new();
    while let Some((current, depth, confidence)) = queue.pop_front() {
        if depth >= max_hops {
            continue;
        }
        let current_name = state.node(current).map(|n| n.name().to_string()).unwrap_or_default();
        let edges = state
            .outgoing(current)
            .chain(state.incoming(current))
            .filter(|e| EdgeKind::RETRIEVAL.contains(&e.kind));
        for edge in edges {
            let next = edge.other_end(current);
            if !visited.insert(next) || !state.contains_node(next) {
                continue;
            }
            let reach = confidence * edge.confidence.value();
            out.push(Expansion {
                node_id: next.clone(),
                hops: depth + 1,
                via: edge.kind,
                forward: &edge.source == current,
                from_name: current_name.clone(),
                confidence: reach,
            });
            queue.push_back((next, depth + 1, reach));
        }
    }
    out
}

struct FileEntry {
    path: String,
    relevance: f64,
    confidence: f64,
    rationale: String,
    related: Vec<NodeReference>,
    seen: HashSet<NodeId>,
}

impl FileEntry {
    fn push(&mut self, reference: NodeReference) {
        if self.related.len() < MAX_RELATED_PER_FILE && self.seen.insert(reference.node_id.clone()) {
            self.related.push(reference);
        }
    }
}

/// Turn ranked candidates into a bounded, explained pack: the top distinct
/// files, each with a rationale and related nodes, widened by neighbour
/// expansion along imports, inheritance and calls.
pub fn assemble(
    state: &GraphState,
    scorer: &HybridScorer,
    query: &str,
    ranked: &[RankedCandidate],
    options: &AssembleOptions,
) -> ContextPack {
    let max_results = clamp_results(options.max_results);
    let max_hops = clamp_hops(options.max_hops);

    let mut entries: Vec<FileEntry> = Vec::new();
    let mut by_path: HashMap<String, usize> = HashMap::new();
    let mut roots: Vec<Vec<&RankedCandidate>> = Vec::new();
    for candidate in ranked {
        let slot = match by_path.get(&candidate.file_path) {
            Some(slot) => *slot,
            None => {
                if entries.len() >= max_results {
                    continue;
                }
                let path_confidence = match scorer.dominant(&candidate.breakdown) {
                    Dominant::Graph => candidate.provenance.path_confidence,
                    _ => 1.0,
                };
                let confidence = parse_confidence(state, &candidate.file_path) * path_confidence;
                entries.push(FileEntry {
                    path: candidate.file_path.clone(),
                    relevance: candidate.breakdown.score,
                    confidence,
                    rationale: annotate(rationale(scorer, candidate), confidence, options.warning_threshold),
                    related: Vec::new(),
                    seen: HashSet::new(),
                });
                roots.push(Vec::new());
                by_path.insert(candidate.file_path.clone(), entries.len() - 1);
                entries.len() - 1
            }
        };
        entries[slot].push(candidate.reference(0, None, candidate.breakdown.score));
        if roots[slot].len() < EXPANSION_ROOTS {
            roots[slot].push(candidate);
        }
    }

    let ranked_files = entries.len();
    let mut reached_files: HashMap<String, (f64, f64, String)> = HashMap::new();
    for slot in 0..ranked_files {
        let relevance = entries[slot].relevance;
        for root in roots[slot].clone() {
            for step in expand(state, &root.node_id, max_hops) {
                let Some(node) = state.node(&step.node_id) else {
                    continue;
                };
                let score = relevance / (1.0 + f64::from(step.hops));
                entries[slot].push(NodeReference {
                    node_id: step.node_id.clone(),
                    kind: node.kind(),
                    qualified_name: node.qualified_name().to_string(),
                    lines: node.lines(),
                    score,
                    breakdown: None,
                    confidence: step.confidence,
                    hops: step.hops,
                    via: Some(step.via),
                });
                let Some(path) = node.file_path() else {
                    continue;
                };
                if by_path.contains_key(path) {
                    continue;
                }
                let why = format!(
                    "{} {} {}, {} hop(s) from {}",
                    node.kind(),
                    node.name(),
                    relation(step.via, step.forward),
                    step.from_name,
                    root.name
                );
                let confidence = parse_confidence(state, path) * step.confidence;
                let better = reached_files.get(path).map_or(true, |(s, _, _)| score > *s);
                if better {
                    reached_files.insert(path.to_string(), (score, confidence, why));
                }
            }
        }
    }

    for entry in &mut entries {
        annotate_related(entry, options.warning_threshold);
    }

    let mut extra: Vec<(String, (f64, f64, String))> = reached_files.into_iter().collect();
    extra.sort_by(|a, b| b.1 .0.total_cmp(&a.1 .0).then_with(|| a.0.cmp(&b.0)));
    for (path, (relevance, confidence, why)) in extra {
        if entries.len() >= max_results {
            break;
        }
        entries.push(FileEntry {
            path,
            relevance,
            confidence,
            rationale: annotate(why, confidence, options.warning_threshold),
            related: Vec::new(),
            seen: HashSet::new(),
        });
    }

    let weight: f64 = entries.iter().map(|e| e.relevance).sum();
    let total_confidence = if weight > 0.0 {
        entries.iter().map(|e| e.relevance * e.confidence).sum::<f64>() / weight
    } else {
        0.0
    };
    ContextPack {
        query: query.to_string(),
        files: entries
            .into_iter()
            .map(|e| FileReference {
                path: e.path,
                relevance: e.relevance,
                confidence: e.confidence,
                rationale: e.rationale,
                related: e.related,
            })
            .collect(),
        total_confidence,
        max_hops,
        truncated: false,
        notes: Vec::new(),
    }
}
