//! Hybrid scoring for retrieval candidates.
//!
//! `score = w_s * semantic + w_g * 1/(1 + distance) + w_e * execution`.
//! When the semantic signal is missing the graph and execution signals share
//! the weight equally; when execution is missing too, graph proximity alone
//! decides. A missing execution signal with semantics present splits the
//! weight evenly between semantic and graph.

use std::cmp::Ordering;

use crate::config::ScoreWeights;
use crate::models::ScoreBreakdown;

const FALLBACK_SHARE: f64 = 0.5;

/// Raw per-candidate inputs. `None` means unavailable, not zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signals {
    pub semantic: Option<f64>,
    pub graph_distance: Option<u32>,
    pub execution: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominant {
    Semantic,
    Graph,
    Execution,
}

/// Effective weights after renormalisation for missing signals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub semantic: f64,
    pub graph: f64,
    pub execution: f64,
}

impl Weights {
    pub fn total(&self) -> f64 {
        self.semantic + self.graph + self.execution
    }
}

pub fn graph_proximity(distance: Option<u32>, max_distance: u32) -> f64 {
    match distance {
        Some(d) if d <= max_distance => 1.0 / (1.0 + f64::from(d)),
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridScorer {
    weights: ScoreWeights,
    max_distance: u32,
}

impl HybridScorer {
    pub fn new(weights: ScoreWeights, max_distance: u32) -> Self {
        Self {
            weights,
            max_distance,
        }
    }

    pub fn max_distance(&self) -> u32 {
        self.max_distance
    }

    pub fn weights_for(&self, semantic: bool, execution: bool) -> Weights {
        match (semantic, execution) {
            (true, true) => Weights {
                semantic: self.weights.semantic,
                graph: self.weights.graph,
                execution: self.weights.execution,
            },
            (false, true) => Weights {
                semantic: 0.0,
                graph: FALLBACK_SHARE,
                execution: FALLBACK_SHARE,
            },
            (true, false) => Weights {
                semantic: FALLBACK_SHARE,
                graph: FALLBACK_SHARE,
                execution: 0.0,
            },
            (false, false) => Weights {
                semantic: 0.0,
                graph: 1.0,
                execution: 0.0,
            },
        }
    }

    pub fn score(&self, signals: Signals) -> ScoreBreakdown {
        let semantic = signals.semantic.map(|s| s.clamp(0.0, 1.0));
        let execution = signals.execution.map(|e| e.clamp(0.0, 1.0));
        let graph = graph_proximity(signals.graph_distance, self.max_distance);
        let w = self.weights_for(semantic.is_some(), execution.is_some());
        let score = w.semantic * semantic.unwrap_or(0.0)
            + w.graph * graph
            + w.execution * execution.unwrap_or(0.0);
        ScoreBreakdown {
            semantic,
            graph,
            execution,
            graph_distance: signals
                .graph_distance
                .filter(|d| *d <= self.max_distance),
            score: score.clamp(0.0, 1.0),
        }
    }

    /// Signal contributing the most to a breakdown's score. Ties go to the
    /// graph, then semantics.
    pub fn dominant(&self, breakdown: &ScoreBreakdown) -> Dominant {
        let w = self.weights_for(breakdown.semantic.is_some(), breakdown.execution.is_some());
        let graph = w.graph * breakdown.graph;
        let semantic = w.semantic * breakdown.semantic.unwrap_or(0.0);
        let execution = w.execution * breakdown.execution.unwrap_or(0.0);
        if graph >= semantic && graph >= execution {
            Dominant::Graph
        } else if semantic >= execution {
            Dominant::Semantic
        } else {
            Dominant::Execution
        }
    }
}

/// Score descending, then graph distance ascending (unreached last), then
/// qualified name.
pub fn rank_order(a: (&ScoreBreakdown, &str), b: (&ScoreBreakdown, &str)) -> Ordering {
    b.0.score
        .total_cmp(&a.0.score)
        .then_with(|| match (a.0.graph_distance, b.0.graph_distance) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.1.cmp(b.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> HybridScorer {
        HybridScorer::new(ScoreWeights::default(), 5)
    }

    #[test]
    fn test_full_formula() {
        let b = scorer().score(Signals {
            semantic: Some(0.5),
            graph_distance: Some(1),
            execution: Some(1.0),
        });
        assert!((b.score - (0.4 * 0.5 + 0.4 * 0.5 + 0.2 * 1.0)).abs() < 1e-9);
        assert_eq!(b.graph_distance, Some(1));
    }

    #[test]
    fn test_fallback_weights_sum_to_one() {
        let s = scorer();
        for (sem, exec) in [(false, true), (true, false), (false, false), (true, true)] {
            assert!((s.weights_for(sem, exec).total() - 1.0).abs() < 1e-9);
        }
        let b = s.score(Signals {
            semantic: None,
            graph_distance: Some(0),
            execution: Some(0.4),
        });
        assert!((b.score - (0.5 * 1.0 + 0.5 * 0.4)).abs() < 1e-9);
        let graph_only = s.score(Signals {
            semantic: None,
            graph_distance: Some(3),
            execution: None,
        });
        assert!((graph_only.score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_distance_beyond_cap_contributes_nothing() {
        assert_eq!(graph_proximity(Some(6), 5), 0.0);
        assert_eq!(graph_proximity(None, 5), 0.0);
        let b = scorer().score(Signals {
            semantic: None,
            graph_distance: Some(9),
            execution: None,
        });
        assert_eq!(b.score, 0.0);
        assert_eq!(b.graph_distance, None);
    }

    #[test]
    fn test_ties_break_on_distance_then_name() {
        let s = scorer();
        let near = s.score(Signals {
            semantic: Some(0.0),
            graph_distance: Some(1),
            execution: None,
        });
        let mut far = near.clone();
        far.graph_distance = Some(2);
        let mut unreached = near.clone();
        unreached.graph_distance = None;
        let mut rows = vec![(&unreached, "a"), (&far, "a"), (&near, "z"), (&near, "b")];
        rows.sort_by(|x, y| rank_order(*x, *y));
        let order: Vec<(Option<u32>, &str)> = rows.iter().map(|(b, n)| (b.graph_distance, *n)).collect();
        assert_eq!(
            order,
            vec![(Some(1), "b"), (Some(1), "z"), (Some(2), "a"), (None, "a")]
        );
    }

    #[test]
    fn test_dominant_signal() {
        let s = scorer();
        let semantic = s.score(Signals {
            semantic: Some(0.9),
            graph_distance: None,
            execution: None,
        });
        assert_eq!(s.dominant(&semantic), Dominant::Semantic);
        let traced = s.score(Signals {
            semantic: None,
            graph_distance: None,
            execution: Some(1.0),
        });
        assert_eq!(s.dominant(&traced), Dominant::Execution);
        let seed = s.score(Signals {
            semantic: Some(0.2),
            graph_distance: Some(0),
            execution: Some(0.0),
        });
        assert_eq!(s.dominant(&seed), Dominant::Graph);
    }
}
