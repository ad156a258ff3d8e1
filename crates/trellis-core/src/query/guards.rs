//! Shared guardrails for query payload bounds and traversal limits.

pub const MAX_QUERY_LENGTH: usize = 512;
pub const MIN_HOPS: u32 = 1;
pub const MAX_HOPS: u32 = 5;
pub const MAX_RESULTS: usize = 50;
pub const MAX_IMPACT_DEPTH: u32 = 6;
pub const MAX_NEIGHBOR_HOPS: u32 = 6;
/// Depth of caller chains searched for transitive test coverage.
pub const MAX_TEST_DEPTH: u32 = 3;
/// Node budget for one graph-distance search.
pub const MAX_GRAPH_VISITED: usize = 20_000;
/// Related nodes listed per file in a context pack.
pub const MAX_RELATED_PER_FILE: usize = 8;

pub fn clamp_hops(value: u32) -> u32 {
    value.clamp(MIN_HOPS, MAX_HOPS)
}

pub fn clamp_results(value: usize) -> usize {
    value.clamp(1, MAX_RESULTS)
}

pub fn clamp_depth(value: u32, maximum: u32) -> u32 {
    value.clamp(1, maximum)
}

/// Trimmed query cut to [`MAX_QUERY_LENGTH`] bytes on a char boundary.
pub fn truncate_query(query: &str) -> &str {
    let stripped = query.trim();
    if stripped.len() <= MAX_QUERY_LENGTH {
        return stripped;
    }
    let mut end = MAX_QUERY_LENGTH;
    while !stripped.is_char_boundary(end) {
        end -= 1;
    }
    &stripped[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps() {
        assert_eq!(clamp_hops(0), 1);
        assert_eq!(clamp_hops(9), 5);
        assert_eq!(clamp_results(0), 1);
        assert_eq!(clamp_results(500), MAX_RESULTS);
        assert_eq!(clamp_depth(10, MAX_IMPACT_DEPTH), 6);
    }

    #[test]
    fn test_truncate_query_respects_char_boundaries() {
        assert_eq!(truncate_query("  hi  "), "hi");
        let long = "é".repeat(400);
        let cut = truncate_query(&long);
        assert!(cut.len() <= MAX_QUERY_LENGTH);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
