//! Rank fusion for hybrid search
//!
//! Combines keyword and semantic rankings with Reciprocal Rank Fusion:
//! score(d) = Σ 1/(k + rank(d)) across the result lists. RRF normalizes
//! across different scoring scales and rewards items appearing in several
//! lists; k (typically 60) dampens the effect of high ranks.

use std::collections::HashMap;

/// Conventional RRF dampening constant
pub const RRF_K: f32 = 60.0;

/// Fuse ranked result lists by key.
///
/// Each input list is ordered best-first; input scores are ignored in favor
/// of ranks. Output is sorted by fused score, descending.
pub fn reciprocal_rank_fusion(lists: &[&[(String, f32)]], k: f32) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for list in lists {
        for (rank, (key, _)) in list.iter().enumerate() {
            *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32 + 1.0);
        }
    }

    let mut results: Vec<(String, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(keys: &[&str]) -> Vec<(String, f32)> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| (k.to_string(), 1.0 - i as f32 * 0.1))
            .collect()
    }

    #[test]
    fn test_items_in_both_lists_rank_first() {
        let keyword = list(&["doc-1", "doc-2", "doc-3"]);
        let semantic = list(&["doc-2", "doc-1", "doc-4"]);

        let fused = reciprocal_rank_fusion(&[&keyword, &semantic], RRF_K);

        // doc-1 and doc-2 appear in both lists and must lead
        let top_two: Vec<&str> = fused.iter().take(2).map(|(k, _)| k.as_str()).collect();
        assert!(top_two.contains(&"doc-1"));
        assert!(top_two.contains(&"doc-2"));

        // Sorted descending
        for window in fused.windows(2) {
            assert!(window[0].1 >= window[1].1);
        }
    }

    #[test]
    fn test_single_list_preserves_order() {
        let only = list(&["a", "b", "c"]);
        let fused = reciprocal_rank_fusion(&[&only], RRF_K);
        let keys: Vec<&str> = fused.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_lists() {
        let empty: Vec<(String, f32)> = vec![];
        let other = list(&["x"]);
        let fused = reciprocal_rank_fusion(&[&empty, &other], RRF_K);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, "x");
    }
}
