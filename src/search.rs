//! Hybrid scoring: keyword normalization and fused ranking.
//!
//! Pure functions shared by every [`CandidateStore`](crate::store::CandidateStore)
//! backend so that SQLite and in-memory stores rank identically.
//!
//! ```text
//! text_score   = min-max normalized keyword score (higher = better)
//! vector_score = cosine similarity = 1 - distance
//! fused        = w * vector_score + (1 - w) * text_score
//! ```
//!
//! Ties are broken by chunk id ascending so ordering is deterministic.

use std::cmp::Ordering;

use crate::models::RetrievalCandidate;

/// A hybrid candidate with its raw keyword score (higher = better, zero
/// when no query term matched).
#[derive(Debug, Clone)]
pub struct KeywordMatch {
    pub candidate: RetrievalCandidate,
    pub raw_score: f64,
}

/// Min-max normalize scores to [0, 1]. All-equal input maps to 1.0.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }

    let s_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    raw.iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

pub fn fused_score(vector_weight: f64, vector_score: f64, text_score: f64) -> f64 {
    vector_weight * vector_score + (1.0 - vector_weight) * text_score
}

/// Rank candidates by fused score and keep the top `limit`.
pub fn rank_hybrid(
    matches: Vec<KeywordMatch>,
    vector_weight: f64,
    limit: usize,
) -> Vec<RetrievalCandidate> {
    let raw: Vec<f64> = matches.iter().map(|m| m.raw_score).collect();
    let text_scores = normalize_scores(&raw);

    let mut scored: Vec<(f64, RetrievalCandidate)> = matches
        .into_iter()
        .zip(text_scores)
        .map(|(m, text)| {
            let vector = 1.0 - m.candidate.distance;
            (fused_score(vector_weight, vector, text), m.candidate)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.id.cmp(&b.1.id))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(_, c)| c).collect()
}

/// Order by distance ascending (id ascending on ties) and keep `limit`.
pub fn rank_by_distance(mut candidates: Vec<RetrievalCandidate>, limit: usize) -> Vec<RetrievalCandidate> {
    candidates.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    candidates.truncate(limit);
    candidates
}

/// Lowercased alphanumeric query terms, deduplicated in order.
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// FTS5 MATCH expression OR-ing quoted terms, or `None` if no terms.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let terms = keyword_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: i64, distance: f64) -> RetrievalCandidate {
        RetrievalCandidate {
            id,
            content: String::new(),
            source_file: "f".to_string(),
            distance,
            rerank_score: None,
        }
    }

    fn kw(id: i64, distance: f64, raw: f64) -> KeywordMatch {
        KeywordMatch {
            candidate: cand(id, distance),
            raw_score: raw,
        }
    }

    fn ids(c: &[RetrievalCandidate]) -> Vec<i64> {
        c.iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize_scores(&[10.0, 5.0, 0.0]);
        assert!((result[0] - 1.0).abs() < 1e-9);
        assert!((result[1] - 0.5).abs() < 1e-9);
        assert!((result[2] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        for s in normalize_scores(&[3.0, 3.0]) {
            assert!((s - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scores_always_in_unit() {
        for s in normalize_scores(&[-5.0, 100.0, 42.0]) {
            assert!((0.0..=1.0).contains(&s), "Score out of range: {}", s);
        }
    }

    #[test]
    fn test_weight_one_equals_vector_ordering() {
        let matches = vec![kw(1, 0.6, 10.0), kw(2, 0.1, 1.0), kw(3, 0.3, 5.0)];
        let hybrid = rank_hybrid(matches.clone(), 1.0, 10);
        let vector = rank_by_distance(matches.into_iter().map(|m| m.candidate).collect(), 10);
        assert_eq!(ids(&hybrid), ids(&vector));
        assert_eq!(ids(&hybrid), vec![2, 3, 1]);
    }

    #[test]
    fn test_unmatched_candidate_ranks_by_vector_alone() {
        // id 2 has no keyword hit but is the nearest vector
        let matches = vec![kw(1, 1.0, 4.0), kw(2, 0.0, 0.0), kw(3, 0.5, 2.0)];
        assert_eq!(ids(&rank_hybrid(matches.clone(), 1.0, 10)), vec![2, 3, 1]);
        assert_eq!(ids(&rank_hybrid(matches, 0.0, 10)), vec![1, 3, 2]);
    }

    #[test]
    fn test_weight_zero_equals_keyword_ordering() {
        let matches = vec![kw(1, 0.6, 10.0), kw(2, 0.1, 1.0), kw(3, 0.3, 5.0)];
        let hybrid = rank_hybrid(matches, 0.0, 10);
        assert_eq!(ids(&hybrid), vec![1, 3, 2]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let matches = vec![kw(9, 0.2, 1.0), kw(4, 0.2, 1.0)];
        assert_eq!(ids(&rank_hybrid(matches, 0.5, 10)), vec![4, 9]);
    }

    #[test]
    fn test_limit_applied() {
        let matches = vec![kw(1, 0.1, 1.0), kw(2, 0.2, 1.0), kw(3, 0.3, 1.0)];
        assert_eq!(rank_hybrid(matches, 0.7, 2).len(), 2);
    }

    #[test]
    fn test_keyword_terms_sanitized() {
        assert_eq!(
            keyword_terms("What is \"X\"? x AND y*"),
            vec!["what", "is", "x", "and", "y"]
        );
    }

    #[test]
    fn test_fts_expression() {
        assert_eq!(fts_match_expression("a b").unwrap(), "\"a\" OR \"b\"");
        assert!(fts_match_expression("?!").is_none());
    }
}
