//! Identity matching: top-k nearest references, threshold, majority vote.

use crate::config::MatchConfig;
use crate::reference::ReferenceSet;
use crate::types::{Embedding, IdentityId};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("query embedding has {actual} dimensions, reference set has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Cosine similarity in [-1, 1]. Returns 0.0 if either vector has zero norm.
///
/// Always processes every component; vectors of unequal length are compared
/// over their common prefix.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { (dot / denom).clamp(-1.0, 1.0) } else { 0.0 }
}

/// One reference embedding close to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub identity: IdentityId,
    pub similarity: f32,
}

/// The `k` most similar reference embeddings, most similar first.
///
/// Equal similarities keep reference-set order: identity key ascending, then
/// enrollment order.
pub fn top_k_matches(query: &Embedding, references: &ReferenceSet, k: usize) -> Vec<Neighbor> {
    let mut neighbors: Vec<Neighbor> = references
        .iter()
        .flat_map(|(identity, embeddings)| {
            embeddings.iter().map(move |e| Neighbor {
                identity: identity.clone(),
                similarity: query.similarity(e),
            })
        })
        .collect();

    // Stable sort preserves reference order among ties.
    neighbors.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    neighbors.truncate(k);
    neighbors
}

/// Outcome of matching one query embedding.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MatchResult {
    /// Majority identity among qualifying neighbors, `None` if nobody qualified.
    pub predicted: Option<IdentityId>,
    /// Identity of every qualifying neighbor in similarity order, repeats kept.
    pub candidates: Vec<IdentityId>,
    pub distinct_candidates: usize,
}

/// Per-query results for a batch, in query order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BatchMatch {
    pub predicted_identities: Vec<Option<IdentityId>>,
    pub candidates: Vec<Vec<IdentityId>>,
}

/// Strategy for resolving a query embedding to an enrolled identity.
pub trait Matcher {
    fn resolve(&self, query: &Embedding, references: &ReferenceSet) -> Result<MatchResult, MatchError>;

    /// Resolve every query against the same reference set.
    fn resolve_batch(&self, queries: &[Embedding], references: &ReferenceSet) -> Result<BatchMatch, MatchError> {
        let mut batch = BatchMatch {
            predicted_identities: Vec::with_capacity(queries.len()),
            candidates: Vec::with_capacity(queries.len()),
        };
        for query in queries {
            let result = self.resolve(query, references)?;
            batch.predicted_identities.push(result.predicted);
            batch.candidates.push(result.candidates);
        }
        Ok(batch)
    }
}

/// k-nearest-neighbor vote over references at or above a similarity threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VotingMatcher {
    pub top_k: usize,
    pub threshold: f32,
}

impl Default for VotingMatcher {
    fn default() -> Self {
        Self::from_config(&MatchConfig::default())
    }
}

impl VotingMatcher {
    pub fn new(top_k: usize, threshold: f32) -> Self {
        Self { top_k, threshold }
    }

    pub fn from_config(config: &MatchConfig) -> Self {
        Self::new(config.top_k, config.similarity_threshold)
    }
}

impl Matcher for VotingMatcher {
    fn resolve(&self, query: &Embedding, references: &ReferenceSet) -> Result<MatchResult, MatchError> {
        if let Some(expected) = references.dimension() {
            if query.dim() != expected {
                return Err(MatchError::DimensionMismatch { expected, actual: query.dim() });
            }
        }

        let candidates: Vec<IdentityId> = top_k_matches(query, references, self.top_k)
            .into_iter()
            .filter(|n| n.similarity >= self.threshold)
            .map(|n| n.identity)
            .collect();

        Ok(MatchResult {
            predicted: majority_vote(&candidates),
            distinct_candidates: count_distinct(&candidates),
            candidates,
        })
    }
}

/// Most frequent identity; on a tie, the one that appears first.
fn majority_vote(candidates: &[IdentityId]) -> Option<IdentityId> {
    let mut tally: HashMap<&IdentityId, (usize, usize)> = HashMap::new();
    for (position, identity) in candidates.iter().enumerate() {
        tally.entry(identity).or_insert((0, position)).0 += 1;
    }

    tally
        .into_iter()
        .max_by(|(_, (votes_a, first_a)), (_, (votes_b, first_b))| {
            votes_a.cmp(votes_b).then(first_b.cmp(first_a))
        })
        .map(|(identity, _)| identity.clone())
}

fn count_distinct(candidates: &[IdentityId]) -> usize {
    let mut seen: Vec<&IdentityId> = candidates.iter().collect();
    seen.sort();
    seen.dedup();
    seen.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn id(s: &str) -> IdentityId {
        IdentityId::from(s)
    }

    fn reference_set(entries: &[(&str, &[f32])]) -> ReferenceSet {
        let mut set = ReferenceSet::new();
        for (identity, values) in entries {
            set.insert(id(identity), emb(values)).unwrap();
        }
        set
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let v = [0.3f32, -1.2, 4.0, 0.05];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let v = [0.3f32, -1.2, 4.0, 0.05];
        let neg: Vec<f32> = v.iter().map(|x| -x).collect();
        assert!((cosine_similarity(&v, &neg) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_top_k_bounded_and_sorted() {
        let set = reference_set(&[
            ("a", &[1.0, 0.0]),
            ("a", &[0.9, 0.1]),
            ("b", &[0.0, 1.0]),
            ("c", &[0.7, 0.7]),
            ("d", &[-1.0, 0.0]),
            ("e", &[0.5, -0.5]),
            ("f", &[0.2, 0.9]),
        ]);
        let query = emb(&[1.0, 0.2]);

        for k in [0, 1, 3, 5, 7, 20] {
            let top = top_k_matches(&query, &set, k);
            assert_eq!(top.len(), k.min(7));
            assert!(top.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        }
    }

    #[test]
    fn test_top_k_ties_follow_reference_order() {
        let set = reference_set(&[("zed", &[1.0, 0.0]), ("amy", &[2.0, 0.0]), ("bob", &[3.0, 0.0])]);
        let top = top_k_matches(&emb(&[1.0, 0.0]), &set, 3);
        let order: Vec<&str> = top.iter().map(|n| n.identity.as_str()).collect();
        assert_eq!(order, vec!["amy", "bob", "zed"]);
    }

    #[test]
    fn test_empty_reference_set() {
        let matcher = VotingMatcher::default();
        let set = ReferenceSet::new();
        for query in [emb(&[1.0, 0.0]), emb(&[0.0; 512])] {
            let result = matcher.resolve(&query, &set).unwrap();
            assert_eq!(result.predicted, None);
            assert!(result.candidates.is_empty());
            assert_eq!(result.distinct_candidates, 0);
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // Threshold set to the computed similarity itself.
        let set = reference_set(&[("a", &[1.0, 0.0])]);
        let query = emb(&[0.6, 0.8]);
        let sim = top_k_matches(&query, &set, 1)[0].similarity;

        let at = VotingMatcher::new(5, sim).resolve(&query, &set).unwrap();
        assert_eq!(at.predicted, Some(id("a")));

        let above = VotingMatcher::new(5, sim + 1e-4).resolve(&query, &set).unwrap();
        assert_eq!(above.predicted, None);
    }

    #[test]
    fn test_threshold_excludes_weak_identity() {
        let v1 = [1.0f32, 0.0, 0.0];
        let v2 = [0.0f32, 0.0, 1.0];
        let v3 = [0.0f32, 1.0, 0.0];
        let set = reference_set(&[("A", &v1), ("A", &v2), ("B", &v3)]);
        let query = emb(&[0.9, 0.3, 0.1f32.sqrt()]);

        let result = VotingMatcher::new(5, 0.55).resolve(&query, &set).unwrap();
        assert_eq!(result.predicted, Some(id("A")));
        assert_eq!(result.candidates, vec![id("A")]);
        assert_eq!(result.distinct_candidates, 1);
    }

    #[test]
    fn test_majority_beats_single_best() {
        let set = reference_set(&[
            ("best", &[1.0, 0.0]),
            ("crowd", &[0.95, 0.3]),
            ("crowd", &[0.9, 0.4]),
        ]);
        let result = VotingMatcher::new(5, 0.5).resolve(&emb(&[1.0, 0.0]), &set).unwrap();
        assert_eq!(result.predicted, Some(id("crowd")));
        assert_eq!(result.candidates, vec![id("best"), id("crowd"), id("crowd")]);
        assert_eq!(result.distinct_candidates, 2);
    }

    #[test]
    fn test_vote_tie_goes_to_earliest_first_vote() {
        let set = reference_set(&[
            ("x", &[1.0, 0.0]),
            ("x", &[0.6, 0.8]),
            ("y", &[0.9, 0.43]),
            ("y", &[0.8, 0.6]),
        ]);
        let result = VotingMatcher::new(5, 0.5).resolve(&emb(&[1.0, 0.0]), &set).unwrap();
        assert_eq!(result.candidates, vec![id("x"), id("y"), id("y"), id("x")]);
        assert_eq!(result.predicted, Some(id("x")));
    }

    #[test]
    fn test_dimension_mismatch() {
        let set = reference_set(&[("a", &[1.0, 0.0, 0.0])]);
        assert_eq!(
            VotingMatcher::default().resolve(&emb(&[1.0, 0.0]), &set),
            Err(MatchError::DimensionMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_batch_preserves_query_order() {
        let set = reference_set(&[("a", &[1.0, 0.0]), ("b", &[0.0, 1.0])]);
        let queries = vec![emb(&[0.0, 1.0]), emb(&[-1.0, -1.0]), emb(&[1.0, 0.1])];

        let batch = VotingMatcher::default().resolve_batch(&queries, &set).unwrap();
        assert_eq!(batch.predicted_identities, vec![Some(id("b")), None, Some(id("a"))]);
        assert_eq!(batch.candidates, vec![vec![id("b")], vec![], vec![id("a")]]);
    }

    #[test]
    fn test_batch_empty() {
        let batch = VotingMatcher::default().resolve_batch(&[], &ReferenceSet::new()).unwrap();
        assert!(batch.predicted_identities.is_empty());
        assert!(batch.candidates.is_empty());
    }
}
