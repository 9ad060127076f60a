//! Confidence-weighted box clustering.
//!
//! Merges the pooled candidates from every detection pass into one box per
//! physical face. Membership is decided against the cluster seed only: two
//! members may each overlap the seed without overlapping each other. The final
//! NMS threshold is tuned against this behavior, so it must stay single-hop.

use crate::geometry::iou;
use crate::types::{BoundingBox, ScoredBox};

/// Greedily cluster `candidates` around the most confident remaining box.
///
/// Each cluster becomes one box whose corners are the confidence-weighted mean
/// of its members, rounded to pixels, carrying the highest member confidence.
pub fn weighted_cluster(candidates: &[ScoredBox], iou_threshold: f32) -> Vec<ScoredBox> {
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    let mut merged = Vec::new();

    while !remaining.is_empty() {
        let seed = most_confident(candidates, &remaining);
        let seed_box = candidates[seed].bbox;

        let (members, rest): (Vec<usize>, Vec<usize>) = remaining
            .iter()
            .partition(|&&i| i == seed || iou(&seed_box, &candidates[i].bbox) >= iou_threshold);

        merged.push(merge(candidates, &members));
        remaining = rest;
    }

    merged
}

/// Index of the highest confidence among `indices`; the earliest wins ties.
fn most_confident(candidates: &[ScoredBox], indices: &[usize]) -> usize {
    let mut best = indices[0];
    for &i in &indices[1..] {
        if candidates[i].confidence > candidates[best].confidence {
            best = i;
        }
    }
    best
}

fn merge(candidates: &[ScoredBox], members: &[usize]) -> ScoredBox {
    let weight_sum: f64 = members.iter().map(|&i| candidates[i].confidence as f64).sum();
    // Zero total weight degrades to a plain mean.
    let weight = |i: usize| -> f64 {
        if weight_sum > 0.0 {
            candidates[i].confidence as f64
        } else {
            1.0
        }
    };
    let total = if weight_sum > 0.0 { weight_sum } else { members.len() as f64 };

    let mut acc = [0.0f64; 4];
    let mut confidence = f32::NEG_INFINITY;
    for &i in members {
        let c = &candidates[i];
        let w = weight(i);
        acc[0] += c.bbox.x1 as f64 * w;
        acc[1] += c.bbox.y1 as f64 * w;
        acc[2] += c.bbox.x2 as f64 * w;
        acc[3] += c.bbox.y2 as f64 * w;
        confidence = confidence.max(c.confidence);
    }

    let corner = |v: f64| (v / total).round() as i32;
    ScoredBox::new(
        BoundingBox::new(corner(acc[0]), corner(acc[1]), corner(acc[2]), corner(acc[3])),
        confidence,
    )
}
