//! Final face selection: greedy NMS over merged clusters, then a confidence floor.

use crate::geometry::iou;
use crate::types::ScoredBox;

/// Non-Maximum Suppression: keep the most confident box, drop everything that
/// overlaps it by more than `iou_threshold`, repeat.
pub fn non_max_suppression(boxes: &[ScoredBox], iou_threshold: f32) -> Vec<ScoredBox> {
    let mut sorted = boxes.to_vec();
    sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&sorted[i].bbox, &sorted[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Run NMS, then discard survivors below `score_threshold`.
pub fn select_faces(merged: &[ScoredBox], score_threshold: f32, nms_iou: f32) -> Vec<ScoredBox> {
    let mut accepted = non_max_suppression(merged, nms_iou);
    accepted.retain(|b| b.confidence >= score_threshold);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn sb(x1: i32, y1: i32, x2: i32, y2: i32, conf: f32) -> ScoredBox {
        ScoredBox::new(BoundingBox::new(x1, y1, x2, y2), conf)
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let boxes = vec![
            sb(5, 5, 104, 104, 0.8),
            sb(0, 0, 99, 99, 0.9),
            sb(200, 200, 249, 249, 0.7),
        ];
        let result = non_max_suppression(&boxes, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_threshold_is_strict() {
        // Identical boxes have IoU exactly 1.0, which does not exceed a 1.0 threshold.
        let a = sb(0, 0, 99, 99, 0.9);
        let b = sb(0, 0, 99, 99, 0.8);
        assert_eq!(non_max_suppression(&[a, b], 1.0).len(), 2);
        assert_eq!(non_max_suppression(&[a, b], 0.99).len(), 1);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(&[], 0.45).is_empty());
        assert!(select_faces(&[], 0.25, 0.45).is_empty());
    }

    #[test]
    fn test_output_is_subset_of_input() {
        let boxes: Vec<ScoredBox> = (0..12)
            .map(|i| sb(i * 7, i * 3, i * 7 + 40, i * 3 + 40, 0.2 + 0.05 * i as f32))
            .collect();
        for out in [non_max_suppression(&boxes, 0.45), select_faces(&boxes, 0.25, 0.45)] {
            assert!(out.iter().all(|o| boxes.contains(o)));
        }
    }

    #[test]
    fn test_floor_applied_after_nms() {
        // The low box would have suppressed nothing anyway; it is removed by the floor.
        let boxes = vec![sb(0, 0, 10, 10, 0.9), sb(50, 50, 60, 60, 0.2)];
        let out = select_faces(&boxes, 0.25, 0.45);
        assert_eq!(out, vec![sb(0, 0, 10, 10, 0.9)]);

        // Floor is inclusive.
        let out = select_faces(&[sb(0, 0, 10, 10, 0.25)], 0.25, 0.45);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_cluster_then_select_two_faces() {
        let pool = vec![
            sb(0, 0, 10, 10, 0.9),
            sb(1, 1, 11, 11, 0.8),
            sb(50, 50, 60, 60, 0.7),
        ];
        let merged = crate::cluster::weighted_cluster(&pool, 0.3);
        let faces = select_faces(&merged, 0.25, 0.45);

        assert_eq!(faces.len(), 2);
        let mut confidences: Vec<f32> = faces.iter().map(|f| f.confidence).collect();
        confidences.sort_by(|a, b| b.total_cmp(a));
        assert!((confidences[0] - 0.9).abs() < 1e-6);
        assert!((confidences[1] - 0.7).abs() < 1e-6);
        assert!(faces.iter().any(|f| f.bbox == BoundingBox::new(50, 50, 60, 60)));
    }

    #[test]
    fn test_suppressor_below_floor_still_suppresses() {
        let boxes = vec![sb(0, 0, 10, 10, 0.2), sb(0, 0, 10, 10, 0.1)];
        assert!(select_faces(&boxes, 0.25, 0.45).is_empty());
    }
}
