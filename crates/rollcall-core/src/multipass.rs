//! Test-time augmentation around a single-pass [`FaceDetector`].
//!
//! Runs the detector once per (scale, flip) combination, maps every box back to
//! original-image pixels, then merges the pooled candidates with
//! [`weighted_cluster`] and [`select_faces`].

use crate::cluster::weighted_cluster;
use crate::config::DetectionConfig;
use crate::detector::{DetectorError, FaceDetector};
use crate::geometry::{max_side_factor, scaled_dims, PassTransform};
use crate::selector::select_faces;
use crate::types::ScoredBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;

pub struct MultiPassDetector<D> {
    detector: D,
    config: DetectionConfig,
}

impl<D: FaceDetector> MultiPassDetector<D> {
    pub fn new(detector: D, config: DetectionConfig) -> Self {
        Self { detector, config }
    }

    /// Accepted faces in original-image coordinates, most confident first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<ScoredBox>, DetectorError> {
        let pool = self.candidates(image)?;
        if pool.is_empty() {
            tracing::debug!("no face candidates in any pass");
            return Ok(Vec::new());
        }

        let merged = weighted_cluster(&pool, self.config.cluster_iou);
        let faces = select_faces(&merged, self.config.score_threshold, self.config.nms_iou);

        tracing::debug!(
            candidates = pool.len(),
            clusters = merged.len(),
            faces = faces.len(),
            "detection merged"
        );
        Ok(faces)
    }

    /// Pool raw boxes from every pass, remapped into original-image coordinates.
    ///
    /// A failing pass is skipped. Only when every pass fails is the last error
    /// returned; passes that simply find nothing yield an empty pool.
    pub fn candidates(&mut self, image: &RgbImage) -> Result<Vec<ScoredBox>, DetectorError> {
        let original = image.dimensions();
        if original.0 == 0 || original.1 == 0 {
            return Ok(Vec::new());
        }

        let working_image: Cow<'_, RgbImage> = match max_side_factor(original, self.config.max_side) {
            Some(factor) => {
                let (w, h) = scaled_dims(original, factor);
                tracing::debug!(
                    from = ?original,
                    to = ?(w, h),
                    max_side = self.config.max_side,
                    "downscaling input before detection"
                );
                Cow::Owned(imageops::resize(image, w, h, FilterType::Triangle))
            }
            None => Cow::Borrowed(image),
        };
        let working = working_image.dimensions();

        let flips: &[bool] = if self.config.flip { &[false, true] } else { &[false] };
        let total_passes = self.config.passes().len();
        let mut failed_passes = 0usize;
        let mut last_error = None;
        let mut pool = Vec::new();

        for &scale in &self.config.scales {
            let scaled: Cow<'_, RgbImage> = if scale == 1.0 {
                Cow::Borrowed(&*working_image)
            } else {
                let (w, h) = scaled_dims(working, scale as f64);
                Cow::Owned(imageops::resize(&*working_image, w, h, FilterType::Triangle))
            };
            let pass = scaled.dimensions();

            for &flipped in flips {
                let input: Cow<'_, RgbImage> = if flipped {
                    Cow::Owned(imageops::flip_horizontal(&*scaled))
                } else {
                    Cow::Borrowed(&*scaled)
                };

                let raw = match self.detector.detect(&input, self.config.detector_floor) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(scale, flipped, error = %e, "detection pass failed; skipping");
                        failed_passes += 1;
                        last_error = Some(e);
                        continue;
                    }
                };

                let transform = PassTransform { original, working, pass, flipped };
                let before = pool.len();
                pool.extend(raw.iter().filter_map(|d| {
                    transform
                        .to_original(d.x1, d.y1, d.x2, d.y2)
                        .map(|bbox| ScoredBox::new(bbox, d.confidence))
                }));

                tracing::debug!(
                    scale,
                    flipped,
                    raw = raw.len(),
                    kept = pool.len() - before,
                    "detection pass"
                );
            }
        }

        if failed_passes == total_passes {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::RawDetection;
    use crate::types::BoundingBox;
    use image::Rgb;

    const MARKER_COLUMNS: u32 = 8;

    /// An image whose left edge is red, so a fake detector can tell flipped input.
    fn marked_image(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, _| if x < MARKER_COLUMNS { Rgb([255, 0, 0]) } else { Rgb([0, 0, 0]) })
    }

    /// Reports faces at fixed normalized positions, mirrored when the input is flipped.
    struct NormalizedFaces {
        faces: Vec<([f32; 4], f32)>,
        calls: Vec<((u32, u32), bool)>,
        fail_flipped: bool,
    }

    impl NormalizedFaces {
        fn new(faces: Vec<([f32; 4], f32)>) -> Self {
            Self { faces, calls: Vec::new(), fail_flipped: false }
        }
    }

    impl FaceDetector for NormalizedFaces {
        fn detect(&mut self, image: &RgbImage, floor: f32) -> Result<Vec<RawDetection>, DetectorError> {
            let (w, h) = image.dimensions();
            let flipped = image.get_pixel(0, 0).0[0] < image.get_pixel(w - 1, 0).0[0];
            self.calls.push(((w, h), flipped));
            if flipped && self.fail_flipped {
                return Err(DetectorError::InferenceFailed("flip pass".into()));
            }

            let (wf, hf) = (w as f32, h as f32);
            Ok(self
                .faces
                .iter()
                .filter(|(_, c)| *c >= floor)
                .map(|([x1, y1, x2, y2], c)| {
                    let (x1, x2) = if flipped { (wf - x2 * wf, wf - x1 * wf) } else { (x1 * wf, x2 * wf) };
                    RawDetection { x1, y1: y1 * hf, x2, y2: y2 * hf, confidence: *c }
                })
                .collect())
        }
    }

    fn close(a: &BoundingBox, b: &BoundingBox, tol: i32) -> bool {
        (a.x1 - b.x1).abs() <= tol
            && (a.y1 - b.y1).abs() <= tol
            && (a.x2 - b.x2).abs() <= tol
            && (a.y2 - b.y2).abs() <= tol
    }

    #[test]
    fn test_every_pass_maps_back_to_original() {
        let detector = NormalizedFaces::new(vec![([0.25, 0.2, 0.5, 0.8], 0.9)]);
        let mut mp = MultiPassDetector::new(detector, DetectionConfig::default());
        let image = marked_image(200, 100);

        let pool = mp.candidates(&image).unwrap();
        assert_eq!(pool.len(), 6);
        let expected = BoundingBox::new(50, 20, 100, 80);
        for c in &pool {
            assert!(close(&c.bbox, &expected, 1), "{:?} vs {expected:?}", c.bbox);
        }

        let calls = &mp.detector.calls;
        assert_eq!(calls.len(), 6);
        assert_eq!(calls[0], ((200, 100), false));
        assert_eq!(calls[1], ((200, 100), true));
        assert_eq!(calls[2], ((300, 150), false));
        assert_eq!(calls[5], ((400, 200), true));
    }

    #[test]
    fn test_oversized_input_downscaled_first() {
        let detector = NormalizedFaces::new(vec![([0.25, 0.2, 0.5, 0.8], 0.9)]);
        let config = DetectionConfig { max_side: 200, flip: false, ..DetectionConfig::default() };
        let mut mp = MultiPassDetector::new(detector, config);
        let image = marked_image(400, 200);

        let pool = mp.candidates(&image).unwrap();
        assert_eq!(mp.detector.calls[0].0, (200, 100));
        assert_eq!(mp.detector.calls[1].0, (300, 150));
        let expected = BoundingBox::new(100, 40, 200, 160);
        for c in &pool {
            assert!(close(&c.bbox, &expected, 2), "{:?} vs {expected:?}", c.bbox);
        }
    }

    #[test]
    fn test_detect_merges_passes_into_one_face_per_person() {
        let detector = NormalizedFaces::new(vec![
            ([0.1, 0.1, 0.3, 0.5], 0.9),
            ([0.6, 0.2, 0.8, 0.6], 0.6),
            ([0.4, 0.7, 0.45, 0.75], 0.1),
        ]);
        let mut mp = MultiPassDetector::new(detector, DetectionConfig::default());
        let faces = mp.detect(&marked_image(200, 100)).unwrap();

        assert_eq!(faces.len(), 2);
        assert!((faces[0].confidence - 0.9).abs() < 1e-6);
        assert!(close(&faces[0].bbox, &BoundingBox::new(20, 10, 60, 50), 1));
        assert!(close(&faces[1].bbox, &BoundingBox::new(120, 20, 160, 60), 1));
    }

    #[test]
    fn test_failed_pass_is_skipped() {
        let mut detector = NormalizedFaces::new(vec![([0.25, 0.2, 0.5, 0.8], 0.9)]);
        detector.fail_flipped = true;
        let mut mp = MultiPassDetector::new(detector, DetectionConfig::default());

        let pool = mp.candidates(&marked_image(200, 100)).unwrap();
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_all_passes_failing_is_an_error() {
        let mut detector = NormalizedFaces::new(vec![([0.25, 0.2, 0.5, 0.8], 0.9)]);
        detector.fail_flipped = true;
        // A right-edge marker makes every unflipped pass look flipped to the fake.
        let image = RgbImage::from_fn(64, 64, |x, _| if x == 63 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 0]) });
        let mut mp = MultiPassDetector::new(detector, DetectionConfig { flip: false, ..DetectionConfig::default() });

        assert!(matches!(mp.candidates(&image), Err(DetectorError::InferenceFailed(_))));
    }

    #[test]
    fn test_no_detections_is_empty_not_error() {
        let detector = NormalizedFaces::new(Vec::new());
        let mut mp = MultiPassDetector::new(detector, DetectionConfig::default());
        let image = marked_image(120, 80);

        assert!(mp.candidates(&image).unwrap().is_empty());
        assert!(mp.detect(&image).unwrap().is_empty());
    }

    #[test]
    fn test_empty_image() {
        let detector = NormalizedFaces::new(vec![([0.25, 0.2, 0.5, 0.8], 0.9)]);
        let mut mp = MultiPassDetector::new(detector, DetectionConfig::default());
        assert!(mp.detect(&RgbImage::new(0, 0)).unwrap().is_empty());
        assert!(mp.detector.calls.is_empty());
    }
}
