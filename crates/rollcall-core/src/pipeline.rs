//! The identification entry point: image in, one predicted identity per face out.

use crate::config::PipelineConfig;
use crate::detector::{DetectorError, FaceDetector};
use crate::matcher::{MatchError, Matcher, VotingMatcher};
use crate::multipass::MultiPassDetector;
use crate::recognizer::{extract_embedding, FaceEmbedder, RecognizerError};
use crate::reference::ReferenceSet;
use crate::types::{BoundingBox, Embedding, IdentityId, ScoredBox};
use image::imageops;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedding failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("matching failed: {0}")]
    Match(#[from] MatchError),
}

/// One detected face that produced an embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifiedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub predicted: Option<IdentityId>,
    pub candidates: Vec<IdentityId>,
}

/// Result of [`Identifier::identify`].
///
/// `predicted_identities` and `candidates` run parallel to `faces`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Identification {
    pub faces: Vec<IdentifiedFace>,
    pub predicted_identities: Vec<Option<IdentityId>>,
    pub candidates: Vec<Vec<IdentityId>>,
    /// Detected faces dropped because no embedding could be taken from them.
    pub skipped_faces: usize,
}

/// Decode an encoded image (JPEG, PNG, ...) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PipelineError::InvalidImage(e.to_string()))
}

/// Copy the inclusive box region out of `image`, clipped to its bounds.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return None;
    }

    let x1 = bbox.x1.max(0);
    let y1 = bbox.y1.max(0);
    let x2 = bbox.x2.min(w as i32 - 1);
    let y2 = bbox.y2.min(h as i32 - 1);
    if x2 < x1 || y2 < y1 {
        return None;
    }

    let crop_w = (x2 - x1 + 1) as u32;
    let crop_h = (y2 - y1 + 1) as u32;
    Some(imageops::crop_imm(image, x1 as u32, y1 as u32, crop_w, crop_h).to_image())
}

/// Detector, embedder, and matcher wired into one pipeline.
pub struct Identifier<D, E> {
    detector: MultiPassDetector<D>,
    embedder: E,
    matcher: VotingMatcher,
}

impl<D: FaceDetector, E: FaceEmbedder> Identifier<D, E> {
    pub fn new(detector: MultiPassDetector<D>, embedder: E, matcher: VotingMatcher) -> Self {
        Self { detector, embedder, matcher }
    }

    pub fn from_config(detector: D, embedder: E, config: &PipelineConfig) -> Self {
        Self::new(
            MultiPassDetector::new(detector, config.detection.clone()),
            embedder,
            VotingMatcher::from_config(&config.matching),
        )
    }

    /// Detection stages only.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<ScoredBox>, PipelineError> {
        Ok(self.detector.detect(image)?)
    }

    /// Embedding of the most confident face, for enrolling a portrait.
    ///
    /// Returns `None` when no face is detected or the top face yields no
    /// usable embedding. Other faces in the image are ignored.
    pub fn embed_primary(&mut self, image: &RgbImage) -> Result<Option<Embedding>, PipelineError> {
        let faces = self.detector.detect(image)?;
        let Some(top) = faces.first() else {
            tracing::debug!("no face to enroll");
            return Ok(None);
        };

        let Some(crop) = crop_face(image, &top.bbox) else {
            tracing::warn!(bbox = ?top.bbox, "face box outside image");
            return Ok(None);
        };

        let embedding = extract_embedding(&mut self.embedder, &crop)?;
        tracing::debug!(
            bbox = ?top.bbox,
            confidence = top.confidence,
            faces = faces.len(),
            embedded = embedding.is_some(),
            "primary face embedded"
        );
        Ok(embedding)
    }

    /// Detect every face, embed each crop, and match against `references`.
    ///
    /// Faces the embedder cannot use are skipped and counted. An image with no
    /// faces, or a face that matches nobody, is a normal result.
    pub fn identify(&mut self, image: &RgbImage, references: &ReferenceSet) -> Result<Identification, PipelineError> {
        let faces = self.detector.detect(image)?;

        let mut kept: Vec<ScoredBox> = Vec::with_capacity(faces.len());
        let mut queries: Vec<Embedding> = Vec::with_capacity(faces.len());
        let mut skipped_faces = 0;

        for face in &faces {
            let Some(crop) = crop_face(image, &face.bbox) else {
                tracing::warn!(bbox = ?face.bbox, "face box outside image; skipping");
                skipped_faces += 1;
                continue;
            };

            match extract_embedding(&mut self.embedder, &crop)? {
                Some(embedding) => {
                    kept.push(*face);
                    queries.push(embedding);
                }
                None => {
                    tracing::warn!(bbox = ?face.bbox, confidence = face.confidence, "no usable face in crop; skipping");
                    skipped_faces += 1;
                }
            }
        }

        let batch = self.matcher.resolve_batch(&queries, references)?;

        let faces: Vec<IdentifiedFace> = kept
            .iter()
            .zip(batch.predicted_identities.iter().zip(&batch.candidates))
            .map(|(face, (predicted, candidates))| IdentifiedFace {
                bbox: face.bbox,
                confidence: face.confidence,
                predicted: predicted.clone(),
                candidates: candidates.clone(),
            })
            .collect();

        tracing::info!(
            faces = faces.len(),
            identified = batch.predicted_identities.iter().filter(|p| p.is_some()).count(),
            skipped = skipped_faces,
            references = references.identity_count(),
            "identification complete"
        );

        Ok(Identification {
            faces,
            predicted_identities: batch.predicted_identities,
            candidates: batch.candidates,
            skipped_faces,
        })
    }
}
