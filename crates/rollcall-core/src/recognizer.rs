//! ArcFace face embedder via ONNX Runtime.
//!
//! Turns a face crop into a 512-dimensional L2-normalized embedding, or reports
//! that the crop holds no usable face so the caller can skip it.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization into [-1, 1]
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
/// Crops smaller than this on either side carry too little detail to embed.
const MIN_FACE_SIDE: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// External embedding model boundary: face crop in, fixed-length vector or nothing out.
pub trait FaceEmbedder: Send {
    /// Dimensionality of every embedding this model produces.
    fn dimension(&self) -> usize;

    /// Embed one crop; `Ok(None)` when the crop has no usable face.
    fn embed(&mut self, crop: &RgbImage) -> Result<Option<Embedding>, RecognizerError>;
}

/// Embed a crop through `embedder`, enforcing its declared dimensionality.
pub fn extract_embedding<E: FaceEmbedder + ?Sized>(
    embedder: &mut E,
    crop: &RgbImage,
) -> Result<Option<Embedding>, RecognizerError> {
    match embedder.embed(crop)? {
        Some(embedding) if embedding.dim() != embedder.dimension() => Err(RecognizerError::DimensionMismatch {
            expected: embedder.dimension(),
            actual: embedding.dim(),
        }),
        other => Ok(other),
    }
}

/// ArcFace-based face embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Resize an RGB crop to 112x112 and normalize it into a NCHW float tensor.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let resized = imageops::resize(crop, size as u32, size as u32, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn embed(&mut self, crop: &RgbImage) -> Result<Option<Embedding>, RecognizerError> {
        if crop.width() < MIN_FACE_SIDE || crop.height() < MIN_FACE_SIDE {
            tracing::debug!(width = crop.width(), height = crop.height(), "crop too small to embed");
            return Ok(None);
        }

        let input = Self::preprocess(crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(normalize_output(raw_data.to_vec())?.map(|values| Embedding {
            values,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }))
    }
}

/// Check length and L2-normalize raw model output; `None` for a degenerate vector.
fn normalize_output(raw: Vec<f32>) -> Result<Option<Vec<f32>>, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::DimensionMismatch {
            expected: ARCFACE_EMBEDDING_DIM,
            actual: raw.len(),
        });
    }

    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        tracing::debug!(norm, "degenerate embedding; treating crop as faceless");
        return Ok(None);
    }

    Ok(Some(raw.iter().map(|x| x / norm).collect()))
}
