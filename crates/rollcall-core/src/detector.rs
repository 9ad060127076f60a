//! YOLOv8-face detector via ONNX Runtime.
//!
//! One call runs one forward pass over one (already augmented) image. Test-time
//! augmentation and cluster merging live in [`crate::multipass`].

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const YOLO_PAD_VALUE: f32 = 114.0;
const YOLO_PIXEL_SCALE: f32 = 255.0;
/// Per-pass duplicate removal, matching the upstream predictor's default.
const YOLO_NMS_THRESHOLD: f32 = 0.7;
/// cx, cy, w, h, conf
const YOLO_BOX_CHANNELS: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download a YOLOv8-face ONNX export and place it in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One raw detector box in the coordinate space of the image it was run on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

/// External face detector boundary: image in, boxes with confidences out.
pub trait FaceDetector: Send {
    /// Detect faces, returning boxes with confidence at or above `confidence_floor`.
    fn detect(&mut self, image: &RgbImage, confidence_floor: f32) -> Result<Vec<RawDetection>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// YOLOv8-face detector backed by an ONNX session.
pub struct YoloFaceDetector {
    session: Session,
    input_size: u32,
}

impl YoloFaceDetector {
    /// Load the YOLOv8-face ONNX model; `input_size` is the square inference resolution.
    pub fn load(model_path: &str, input_size: u32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            input_size,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded YOLOv8-face model"
        );

        Ok(Self { session, input_size })
    }

    /// Letterbox an RGB image into a normalized NCHW tensor.
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let size = self.input_size;
        let (width, height) = image.dimensions();

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let side = size as usize;
        let mut tensor = Array4::<f32>::from_elem((1, 3, side, side), YOLO_PAD_VALUE / YOLO_PIXEL_SCALE);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel.0[c] as f32 / YOLO_PIXEL_SCALE;
            }
        }

        let letterbox = LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        };
        (tensor, letterbox)
    }
}

impl FaceDetector for YoloFaceDetector {
    fn detect(&mut self, image: &RgbImage, confidence_floor: f32) -> Result<Vec<RawDetection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output tensor: {e}")))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        let detections = decode_output(data, &dims, &letterbox, confidence_floor)?;
        Ok(suppress_overlaps(detections, YOLO_NMS_THRESHOLD))
    }
}

/// Decode a `[1, C, N]` (or transposed `[1, N, C]`) YOLO output into boxes.
fn decode_output(
    data: &[f32],
    dims: &[usize],
    letterbox: &LetterboxInfo,
    floor: f32,
) -> Result<Vec<RawDetection>, DetectorError> {
    if dims.len() != 3 {
        return Err(DetectorError::InferenceFailed(format!(
            "expected a rank-3 output tensor, got shape {dims:?}"
        )));
    }

    // Anchor count always exceeds the per-anchor channel count.
    let (channels, anchors, channel_major) = if dims[1] <= dims[2] {
        (dims[1], dims[2], true)
    } else {
        (dims[2], dims[1], false)
    };

    if channels < YOLO_BOX_CHANNELS || data.len() < channels * anchors {
        return Err(DetectorError::InferenceFailed(format!(
            "output shape {dims:?} does not carry box+confidence rows ({} values)",
            data.len()
        )));
    }

    let at = |c: usize, a: usize| -> f32 {
        if channel_major {
            data[c * anchors + a]
        } else {
            data[a * channels + c]
        }
    };

    let mut detections = Vec::new();
    for a in 0..anchors {
        let confidence = at(4, a);
        if !(confidence >= floor) {
            continue;
        }

        let (cx, cy, w, h) = (at(0, a), at(1, a), at(2, a), at(3, a));
        let unbox = |v: f32, pad: f32| (v - pad) / letterbox.scale;

        detections.push(RawDetection {
            x1: unbox(cx - w / 2.0, letterbox.pad_x),
            y1: unbox(cy - h / 2.0, letterbox.pad_y),
            x2: unbox(cx + w / 2.0, letterbox.pad_x),
            y2: unbox(cy + h / 2.0, letterbox.pad_y),
            confidence,
        });
    }

    Ok(detections)
}

/// Per-pass NMS over continuous coordinates.
fn suppress_overlaps(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && raw_iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

fn raw_iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
