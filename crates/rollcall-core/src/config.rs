//! Tunables for the detection and matching stages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
    #[error("failed to parse pipeline config: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub matching: MatchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Test-time scale factors; must include 1.0.
    #[serde(default = "default_scales")]
    pub scales: Vec<f32>,

    /// Also run every scale on a horizontally flipped copy.
    #[serde(default = "default_flip")]
    pub flip: bool,

    /// Longer image side is downscaled to this before any pass.
    #[serde(default = "default_max_side")]
    pub max_side: u32,

    /// Square detector input resolution.
    #[serde(default = "default_inference_size")]
    pub inference_size: u32,

    /// Confidence floor handed to the detector on every pass. Kept low for recall.
    #[serde(default = "default_detector_floor")]
    pub detector_floor: f32,

    /// IoU at or above which a candidate joins the seed's cluster.
    #[serde(default = "default_cluster_iou")]
    pub cluster_iou: f32,

    /// IoU above which the final NMS suppresses a merged box.
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,

    /// Minimum confidence of an accepted face.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

fn default_scales() -> Vec<f32> {
    vec![1.0, 1.5, 2.0]
}

fn default_flip() -> bool {
    true
}

fn default_max_side() -> u32 {
    1600
}

fn default_inference_size() -> u32 {
    1280
}

fn default_detector_floor() -> f32 {
    0.25
}

fn default_cluster_iou() -> f32 {
    0.30
}

fn default_nms_iou() -> f32 {
    0.45
}

fn default_score_threshold() -> f32 {
    0.25
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scales: default_scales(),
            flip: default_flip(),
            max_side: default_max_side(),
            inference_size: default_inference_size(),
            detector_floor: default_detector_floor(),
            cluster_iou: default_cluster_iou(),
            nms_iou: default_nms_iou(),
            score_threshold: default_score_threshold(),
        }
    }
}

impl DetectionConfig {
    /// Every (scale, flipped) combination, flip varying fastest.
    pub fn passes(&self) -> Vec<(f32, bool)> {
        let flips: &[bool] = if self.flip { &[false, true] } else { &[false] };
        self.scales
            .iter()
            .flat_map(|&s| flips.iter().map(move |&f| (s, f)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Neighbors considered per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Cosine similarity a neighbor needs to vote (inclusive).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

fn default_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f32 {
    0.55
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Largest test-time upscale; each pass allocates an image this many times the working size.
pub const MAX_SCALE: f32 = 4.0;

impl PipelineConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(src).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detection;
        if d.scales.is_empty() {
            return Err(ConfigError::Invalid("detection.scales is empty".into()));
        }
        if let Some(bad) = d.scales.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(ConfigError::Invalid(format!("detection.scales has non-positive scale {bad}")));
        }
        if let Some(big) = d.scales.iter().find(|s| **s > MAX_SCALE) {
            return Err(ConfigError::Invalid(format!(
                "detection.scales has scale {big} above the {MAX_SCALE} maximum"
            )));
        }
        if !d.scales.iter().any(|&s| s == 1.0) {
            return Err(ConfigError::Invalid("detection.scales must include 1.0".into()));
        }
        if d.max_side == 0 {
            return Err(ConfigError::Invalid("detection.max_side must be positive".into()));
        }
        if d.inference_size < 32 {
            return Err(ConfigError::Invalid(format!(
                "detection.inference_size {} is below the 32px minimum",
                d.inference_size
            )));
        }
        for (name, value) in [
            ("detection.detector_floor", d.detector_floor),
            ("detection.cluster_iou", d.cluster_iou),
            ("detection.nms_iou", d.nms_iou),
            ("detection.score_threshold", d.score_threshold),
        ] {
            unit_interval(name, value)?;
        }

        let m = &self.matching;
        if m.top_k == 0 {
            return Err(ConfigError::Invalid("matching.top_k must be at least 1".into()));
        }
        if !m.similarity_threshold.is_finite() || !(-1.0..=1.0).contains(&m.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "matching.similarity_threshold {} outside [-1, 1]",
                m.similarity_threshold
            )));
        }
        Ok(())
    }
}

fn unit_interval(name: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} {value} outside [0, 1]")))
    }
}
