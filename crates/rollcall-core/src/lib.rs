//! rollcall-core: face identification engine.
//!
//! Detects faces with a multi-pass (scale and flip) YOLOv8-face detector,
//! embeds each face with ArcFace, and resolves identities by k-nearest-neighbor
//! voting against a roster of enrolled embeddings. Both models run via ONNX
//! Runtime; tests swap them for fakes through [`FaceDetector`] and
//! [`FaceEmbedder`].

pub mod cluster;
pub mod config;
pub mod detector;
pub mod geometry;
pub mod matcher;
pub mod multipass;
pub mod pipeline;
pub mod recognizer;
pub mod reference;
pub mod selector;
pub mod types;

pub use config::{DetectionConfig, MatchConfig, PipelineConfig};
pub use detector::{FaceDetector, RawDetection, YoloFaceDetector};
pub use matcher::{Matcher, VotingMatcher};
pub use multipass::MultiPassDetector;
pub use pipeline::{decode_image, Identification, IdentifiedFace, Identifier, PipelineError};
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder};
pub use reference::{ReferenceSet, ReferenceSnapshot, ReferenceSource, ReferenceStore, RefreshReport};
pub use types::{BoundingBox, Embedding, IdentityId, ScoredBox};
