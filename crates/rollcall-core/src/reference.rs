//! Enrolled identities and the snapshot store the matcher reads from.
//!
//! The store never mutates a published set. A refresh builds a complete new
//! [`ReferenceSnapshot`] and swaps the `Arc` in one assignment, so a reader that
//! took a snapshot keeps a consistent view until it drops it.

use crate::types::{Embedding, IdentityId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("reference fetch failed: {0}")]
    Fetch(String),
    #[error("reference fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed reference payload: {0}")]
    MalformedPayload(String),
    #[error("invalid embedding for {identity}: {reason}")]
    InvalidEmbedding { identity: IdentityId, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One roster row: a person and one of their enrolled embeddings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceRecord {
    #[serde(alias = "student_id")]
    pub identity_id: IdentityId,
    #[serde(alias = "embedding")]
    pub embedding_vector: Vec<f32>,
}

/// Every enrolled identity with its embeddings, in identity-key order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    identities: BTreeMap<IdentityId, Vec<Embedding>>,
    dimension: Option<usize>,
    embedding_count: usize,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one embedding; the first insert fixes the set's dimensionality.
    pub fn insert(&mut self, identity: IdentityId, embedding: Embedding) -> Result<(), ReferenceError> {
        let invalid = |reason: String| ReferenceError::InvalidEmbedding {
            identity: identity.clone(),
            reason,
        };

        if embedding.values.is_empty() {
            return Err(invalid("empty vector".into()));
        }
        if embedding.values.iter().any(|v| !v.is_finite()) {
            return Err(invalid("non-finite component".into()));
        }
        if let Some(expected) = self.dimension {
            if embedding.dim() != expected {
                return Err(invalid(format!("{} dimensions, expected {expected}", embedding.dim())));
            }
        }

        self.dimension = Some(embedding.dim());
        self.embedding_count += 1;
        self.identities.entry(identity).or_default().push(embedding);
        Ok(())
    }

    /// Build a set from raw roster records, skipping malformed ones.
    ///
    /// Returns the set and the number of records skipped.
    pub fn from_records(records: &[Value]) -> (Self, usize) {
        let mut set = Self::new();
        let mut skipped = 0;

        for (index, raw) in records.iter().enumerate() {
            let record = match ReferenceRecord::deserialize(raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping malformed reference record");
                    skipped += 1;
                    continue;
                }
            };

            if let Err(e) = set.insert(record.identity_id, Embedding::new(record.embedding_vector)) {
                tracing::warn!(index, error = %e, "skipping reference record");
                skipped += 1;
            }
        }

        (set, skipped)
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn embedding_count(&self) -> usize {
        self.embedding_count
    }

    /// Dimensionality shared by every embedding, `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn get(&self, identity: &IdentityId) -> Option<&[Embedding]> {
        self.identities.get(identity).map(Vec::as_slice)
    }

    /// Identities in key order, each with its embeddings in enrollment order.
    pub fn iter(&self) -> impl Iterator<Item = (&IdentityId, &[Embedding])> {
        self.identities.iter().map(|(id, embs)| (id, embs.as_slice()))
    }
}

/// A published reference set and when it was loaded.
#[derive(Debug, Default)]
pub struct ReferenceSnapshot {
    pub set: ReferenceSet,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshReport {
    pub identities: usize,
    pub embeddings: usize,
    pub skipped: usize,
    pub refreshed_at: DateTime<Utc>,
}

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Where the roster comes from.
pub trait ReferenceSource: Send + Sync {
    /// Fetch every raw roster record.
    fn fetch(&self) -> Result<Vec<Value>, ReferenceError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Parse a roster body; the top level must be a JSON array.
pub fn parse_payload(body: &str) -> Result<Vec<Value>, ReferenceError> {
    let value = serde_json::from_str::<Value>(body).map_err(|e| ReferenceError::MalformedPayload(e.to_string()))?;
    payload_records(value)
}

/// Unwrap an already-decoded roster document into its records.
pub fn payload_records(value: Value) -> Result<Vec<Value>, ReferenceError> {
    match value {
        Value::Array(records) => Ok(records),
        other => Err(ReferenceError::MalformedPayload(format!(
            "expected a JSON array, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Roster stored as a JSON array on disk.
pub struct FileReferenceSource {
    path: PathBuf,
}

impl FileReferenceSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl ReferenceSource for FileReferenceSource {
    fn fetch(&self) -> Result<Vec<Value>, ReferenceError> {
        let body = std::fs::read_to_string(&self.path)?;
        parse_payload(&body)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Holds the current [`ReferenceSnapshot`] and swaps it atomically on refresh.
pub struct ReferenceStore {
    current: RwLock<Arc<ReferenceSnapshot>>,
    clock: Box<dyn Clock>,
}

impl Default for ReferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceStore {
    /// An empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            current: RwLock::new(Arc::new(ReferenceSnapshot::default())),
            clock: Box::new(clock),
        }
    }

    /// The current snapshot. Holding it pins that version for the caller.
    pub fn snapshot(&self) -> Arc<ReferenceSnapshot> {
        // The lock only guards an Arc swap, so a poisoned guard still holds a whole snapshot.
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.snapshot().refreshed_at
    }

    /// Build a snapshot from raw records and publish it.
    ///
    /// An empty payload publishes an empty roster. A non-empty payload in which
    /// no record is usable is rejected and the current snapshot stays.
    pub fn install(&self, records: Vec<Value>) -> Result<RefreshReport, ReferenceError> {
        let (set, skipped) = ReferenceSet::from_records(&records);
        if set.is_empty() && !records.is_empty() {
            return Err(ReferenceError::MalformedPayload(format!(
                "none of {} records were usable",
                records.len()
            )));
        }

        let refreshed_at = self.clock.now();
        let report = RefreshReport {
            identities: set.identity_count(),
            embeddings: set.embedding_count(),
            skipped,
            refreshed_at,
        };

        let snapshot = Arc::new(ReferenceSnapshot {
            set,
            refreshed_at: Some(refreshed_at),
        });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;

        tracing::info!(
            identities = report.identities,
            embeddings = report.embeddings,
            skipped = report.skipped,
            "reference set installed"
        );
        Ok(report)
    }

    /// Fetch from `source` and install. On failure the current snapshot is untouched.
    pub fn refresh(&self, source: &dyn ReferenceSource) -> Result<RefreshReport, ReferenceError> {
        let records = source.fetch().map_err(|e| {
            tracing::warn!(source = %source.describe(), error = %e, "reference fetch failed; keeping current set");
            e
        })?;
        self.install(records)
    }
}
