use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Stable key naming one enrolled person (the enrollment name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Face embedding vector produced by an encoder for one face image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Encoder that produced this embedding, when the encoder reports one.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// How current a reference set is relative to its image corpus.
///
/// Milliseconds since the Unix epoch of the newest corpus change the set has
/// seen. A set is trustworthy only while its marker is >= the corpus marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FreshnessMarker(i64);

impl FreshnessMarker {
    /// Marker of an empty corpus.
    pub const ZERO: FreshnessMarker = FreshnessMarker(0);

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let millis = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        };
        Self(millis)
    }
}

impl fmt::Display for FreshnessMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ReferenceSetError {
    #[error("identity {0} has no reference embeddings")]
    EmptyIdentity(Identity),
    #[error("embedding for {identity} has dimension {actual}, set dimension is {expected}")]
    DimensionMismatch {
        identity: Identity,
        expected: usize,
        actual: usize,
    },
    #[error("embedding for {0} has no components")]
    EmptyEmbedding(Identity),
}

/// Reference embeddings per identity.
///
/// Every vector shares one dimensionality and no identity maps to an empty
/// set. Iteration is in ascending identity order, which is also the order
/// matchers use to break exact distance ties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceSet {
    dimension: Option<usize>,
    entries: BTreeMap<Identity, Vec<Embedding>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the embeddings for one identity, replacing any previous entry.
    pub fn insert(
        &mut self,
        identity: Identity,
        embeddings: Vec<Embedding>,
    ) -> Result<(), ReferenceSetError> {
        if embeddings.is_empty() {
            return Err(ReferenceSetError::EmptyIdentity(identity));
        }

        let mut expected = self.dimension;
        for embedding in &embeddings {
            let actual = embedding.dimension();
            if actual == 0 {
                return Err(ReferenceSetError::EmptyEmbedding(identity));
            }
            match expected {
                Some(dim) if dim != actual => {
                    return Err(ReferenceSetError::DimensionMismatch {
                        identity,
                        expected: dim,
                        actual,
                    });
                }
                _ => expected = Some(actual),
            }
        }

        self.dimension = expected;
        self.entries.insert(identity, embeddings);
        Ok(())
    }

    /// Dimensionality shared by every vector, `None` while the set is empty.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of reference vectors across all identities.
    pub fn vector_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&[Embedding]> {
        self.entries.get(identity).map(Vec::as_slice)
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &[Embedding])> {
        self.entries.iter().map(|(id, set)| (id, set.as_slice()))
    }
}

/// An immutable reference set tagged with the corpus marker it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: Uuid,
    pub marker: FreshnessMarker,
    pub computed_at: DateTime<Utc>,
    pub refs: ReferenceSet,
}

impl Snapshot {
    pub fn new(marker: FreshnessMarker, refs: ReferenceSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            marker,
            computed_at: Utc::now(),
            refs,
        }
    }

    /// Snapshot with no identities. Every comparison against it is `Unknown`.
    pub fn empty() -> Self {
        Self::new(FreshnessMarker::ZERO, ReferenceSet::new())
    }

    /// Whether this snapshot may be trusted for a corpus at `corpus_marker`.
    pub fn is_fresh_for(&self, corpus_marker: FreshnessMarker) -> bool {
        self.marker >= corpus_marker
    }
}

/// Outcome of matching one observed embedding.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Identified { identity: Identity, distance: f32 },
    Unknown,
}

impl MatchResult {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchResult::Identified { identity, .. } => Some(identity),
            MatchResult::Unknown => None,
        }
    }

    pub fn is_identified(&self) -> bool {
        matches!(self, MatchResult::Identified { .. })
    }
}

/// Why an attendance event was not logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// Already logged this session within the window.
    Session,
    /// The durable ledger holds a record within the window.
    Ledger,
}

/// Verdict of the dedup check for one sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Suppress(SuppressReason),
}

/// Row id of a durable attendance record.
pub type RecordId = i64;

/// One durable attendance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: RecordId,
    pub identity: Identity,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}
