//! presence-core — Face attribution and attendance dedup engine.
//!
//! Keeps a per-identity cache of reference embeddings in step with an image
//! corpus, matches observed embeddings against it under a distance tolerance,
//! and guarantees at most one logged attendance event per identity per window.

pub mod dedup;
pub mod encoder;
pub mod matcher;
pub mod snapshot;
pub mod store;
pub mod types;

pub use dedup::{DedupConfig, DedupCoordinator, Ledger, LedgerError, LogOutcome, DEFAULT_WINDOW_SECS};
pub use encoder::{Encoder, EncoderError, Encoding, FaceImage};
pub use matcher::{
    CosineMatcher, EuclideanMatcher, MatchError, Matcher, MatcherConfig, Metric, DEFAULT_TOLERANCE,
};
pub use snapshot::SnapshotError;
pub use store::{
    CorpusEntry, CorpusError, CorpusReader, EmbeddingStore, RecomputeReport, RemoteSnapshotStore,
    SnapshotCache, StoreError, SyncReport,
};
pub use types::{
    AttendanceRecord, Decision, Embedding, FreshnessMarker, Identity, MatchResult, RecordId,
    ReferenceSet, ReferenceSetError, Snapshot, SuppressReason,
};
