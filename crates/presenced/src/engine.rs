use chrono::{DateTime, Utc};
use presence_core::{
    CorpusReader, DedupCoordinator, Encoder, Encoding, EmbeddingStore, FaceImage, FreshnessMarker,
    Identity, Ledger, LogOutcome, MatchResult, MatcherConfig, Snapshot, SuppressReason,
};
use presence_io::SnapshotSource;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoder error: {0}")]
    Encoder(#[from] presence_core::EncoderError),
    #[error("match error: {0}")]
    Match(#[from] presence_core::MatchError),
    #[error("ledger error: {0}")]
    Ledger(#[from] presence_core::LedgerError),
    #[error("snapshot error: {0}")]
    Store(#[from] presence_core::StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// What happened to one observed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    NoFace,
    Unknown,
    Logged {
        identity: Identity,
        distance: f32,
        record: i64,
    },
    Suppressed {
        identity: Identity,
        distance: f32,
        reason: SuppressReason,
    },
}

/// Identifying facts about the snapshot in use.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSummary {
    pub id: Uuid,
    pub marker: FreshnessMarker,
    pub identities: usize,
    pub vectors: usize,
}

impl SnapshotSummary {
    fn of(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.id,
            marker: snapshot.marker,
            identities: snapshot.refs.len(),
            vectors: snapshot.refs.vector_count(),
        }
    }
}

/// Frame-by-frame recognition state: decode, encode, match, dedup, log.
///
/// Frames are matched against one snapshot at a time; `refresh` swaps in a
/// newer one between frames and keeps the old one if loading fails.
pub struct Recognizer<C, E, L> {
    store: EmbeddingStore<C, E>,
    matcher: MatcherConfig,
    dedup: DedupCoordinator<L>,
    source: SnapshotSource,
    snapshot: Arc<Snapshot>,
}

impl<C: CorpusReader, E: Encoder, L: Ledger> Recognizer<C, E, L> {
    pub fn new(
        store: EmbeddingStore<C, E>,
        matcher: MatcherConfig,
        dedup: DedupCoordinator<L>,
        source: SnapshotSource,
    ) -> Self {
        Self {
            store,
            matcher,
            dedup,
            source,
            snapshot: Arc::new(Snapshot::empty()),
        }
    }

    pub fn snapshot(&self) -> SnapshotSummary {
        SnapshotSummary::of(&self.snapshot)
    }

    #[cfg(test)]
    pub fn dedup(&self) -> &DedupCoordinator<L> {
        &self.dedup
    }

    /// Reload the snapshot from the configured source.
    pub fn refresh(&mut self) -> Result<SnapshotSummary, EngineError> {
        let loaded = match self.source {
            SnapshotSource::Local => self.store.refresh(),
            SnapshotSource::Remote => self.store.remote_load(),
        };
        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    snapshot = %self.snapshot.id,
                    "snapshot refresh failed; keeping previous snapshot"
                );
                return Err(e.into());
            }
        };

        if snapshot.id != self.snapshot.id {
            tracing::info!(
                snapshot = %snapshot.id,
                marker = %snapshot.marker,
                identities = snapshot.refs.len(),
                "snapshot in use"
            );
        }
        if snapshot.refs.is_empty() {
            tracing::warn!("snapshot has no known identities; every face will be unknown");
        }
        self.snapshot = snapshot;
        Ok(self.snapshot())
    }

    pub fn observe(
        &mut self,
        image_bytes: &[u8],
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<FrameOutcome, EngineError> {
        let image = FaceImage::decode(source, image_bytes)?;
        let embedding = match self.store.encoder_mut().encode(&image)? {
            Encoding::Face(embedding) => embedding,
            Encoding::NoFace => {
                tracing::debug!(source, "no face in frame");
                return Ok(FrameOutcome::NoFace);
            }
        };

        let (identity, distance) = match self.matcher.compare(&embedding, &self.snapshot.refs)? {
            MatchResult::Identified { identity, distance } => (identity, distance),
            MatchResult::Unknown => {
                tracing::debug!(source, "face not recognised");
                return Ok(FrameOutcome::Unknown);
            }
        };

        let outcome = match self.dedup.log_presence(&identity, now)? {
            LogOutcome::Logged(record) => {
                tracing::info!(%identity, distance, record, source, "attendance logged");
                FrameOutcome::Logged {
                    identity,
                    distance,
                    record,
                }
            }
            LogOutcome::Suppressed(reason) => {
                tracing::debug!(%identity, ?reason, source, "already logged within window");
                FrameOutcome::Suppressed {
                    identity,
                    distance,
                    reason,
                }
            }
        };
        Ok(outcome)
    }

    pub fn reset_session(&mut self) {
        self.dedup.clear_session();
        tracing::info!("session dedup state cleared");
    }
}

/// Messages sent from the spool watcher (or anyone holding a handle) to the
/// engine thread.
enum EngineRequest {
    Observe {
        image_bytes: Vec<u8>,
        source: String,
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<FrameOutcome, EngineError>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<SnapshotSummary, EngineError>>,
    },
    ResetSession {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run one frame through recognition and attendance logging.
    pub async fn observe(
        &self,
        image_bytes: Vec<u8>,
        source: String,
        now: DateTime<Utc>,
    ) -> Result<FrameOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Observe {
                image_bytes,
                source,
                now,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Reload the snapshot if the source moved on.
    pub async fn refresh(&self) -> Result<SnapshotSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Refresh { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Forget in-process dedup state; the ledger still applies.
    pub async fn reset_session(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ResetSession { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the initial snapshot synchronously and fails fast if it cannot,
/// then serves requests one at a time until every handle is dropped.
pub fn spawn_engine<C, E, L>(mut recognizer: Recognizer<C, E, L>) -> Result<EngineHandle, EngineError>
where
    C: CorpusReader + Send + 'static,
    E: Encoder + Send + 'static,
    L: Ledger + Send + 'static,
{
    let summary = recognizer.refresh()?;
    tracing::info!(
        snapshot = %summary.id,
        identities = summary.identities,
        vectors = summary.vectors,
        "initial snapshot loaded"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Observe {
                        image_bytes,
                        source,
                        now,
                        reply,
                    } => {
                        let result = recognizer.observe(&image_bytes, &source, now);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Refresh { reply } => {
                        let _ = reply.send(recognizer.refresh());
                    }
                    EngineRequest::ResetSession { reply } => {
                        recognizer.reset_session();
                        let _ = reply.send(());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
