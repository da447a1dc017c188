//! Embedding store: the cached reference set, kept consistent with the image
//! corpus it was derived from.
//!
//! `load` reuses the held (or locally persisted) snapshot while its marker is
//! at least the corpus marker, and otherwise recomputes the whole corpus into
//! a brand-new snapshot. Snapshots are never edited in place; callers hold an
//! `Arc<Snapshot>` that stays valid however the store moves on.

use crate::encoder::{Encoder, Encoding, FaceImage};
use crate::snapshot::{self, SnapshotError};
use crate::types::{Embedding, FreshnessMarker, Identity, ReferenceSet, ReferenceSetError, Snapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("corpus unreadable at {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("image {path} unreadable: {reason}")]
    Image { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("recomputed reference set is invalid: {0}")]
    ReferenceSet(#[from] ReferenceSetError),
    #[error("snapshot cache: {0}")]
    Cache(String),
    #[error("remote snapshot store: {0}")]
    Remote(String),
    #[error("no remote snapshot store configured")]
    NoRemote,
    #[error("no snapshot loaded yet")]
    NoSnapshot,
}

/// One image of one identity in the source corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub identity: Identity,
    /// Reader-specific locator (file path, object key).
    pub source: String,
}

/// Source of truth for enrollment images.
pub trait CorpusReader {
    /// Freshness marker of the corpus as a whole.
    fn marker(&self) -> Result<FreshnessMarker, CorpusError>;

    /// Every (identity, image) pair in the corpus.
    fn entries(&self) -> Result<Vec<CorpusEntry>, CorpusError>;

    /// Raw encoded bytes of one image.
    fn read(&self, entry: &CorpusEntry) -> Result<Vec<u8>, CorpusError>;
}

/// Local persisted copy of the latest snapshot.
pub trait SnapshotCache {
    fn read(&self) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Remote durable location for sharing a precomputed snapshot.
pub trait RemoteSnapshotStore {
    /// `Ok(None)` when nothing has been published yet.
    fn get(&self) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, bytes: &[u8]) -> Result<(), StoreError>;
}

impl<R: RemoteSnapshotStore + ?Sized> RemoteSnapshotStore for Box<R> {
    fn get(&self) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get()
    }

    fn put(&self, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).put(bytes)
    }
}

/// Counters for one recompute pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecomputeReport {
    pub images: usize,
    pub encoded: usize,
    pub skipped: usize,
    /// Identities dropped because none of their images produced an embedding.
    pub omitted: Vec<Identity>,
}

/// Outcome of [`EmbeddingStore::sync_remote`].
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub snapshot: Arc<Snapshot>,
    pub added: Vec<Identity>,
    pub already_present: usize,
    pub uploaded: bool,
    pub report: RecomputeReport,
}

pub struct EmbeddingStore<C, E> {
    corpus: C,
    encoder: E,
    cache: Option<Box<dyn SnapshotCache + Send>>,
    remote: Option<Box<dyn RemoteSnapshotStore + Send>>,
    current: Option<Arc<Snapshot>>,
}

impl<C: CorpusReader, E: Encoder> EmbeddingStore<C, E> {
    pub fn new(corpus: C, encoder: E) -> Self {
        Self {
            corpus,
            encoder,
            cache: None,
            remote: None,
            current: None,
        }
    }

    pub fn with_cache(mut self, cache: impl SnapshotCache + Send + 'static) -> Self {
        self.cache = Some(Box::new(cache));
        self
    }

    pub fn with_remote(mut self, remote: impl RemoteSnapshotStore + Send + 'static) -> Self {
        self.remote = Some(Box::new(remote));
        self
    }

    pub fn corpus(&self) -> &C {
        &self.corpus
    }

    /// The encoder reference embeddings are computed with. Frames to identify should be
    /// encoded with the same one.
    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    /// Latest snapshot produced or adopted by `load`.
    pub fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.clone()
    }

    /// Read the corpus marker and [`load`](Self::load) against it.
    pub fn refresh(&mut self) -> Result<Arc<Snapshot>, StoreError> {
        let marker = self.corpus.marker()?;
        self.load(marker)
    }

    /// Best available snapshot for a corpus at `corpus_marker`.
    ///
    /// On failure the previously held snapshot is left untouched.
    pub fn load(&mut self, corpus_marker: FreshnessMarker) -> Result<Arc<Snapshot>, StoreError> {
        if let Some(current) = &self.current {
            if current.is_fresh_for(corpus_marker) {
                tracing::debug!(snapshot = %current.id, marker = %current.marker, "snapshot cache hit");
                return Ok(Arc::clone(current));
            }
        }

        if let Some(cached) = self.read_cache() {
            if cached.is_fresh_for(corpus_marker) {
                tracing::info!(
                    snapshot = %cached.id,
                    marker = %cached.marker,
                    identities = cached.refs.len(),
                    "reusing persisted snapshot"
                );
                let cached = Arc::new(cached);
                self.current = Some(Arc::clone(&cached));
                return Ok(cached);
            }
            tracing::info!(
                cached = %cached.marker,
                corpus = %corpus_marker,
                "persisted snapshot is stale"
            );
        }

        tracing::info!(corpus = %corpus_marker, "recomputing reference embeddings");
        let entries = self.corpus.entries()?;
        let (refs, report) = self.encode_entries(&entries)?;
        let snapshot = Arc::new(Snapshot::new(corpus_marker, refs));

        tracing::info!(
            snapshot = %snapshot.id,
            identities = snapshot.refs.len(),
            images = report.images,
            encoded = report.encoded,
            skipped = report.skipped,
            omitted = report.omitted.len(),
            "recompute finished"
        );

        self.persist(&snapshot);
        self.current = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Fetch the published snapshot without consulting local freshness.
    ///
    /// An empty snapshot comes back when nothing was ever published.
    pub fn remote_load(&self) -> Result<Arc<Snapshot>, StoreError> {
        let remote = self.remote.as_ref().ok_or(StoreError::NoRemote)?;
        match remote.get()? {
            Some(bytes) => {
                let snapshot = snapshot::decode(&bytes)?;
                tracing::info!(
                    snapshot = %snapshot.id,
                    identities = snapshot.refs.len(),
                    "loaded remote snapshot"
                );
                Ok(Arc::new(snapshot))
            }
            None => {
                tracing::warn!("no remote snapshot published; recognition will report unknown");
                Ok(Arc::new(Snapshot::empty()))
            }
        }
    }

    /// Upload the current snapshot to the remote store.
    pub fn publish(&self) -> Result<Arc<Snapshot>, StoreError> {
        let remote = self.remote.as_ref().ok_or(StoreError::NoRemote)?;
        let current = self.current.clone().ok_or(StoreError::NoSnapshot)?;
        remote.put(&snapshot::encode(&current)?)?;
        tracing::info!(snapshot = %current.id, identities = current.refs.len(), "published snapshot");
        Ok(current)
    }

    /// Encode identities the remote snapshot lacks and publish the union as a
    /// new snapshot. Identities already published are carried over unchanged.
    pub fn sync_remote(&mut self) -> Result<SyncReport, StoreError> {
        let remote = self.remote.as_ref().ok_or(StoreError::NoRemote)?;
        let existing = match remote.get()? {
            Some(bytes) => snapshot::decode(&bytes)?,
            None => {
                tracing::info!("no remote snapshot yet; starting from an empty set");
                Snapshot::empty()
            }
        };

        let corpus_marker = self.corpus.marker()?;
        let entries = self.corpus.entries()?;
        let (new_entries, covered): (Vec<CorpusEntry>, Vec<CorpusEntry>) = entries
            .into_iter()
            .partition(|e| !existing.refs.contains(&e.identity));
        let already_present = covered
            .iter()
            .map(|e| &e.identity)
            .collect::<BTreeSet<_>>()
            .len();

        if new_entries.is_empty() {
            tracing::info!(identities = existing.refs.len(), "remote snapshot already covers the corpus");
            return Ok(SyncReport {
                snapshot: Arc::new(existing),
                added: Vec::new(),
                already_present,
                uploaded: false,
                report: RecomputeReport::default(),
            });
        }

        let (added_refs, report) = self.encode_entries(&new_entries)?;
        // Carried-over identities were not re-encoded, so only an initially
        // empty remote set can claim the corpus marker.
        let marker = if existing.refs.is_empty() {
            corpus_marker
        } else {
            existing.marker
        };

        let mut refs = existing.refs.clone();
        let mut added = Vec::with_capacity(added_refs.len());
        for (identity, embeddings) in added_refs.iter() {
            refs.insert(identity.clone(), embeddings.to_vec())?;
            added.push(identity.clone());
        }

        let merged = Arc::new(Snapshot::new(marker, refs));
        let remote = self.remote.as_ref().ok_or(StoreError::NoRemote)?;
        remote.put(&snapshot::encode(&merged)?)?;
        tracing::info!(
            snapshot = %merged.id,
            added = added.len(),
            already_present,
            "published merged snapshot"
        );

        Ok(SyncReport {
            snapshot: merged,
            added,
            already_present,
            uploaded: true,
            report,
        })
    }

    fn read_cache(&self) -> Option<Snapshot> {
        let cache = self.cache.as_ref()?;
        let bytes = match cache.read() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot cache unreadable; recomputing");
                return None;
            }
        };
        match snapshot::decode(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, "discarding corrupt persisted snapshot");
                None
            }
        }
    }

    fn persist(&self, snapshot: &Snapshot) {
        let Some(cache) = &self.cache else {
            return;
        };
        let result = snapshot::encode(snapshot)
            .map_err(StoreError::from)
            .and_then(|bytes| cache.write(&bytes));
        if let Err(e) = result {
            tracing::warn!(error = %e, snapshot = %snapshot.id, "failed to persist snapshot");
        }
    }

    /// Encode every entry into a reference set. Per-image failures are
    /// skipped; identities left with no embedding are omitted.
    fn encode_entries(
        &mut self,
        entries: &[CorpusEntry],
    ) -> Result<(ReferenceSet, RecomputeReport), StoreError> {
        let mut report = RecomputeReport {
            images: entries.len(),
            ..RecomputeReport::default()
        };
        let mut seen = BTreeSet::new();
        let mut grouped: BTreeMap<Identity, Vec<Embedding>> = BTreeMap::new();

        for entry in entries {
            seen.insert(entry.identity.clone());
            match self.encode_entry(entry) {
                Some(embedding) => {
                    report.encoded += 1;
                    grouped.entry(entry.identity.clone()).or_default().push(embedding);
                }
                None => report.skipped += 1,
            }
        }

        let mut refs = ReferenceSet::new();
        for (identity, embeddings) in grouped {
            refs.insert(identity, embeddings)?;
        }

        for identity in seen {
            if !refs.contains(&identity) {
                tracing::warn!(%identity, "no usable face in any image; identity omitted");
                report.omitted.push(identity);
            }
        }

        Ok((refs, report))
    }

    fn encode_entry(&mut self, entry: &CorpusEntry) -> Option<Embedding> {
        let bytes = match self.corpus.read(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(source = %entry.source, error = %e, "skipping unreadable image");
                return None;
            }
        };

        let image = match FaceImage::decode(entry.source.as_str(), &bytes) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(source = %entry.source, error = %e, "skipping undecodable image");
                return None;
            }
        };

        match self.encoder.encode(&image) {
            Ok(Encoding::Face(embedding)) => {
                tracing::debug!(identity = %entry.identity, source = %entry.source, "encoded image");
                Some(embedding)
            }
            Ok(Encoding::NoFace) => {
                tracing::warn!(identity = %entry.identity, source = %entry.source, "no face found; skipping");
                None
            }
            Err(e) => {
                tracing::warn!(source = %entry.source, error = %e, "encoder failed; skipping");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::encoder::EncoderError;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::cell::Cell;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub(crate) fn png(color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(2, 2, Rgb(color));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    /// Corpus held in memory; `None` bytes simulate an unreadable file.
    pub(crate) struct MemoryCorpus {
        pub marker: Cell<i64>,
        pub images: Vec<(&'static str, &'static str, Option<Vec<u8>>)>,
        pub broken: bool,
    }

    impl MemoryCorpus {
        pub(crate) fn new(images: Vec<(&'static str, &'static str, Option<Vec<u8>>)>) -> Self {
            Self {
                marker: Cell::new(1_000),
                images,
                broken: false,
            }
        }
    }

    impl CorpusReader for MemoryCorpus {
        fn marker(&self) -> Result<FreshnessMarker, CorpusError> {
            Ok(FreshnessMarker::from_millis(self.marker.get()))
        }

        fn entries(&self) -> Result<Vec<CorpusEntry>, CorpusError> {
            if self.broken {
                return Err(CorpusError::Unreadable {
                    path: "memory".into(),
                    reason: "gone".into(),
                });
            }
            Ok(self
                .images
                .iter()
                .map(|(identity, source, _)| CorpusEntry {
                    identity: (*identity).into(),
                    source: (*source).into(),
                })
                .collect())
        }

        fn read(&self, entry: &CorpusEntry) -> Result<Vec<u8>, CorpusError> {
            self.images
                .iter()
                .find(|(_, source, _)| *source == entry.source)
                .and_then(|(_, _, bytes)| bytes.clone())
                .ok_or_else(|| CorpusError::Image {
                    path: entry.source.clone(),
                    reason: "unreadable".into(),
                })
        }
    }

    /// Embeds the first pixel's colour; pure black means no face.
    pub(crate) struct ColorEncoder {
        pub calls: Arc<AtomicUsize>,
        pub dimension: usize,
    }

    impl ColorEncoder {
        pub(crate) fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                dimension: 3,
            }
        }
    }

    impl Encoder for ColorEncoder {
        fn encode(&mut self, image: &FaceImage) -> Result<Encoding, EncoderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let pixel = &image.rgb[..3];
            if pixel == [0, 0, 0] {
                return Ok(Encoding::NoFace);
            }
            let mut values: Vec<f32> = pixel.iter().map(|&c| c as f32 / 255.0).collect();
            values.resize(self.dimension, 0.0);
            Ok(Encoding::Face(Embedding::new(values)))
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct MemoryBlob(pub Arc<Mutex<Option<Vec<u8>>>>);

    impl SnapshotCache for MemoryBlob {
        fn read(&self) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
            *self.0.lock().unwrap() = Some(bytes.to_vec());
            Ok(())
        }
    }

    impl RemoteSnapshotStore for MemoryBlob {
        fn get(&self) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn put(&self, bytes: &[u8]) -> Result<(), StoreError> {
            *self.0.lock().unwrap() = Some(bytes.to_vec());
            Ok(())
        }
    }

    fn two_people() -> MemoryCorpus {
        MemoryCorpus::new(vec![
            ("Ana", "Ana/1.png", Some(png([200, 10, 10]))),
            ("Ana", "Ana/2.png", Some(png([190, 20, 10]))),
            ("Ben", "Ben/1.png", Some(png([10, 200, 10]))),
        ])
    }

    #[test]
    fn test_load_reuses_fresh_snapshot() {
        let encoder = ColorEncoder::new();
        let calls = Arc::clone(&encoder.calls);
        let mut store = EmbeddingStore::new(two_people(), encoder);

        let marker = FreshnessMarker::from_millis(1_000);
        let first = store.load(marker).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let second = store.load(marker).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // An older corpus marker is still covered.
        let third = store.load(FreshnessMarker::from_millis(10)).unwrap();
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_newer_corpus_forces_recompute() {
        let encoder = ColorEncoder::new();
        let calls = Arc::clone(&encoder.calls);
        let mut store = EmbeddingStore::new(two_people(), encoder);

        let old = store.load(FreshnessMarker::from_millis(1_000)).unwrap();
        let new = store.load(FreshnessMarker::from_millis(2_000)).unwrap();

        assert_ne!(old.id, new.id);
        assert_eq!(new.marker, FreshnessMarker::from_millis(2_000));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        // The caller's old snapshot is untouched.
        assert_eq!(old.marker, FreshnessMarker::from_millis(1_000));
    }

    #[test]
    fn test_refresh_reads_corpus_marker() {
        let mut store = EmbeddingStore::new(two_people(), ColorEncoder::new());
        let first = store.refresh().unwrap();
        assert_eq!(first.marker, FreshnessMarker::from_millis(1_000));

        store.corpus().marker.set(5_000);
        let second = store.refresh().unwrap();
        assert_eq!(second.marker, FreshnessMarker::from_millis(5_000));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_skipped_images_never_leave_empty_identities() {
        let corpus = MemoryCorpus::new(vec![
            ("Ana", "Ana/1.png", Some(png([200, 10, 10]))),
            ("Ana", "Ana/dark.png", Some(png([0, 0, 0]))),
            ("Ana", "Ana/gone.png", None),
            ("Ana", "Ana/garbage.jpg", Some(b"not a jpeg".to_vec())),
            ("Ben", "Ben/dark.png", Some(png([0, 0, 0]))),
            ("Ben", "Ben/gone.png", None),
        ]);
        let mut store = EmbeddingStore::new(corpus, ColorEncoder::new());

        let snapshot = store.refresh().unwrap();
        assert_eq!(snapshot.refs.len(), 1);
        assert_eq!(snapshot.refs.get(&"Ana".into()).unwrap().len(), 1);
        assert!(!snapshot.refs.contains(&"Ben".into()));
        for (_, embeddings) in snapshot.refs.iter() {
            assert!(!embeddings.is_empty());
        }
    }

    #[test]
    fn test_unreadable_corpus_keeps_previous_snapshot() {
        let mut store = EmbeddingStore::new(two_people(), ColorEncoder::new());
        let before = store.refresh().unwrap();

        store.corpus.broken = true;
        let err = store.load(FreshnessMarker::from_millis(9_000)).unwrap_err();
        assert!(matches!(err, StoreError::Corpus(CorpusError::Unreadable { .. })));
        assert!(Arc::ptr_eq(&store.current().unwrap(), &before));
    }

    #[test]
    fn test_dimension_mismatch_during_recompute_is_fatal() {
        struct Drifting(usize);
        impl Encoder for Drifting {
            fn encode(&mut self, _image: &FaceImage) -> Result<Encoding, EncoderError> {
                self.0 += 1;
                Ok(Encoding::Face(Embedding::new(vec![0.5; self.0])))
            }
        }

        let mut store = EmbeddingStore::new(two_people(), Drifting(1));
        let err = store.refresh().unwrap_err();
        assert!(matches!(err, StoreError::ReferenceSet(_)));
        assert!(store.current().is_none());
    }

    #[test]
    fn test_persisted_snapshot_survives_restart() {
        let cache = MemoryBlob::default();
        let mut first = EmbeddingStore::new(two_people(), ColorEncoder::new()).with_cache(cache.clone());
        let computed = first.refresh().unwrap();

        let encoder = ColorEncoder::new();
        let calls = Arc::clone(&encoder.calls);
        let mut second = EmbeddingStore::new(two_people(), encoder).with_cache(cache.clone());
        let reused = second.refresh().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(reused.id, computed.id);
        assert_eq!(reused.refs, computed.refs);
    }

    #[test]
    fn test_stale_persisted_snapshot_is_replaced() {
        let cache = MemoryBlob::default();
        let mut first = EmbeddingStore::new(two_people(), ColorEncoder::new()).with_cache(cache.clone());
        let old = first.refresh().unwrap();

        let corpus = two_people();
        corpus.marker.set(2_000);
        let mut second = EmbeddingStore::new(corpus, ColorEncoder::new()).with_cache(cache.clone());
        let new = second.refresh().unwrap();
        assert_ne!(new.id, old.id);

        let persisted = snapshot::decode(&cache.read().unwrap().unwrap()).unwrap();
        assert_eq!(persisted.id, new.id);
    }

    #[test]
    fn test_corrupt_persisted_snapshot_is_recomputed() {
        let cache = MemoryBlob::default();
        cache.write(b"{ definitely not a snapshot").unwrap();

        let encoder = ColorEncoder::new();
        let calls = Arc::clone(&encoder.calls);
        let mut store = EmbeddingStore::new(two_people(), encoder).with_cache(cache.clone());
        let snapshot = store.refresh().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(snapshot.refs.len(), 2);
        assert!(snapshot::decode(&cache.read().unwrap().unwrap()).is_ok());
    }

    #[test]
    fn test_unsupported_snapshot_format_is_recomputed_locally_and_fatal_remotely() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&snapshot::encode(&Snapshot::empty()).unwrap()).unwrap();
        value["format"] = serde_json::json!(99);
        let future = serde_json::to_vec(&value).unwrap();

        let cache = MemoryBlob::default();
        cache.write(&future).unwrap();
        let encoder = ColorEncoder::new();
        let calls = Arc::clone(&encoder.calls);
        let mut store = EmbeddingStore::new(two_people(), encoder).with_cache(cache.clone());
        assert_eq!(store.refresh().unwrap().refs.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let remote = MemoryBlob::default();
        remote.put(&future).unwrap();
        let store = EmbeddingStore::new(two_people(), ColorEncoder::new()).with_remote(remote);
        let err = store.remote_load().unwrap_err();
        assert!(matches!(err, StoreError::Snapshot(SnapshotError::UnsupportedFormat(99))));
    }

    #[test]
    fn test_remote_load_without_publication_is_empty() {
        let store = EmbeddingStore::new(two_people(), ColorEncoder::new()).with_remote(MemoryBlob::default());
        let snapshot = store.remote_load().unwrap();
        assert!(snapshot.refs.is_empty());
    }

    #[test]
    fn test_remote_load_rejects_corrupt_snapshot() {
        let remote = MemoryBlob::default();
        remote.put(b"[1, 2, 3]").unwrap();
        let store = EmbeddingStore::new(two_people(), ColorEncoder::new()).with_remote(remote);
        let err = store.remote_load().unwrap_err();
        assert!(matches!(err, StoreError::Snapshot(_)));
    }

    #[test]
    fn test_remote_load_requires_remote() {
        let store = EmbeddingStore::new(two_people(), ColorEncoder::new());
        assert!(matches!(store.remote_load().unwrap_err(), StoreError::NoRemote));
    }

    #[test]
    fn test_publish_then_remote_load() {
        let remote = MemoryBlob::default();
        let mut store = EmbeddingStore::new(two_people(), ColorEncoder::new()).with_remote(remote.clone());
        assert!(matches!(store.publish().unwrap_err(), StoreError::NoSnapshot));

        let local = store.refresh().unwrap();
        store.publish().unwrap();

        let reader = EmbeddingStore::new(two_people(), ColorEncoder::new()).with_remote(remote);
        let fetched = reader.remote_load().unwrap();
        assert_eq!(fetched.id, local.id);
        assert_eq!(fetched.refs, local.refs);
    }

    #[test]
    fn test_sync_remote_encodes_only_missing_identities() {
        let remote = MemoryBlob::default();
        let mut seed = EmbeddingStore::new(
            MemoryCorpus::new(vec![("Ana", "Ana/1.png", Some(png([200, 10, 10])))]),
            ColorEncoder::new(),
        )
        .with_remote(remote.clone());
        seed.refresh().unwrap();
        seed.publish().unwrap();

        let encoder = ColorEncoder::new();
        let calls = Arc::clone(&encoder.calls);
        let mut store = EmbeddingStore::new(two_people(), encoder).with_remote(remote.clone());
        let report = store.sync_remote().unwrap();

        assert!(report.uploaded);
        assert_eq!(report.added, vec![Identity::from("Ben")]);
        assert_eq!(report.already_present, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Ana keeps the single published vector, not the two in the corpus.
        assert_eq!(report.snapshot.refs.get(&"Ana".into()).unwrap().len(), 1);

        let published = snapshot::decode(&remote.get().unwrap().unwrap()).unwrap();
        assert_eq!(published.id, report.snapshot.id);
        assert_eq!(published.refs.len(), 2);

        let again = store.sync_remote().unwrap();
        assert!(!again.uploaded);
        assert!(again.added.is_empty());
    }
}
