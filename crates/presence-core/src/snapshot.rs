//! Serialized form of a [`Snapshot`], shared between processes through a
//! local cache file or a remote snapshot store.
//!
//! JSON envelope:
//!
//! ```json
//! { "format": 1, "id": "...", "marker": 1718000000000,
//!   "computed_at": "2024-06-10T08:00:00Z", "dimension": 128,
//!   "identities": { "Ana": [ { "values": [0.01, ...], "model_version": null } ] } }
//! ```
//!
//! Components are written with shortest round-trip float formatting, so
//! values survive encode/decode bit-for-bit.

use crate::types::{Embedding, FreshnessMarker, Identity, ReferenceSet, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Current envelope version.
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("unsupported snapshot format {0} (this build reads format {SNAPSHOT_FORMAT})")]
    UnsupportedFormat(u32),
    #[error("embedding for {0} has a non-finite component")]
    NonFinite(Identity),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: u32,
    id: Uuid,
    marker: FreshnessMarker,
    computed_at: DateTime<Utc>,
    dimension: Option<usize>,
    identities: BTreeMap<Identity, Vec<Embedding>>,
}

/// Serialize a snapshot. Refuses NaN/infinite components, which JSON cannot carry.
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, SnapshotError> {
    let mut identities = BTreeMap::new();
    for (identity, embeddings) in snapshot.refs.iter() {
        if embeddings
            .iter()
            .any(|e| e.values.iter().any(|v| !v.is_finite()))
        {
            return Err(SnapshotError::NonFinite(identity.clone()));
        }
        identities.insert(identity.clone(), embeddings.to_vec());
    }

    let envelope = Envelope {
        format: SNAPSHOT_FORMAT,
        id: snapshot.id,
        marker: snapshot.marker,
        computed_at: snapshot.computed_at,
        dimension: snapshot.refs.dimension(),
        identities,
    };

    serde_json::to_vec(&envelope).map_err(|e| SnapshotError::Corrupt(format!("encode: {e}")))
}

/// Parse and validate a serialized snapshot.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| SnapshotError::Corrupt(e.to_string()))?;

    if envelope.format != SNAPSHOT_FORMAT {
        return Err(SnapshotError::UnsupportedFormat(envelope.format));
    }

    let mut refs = ReferenceSet::new();
    for (identity, embeddings) in envelope.identities {
        if embeddings
            .iter()
            .any(|e| e.values.iter().any(|v| !v.is_finite()))
        {
            return Err(SnapshotError::NonFinite(identity));
        }
        refs.insert(identity, embeddings)
            .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
    }

    if refs.dimension() != envelope.dimension {
        return Err(SnapshotError::Corrupt(format!(
            "declared dimension {:?} but vectors have {:?}",
            envelope.dimension,
            refs.dimension()
        )));
    }

    Ok(Snapshot {
        id: envelope.id,
        marker: envelope.marker,
        computed_at: envelope.computed_at,
        refs,
    })
}
