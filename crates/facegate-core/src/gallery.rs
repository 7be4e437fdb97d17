//! Authoritative in-memory store of enrolled identities.
//!
//! Keyed by composite identity key, iterated in stable insertion order.
//! All records share one embedding dimensionality, fixed by the first
//! record and released again when the gallery empties.

use crate::types::{Embedding, IdentityRecord};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("embedding dimension mismatch: gallery holds {expected}-dim vectors, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
}

/// Point-in-time copy of the gallery used to build a search index.
pub type Snapshot = Vec<(String, Embedding)>;

/// Bulk source of gallery entries (durable backup, remote fetch result).
pub trait GallerySource {
    type Error;
    fn read_entries(&self) -> Result<Vec<(String, IdentityRecord)>, Self::Error>;
}

/// Bulk sink for a full gallery dump.
pub trait GallerySink {
    type Error;
    fn write_entries(&self, entries: &[(String, IdentityRecord)]) -> Result<(), Self::Error>;
}

#[derive(Debug, Default, Clone)]
struct GalleryState {
    entries: Vec<(String, IdentityRecord)>,
    positions: HashMap<String, usize>,
}

impl GalleryState {
    fn dim(&self) -> Option<usize> {
        self.entries.first().map(|(_, r)| r.embedding.dim())
    }

    fn check(&self, embedding: &Embedding) -> Result<(), GalleryError> {
        if embedding.dim() == 0 {
            return Err(GalleryError::EmptyEmbedding);
        }
        match self.dim() {
            Some(expected) if expected != embedding.dim() => Err(GalleryError::DimensionMismatch {
                expected,
                got: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }

    fn upsert(&mut self, key: String, record: IdentityRecord) {
        match self.positions.get(&key) {
            Some(&pos) => self.entries[pos].1 = record,
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, record));
            }
        }
    }

    fn reindex(&mut self) {
        self.positions = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.clone(), i))
            .collect();
    }
}

/// Thread-safe identity gallery.
///
/// Writers hold the lock only for the in-memory update; readers copy out
/// what they need, so a snapshot is never invalidated by a later insert.
/// Mutation is crate-private: outside callers go through
/// [`IdentityCatalog`](crate::IdentityCatalog), which rebuilds the index.
#[derive(Debug, Default)]
pub struct IdentityGallery {
    state: RwLock<GalleryState>,
}

impl IdentityGallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record stored at `key`.
    pub(crate) fn insert(
        &self,
        key: &str,
        id_real: &str,
        full_name: &str,
        embedding: Embedding,
    ) -> Result<(), GalleryError> {
        let mut state = self.state.write().unwrap();
        state.check(&embedding)?;
        state.upsert(
            key.to_string(),
            IdentityRecord::new(id_real, full_name, embedding),
        );
        Ok(())
    }

    /// Remove every record (all pose variants) belonging to `id_real`.
    pub(crate) fn delete_by_id(&self, id_real: &str) -> usize {
        let mut state = self.state.write().unwrap();
        let before = state.entries.len();
        state.entries.retain(|(_, r)| r.id_real != id_real);
        let removed = before - state.entries.len();
        if removed > 0 {
            state.reindex();
        }
        removed
    }

    /// Replace the whole gallery. Records that are empty or disagree with
    /// the dimensionality of the first accepted record are skipped.
    ///
    /// Returns the number of records accepted.
    pub(crate) fn load<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, IdentityRecord)>,
    {
        let mut fresh = GalleryState::default();
        for (key, record) in entries {
            if let Err(e) = fresh.check(&record.embedding) {
                tracing::warn!(key = %key, error = %e, "skipping gallery record");
                continue;
            }
            fresh.upsert(key, record);
        }
        let count = fresh.entries.len();
        *self.state.write().unwrap() = fresh;
        count
    }

    /// Dump the whole gallery into a durable sink.
    pub fn persist_to<S: GallerySink>(&self, sink: &S) -> Result<(), S::Error> {
        sink.write_entries(&self.entries())
    }

    /// Ordered `(key, embedding)` copy for index building.
    pub fn snapshot(&self) -> Snapshot {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .map(|(k, r)| (k.clone(), r.embedding.clone()))
            .collect()
    }

    /// Ordered copy of every record.
    pub fn entries(&self) -> Vec<(String, IdentityRecord)> {
        self.state.read().unwrap().entries.clone()
    }

    pub fn get(&self, key: &str) -> Option<IdentityRecord> {
        let state = self.state.read().unwrap();
        state.positions.get(key).map(|&pos| state.entries[pos].1.clone())
    }

    pub fn contains_id(&self, id_real: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .any(|(_, r)| r.id_real == id_real)
    }

    /// Distinct `id_real` values currently enrolled.
    pub fn ids(&self) -> HashSet<String> {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .map(|(_, r)| r.id_real.clone())
            .collect()
    }

    /// Embedding dimensionality, `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.state.read().unwrap().dim()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
