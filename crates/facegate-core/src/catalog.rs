//! Gallery plus its published search index, kept consistent on write.
//!
//! Every mutation rebuilds the index from a fresh snapshot and publishes it
//! before returning. Mutations are serialized by a writer lock so the
//! published index always matches the latest completed mutation; queries
//! never take that lock.

use crate::gallery::{GalleryError, GallerySource, IdentityGallery};
use crate::index::{IndexKind, SharedIndex, SimilaritySearchIndex};
use crate::types::{Embedding, IdentityRecord, MatchResult};
use std::sync::{Arc, Mutex};

pub struct IdentityCatalog {
    gallery: IdentityGallery,
    index: SharedIndex,
    writer: Mutex<()>,
}

impl IdentityCatalog {
    pub fn new(kind: IndexKind) -> Self {
        Self {
            gallery: IdentityGallery::new(),
            index: SharedIndex::new(kind),
            writer: Mutex::new(()),
        }
    }

    /// Read-only view of the gallery.
    ///
    /// Writes only go through the catalog, so the index never lags:
    ///
    /// ```compile_fail
    /// use facegate_core::{Embedding, IdentityCatalog, IndexKind};
    ///
    /// let catalog = IdentityCatalog::new(IndexKind::Linear);
    /// catalog
    ///     .gallery()
    ///     .insert("1_A", "1", "A", Embedding::new(vec![1.0, 0.0]))
    ///     .unwrap();
    /// ```
    pub fn gallery(&self) -> &IdentityGallery {
        &self.gallery
    }

    pub fn index_kind(&self) -> IndexKind {
        self.index.kind()
    }

    /// Currently published index; hold it for a whole frame to get a
    /// consistent view across several faces.
    pub fn index(&self) -> Arc<dyn SimilaritySearchIndex> {
        self.index.current()
    }

    pub fn query(&self, target: &Embedding, threshold: f32) -> MatchResult {
        self.index.query(target, threshold)
    }

    pub fn insert(
        &self,
        key: &str,
        id_real: &str,
        full_name: &str,
        embedding: Embedding,
    ) -> Result<(), GalleryError> {
        let _writer = self.writer.lock().unwrap();
        self.gallery.insert(key, id_real, full_name, embedding)?;
        self.index.rebuild(self.gallery.snapshot());
        tracing::debug!(key, entries = self.gallery.len(), "gallery insert published");
        Ok(())
    }

    /// Remove all keys of `id_real`; the index is rebuilt only if anything changed.
    pub fn delete_by_id(&self, id_real: &str) -> usize {
        let _writer = self.writer.lock().unwrap();
        let removed = self.gallery.delete_by_id(id_real);
        if removed > 0 {
            self.index.rebuild(self.gallery.snapshot());
        }
        tracing::debug!(id_real, removed, "gallery delete published");
        removed
    }

    /// Replace the whole gallery and publish the matching index.
    pub fn load<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, IdentityRecord)>,
    {
        let _writer = self.writer.lock().unwrap();
        let count = self.gallery.load(entries);
        self.index.rebuild(self.gallery.snapshot());
        count
    }

    /// Bulk-load from a durable source; the source is read before the
    /// writer lock is taken.
    pub fn load_from<S: GallerySource>(&self, source: &S) -> Result<usize, S::Error> {
        let entries = source.read_entries()?;
        Ok(self.load(entries))
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }
}
