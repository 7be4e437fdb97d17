//! Gallery mutation protocol: enroll, delete and load with fallbacks.
//!
//! Local state always wins. The catalog is updated first and the backup is
//! written after every mutation whether or not the remote store accepted it;
//! a remote failure is reported, never rolled back.

use crate::backup::{BackupError, SqliteBackup};
use crate::sync::SyncHandle;
use facegate_core::{
    identity_key, Embedding, FacePipeline, GalleryError, IdentityCatalog, IdentityRecord, PipelineError, Pose,
};
use image::DynamicImage;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Where the gallery came from on the last [`GalleryService::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "records", rename_all = "lowercase")]
pub enum LoadOutcome {
    /// Remote load still fresh; nothing fetched.
    Cached,
    Remote(usize),
    Backup(usize),
    /// Neither remote nor backup could be read; gallery left as it was.
    Unavailable,
}

impl LoadOutcome {
    pub fn records(&self) -> Option<usize> {
        match self {
            LoadOutcome::Remote(n) | LoadOutcome::Backup(n) => Some(*n),
            LoadOutcome::Cached | LoadOutcome::Unavailable => None,
        }
    }
}

/// Result of one enrollment, keeping local and remote outcomes apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollReport {
    pub key: String,
    pub remote_synced: bool,
    pub backup_written: bool,
    /// Key of another identity this embedding already matches, if any.
    pub similar_to: Option<String>,
}

impl EnrollReport {
    /// Operator-facing summary.
    pub fn describe(&self) -> String {
        match (self.remote_synced, self.backup_written) {
            (true, true) => format!("{} added", self.key),
            (false, true) => format!("{} added locally but remote sync failed", self.key),
            (true, false) => format!("{} added but local backup failed", self.key),
            (false, false) => format!("{} added in memory only", self.key),
        }
    }
}

/// Base enrollment plus any pose-augmented variants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageEnrollReport {
    pub base: EnrollReport,
    pub variants: Vec<EnrollReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub id_real: String,
    pub removed: usize,
    pub remote_synced: bool,
    pub backup_written: bool,
}

pub struct GalleryService {
    catalog: Arc<IdentityCatalog>,
    backup: Arc<SqliteBackup>,
    remote: SyncHandle,
    cache_ttl: Duration,
    enroll_threshold: f32,
    remote_loaded_at: Mutex<Option<Instant>>,
}

impl GalleryService {
    pub fn new(
        catalog: Arc<IdentityCatalog>,
        backup: Arc<SqliteBackup>,
        remote: SyncHandle,
        cache_ttl: Duration,
        enroll_threshold: f32,
    ) -> Self {
        Self {
            catalog,
            backup,
            remote,
            cache_ttl,
            enroll_threshold,
            remote_loaded_at: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &Arc<IdentityCatalog> {
        &self.catalog
    }

    /// Seconds since the last successful remote load.
    pub fn remote_age(&self) -> Option<u64> {
        self.remote_loaded_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed().as_secs())
    }

    fn is_fresh(&self) -> bool {
        let loaded_at = *self.remote_loaded_at.lock().unwrap();
        matches!(loaded_at, Some(at) if at.elapsed() < self.cache_ttl) && !self.catalog.is_empty()
    }

    /// Load the gallery: remote store first, then the local backup.
    pub async fn load(&self) -> LoadOutcome {
        if self.is_fresh() {
            tracing::debug!(entries = self.catalog.len(), "using cached gallery");
            return LoadOutcome::Cached;
        }
        self.reload().await
    }

    /// Like [`load`](Self::load) but ignores the freshness window.
    pub async fn reload(&self) -> LoadOutcome {
        match self.remote.fetch_all().await {
            Ok(entries) => {
                let count = self.catalog.load(entries);
                *self.remote_loaded_at.lock().unwrap() = Some(Instant::now());
                tracing::info!(count, "gallery loaded from remote store");
                return LoadOutcome::Remote(count);
            }
            Err(e) => tracing::warn!(error = %e, "remote load failed, trying local backup"),
        }

        let catalog = Arc::clone(&self.catalog);
        let backup = Arc::clone(&self.backup);
        match tokio::task::spawn_blocking(move || catalog.load_from(backup.as_ref())).await {
            Ok(Ok(count)) => {
                tracing::info!(count, "gallery loaded from local backup");
                LoadOutcome::Backup(count)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, entries = self.catalog.len(), "backup unreadable, keeping current gallery");
                LoadOutcome::Unavailable
            }
            Err(e) => {
                tracing::error!(error = %e, "backup read task failed");
                LoadOutcome::Unavailable
            }
        }
    }

    /// Enroll a precomputed embedding under `"{id_real}_{full_name}"`.
    pub async fn enroll(
        &self,
        id_real: &str,
        full_name: &str,
        embedding: Embedding,
    ) -> Result<EnrollReport, GalleryError> {
        let key = identity_key(id_real, full_name, None);
        let similar_to = self.similar_identity(id_real, &embedding);
        self.catalog.insert(&key, id_real, full_name, embedding.clone())?;

        let remote_synced = match self
            .remote
            .push(IdentityRecord::new(id_real, full_name, embedding))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "enrolled locally, remote sync failed");
                false
            }
        };
        let backup_written = self.write_backup().await;

        tracing::info!(key = %key, remote_synced, backup_written, "identity enrolled");
        Ok(EnrollReport {
            key,
            remote_synced,
            backup_written,
            similar_to,
        })
    }

    /// Enroll one pose-shifted variant of `id_real`.
    pub async fn enroll_augmented(
        &self,
        id_real: &str,
        full_name: &str,
        pose: Pose,
        embedding: Embedding,
    ) -> Result<EnrollReport, GalleryError> {
        let key = identity_key(id_real, full_name, Some(pose.as_str()));
        let display_name = format!("{full_name} ({pose})");
        self.catalog.insert(&key, id_real, &display_name, embedding.clone())?;

        let remote_synced = match self.remote.push_augmentation(id_real, pose, embedding).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "augmentation kept locally, remote sync failed");
                false
            }
        };
        let backup_written = self.write_backup().await;

        Ok(EnrollReport {
            key,
            remote_synced,
            backup_written,
            similar_to: None,
        })
    }

    /// Run the pipeline on an enrollment image and enroll the largest face.
    ///
    /// With `augment`, pose variants are enrolled as well; variant failures
    /// never fail the enrollment.
    pub async fn enroll_image(
        &self,
        pipeline: &mut FacePipeline,
        image: &DynamicImage,
        id_real: &str,
        full_name: &str,
        augment: bool,
    ) -> Result<ImageEnrollReport, ServiceError> {
        let face = pipeline.enrollment_embedding(image)?;
        let variants = if augment {
            pipeline.pose_variants(image, face.region)
        } else {
            Vec::new()
        };

        let base = self.enroll(id_real, full_name, face.embedding).await?;

        let mut reports = Vec::with_capacity(variants.len());
        for (pose, embedding) in variants {
            match self.enroll_augmented(id_real, full_name, pose, embedding).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::debug!(id_real, %pose, error = %e, "pose variant not enrolled"),
            }
        }

        Ok(ImageEnrollReport {
            base,
            variants: reports,
        })
    }

    /// Remove every key of `id_real` locally, then remotely.
    pub async fn delete(&self, id_real: &str) -> DeleteReport {
        let removed = self.catalog.delete_by_id(id_real);

        let remote_synced = match self.remote.delete(id_real).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(id_real, error = %e, "deleted locally, remote delete failed");
                false
            }
        };
        let backup_written = self.write_backup().await;

        tracing::info!(id_real, removed, remote_synced, backup_written, "identity deleted");
        DeleteReport {
            id_real: id_real.to_string(),
            removed,
            remote_synced,
            backup_written,
        }
    }

    /// Another identity already matching `embedding` at the enrollment threshold.
    fn similar_identity(&self, id_real: &str, embedding: &Embedding) -> Option<String> {
        let result = self.catalog.query(embedding, self.enroll_threshold);
        let key = result.key?;
        if self
            .catalog
            .gallery()
            .get(&key)
            .is_some_and(|record| record.id_real != id_real)
        {
            tracing::warn!(id_real, similar_to = %key, score = result.score, "embedding matches another identity");
            Some(key)
        } else {
            None
        }
    }

    /// Dump the current gallery; the snapshot is taken under the backup lock.
    async fn write_backup(&self) -> bool {
        let catalog = Arc::clone(&self.catalog);
        let backup = Arc::clone(&self.backup);
        let result: Result<Result<(), BackupError>, _> =
            tokio::task::spawn_blocking(move || backup.write_gallery(catalog.gallery())).await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "backup write failed");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "backup write task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::spawn_sync_worker;
    use crate::sync::tests::FakeRemote;
    use facegate_core::{GallerySink, GallerySource, IndexKind};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn service_with(remote: Arc<FakeRemote>, backup: Arc<SqliteBackup>, ttl: Duration) -> GalleryService {
        let handle = spawn_sync_worker(remote, 8, Duration::from_secs(1));
        GalleryService::new(
            Arc::new(IdentityCatalog::new(IndexKind::Linear)),
            backup,
            handle,
            ttl,
            0.68,
        )
    }

    fn service(remote: Arc<FakeRemote>) -> GalleryService {
        service_with(
            remote,
            Arc::new(SqliteBackup::open_in_memory().unwrap()),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_enroll_remote_failure_keeps_local_state() {
        let backup = Arc::new(SqliteBackup::open_in_memory().unwrap());
        let svc = service_with(Arc::new(FakeRemote::failing()), backup.clone(), Duration::from_secs(300));

        let report = svc.enroll("1", "Alice", emb(&[0.3, 0.9, 0.1])).await.unwrap();
        assert_eq!(report.key, "1_Alice");
        assert!(!report.remote_synced);
        assert!(report.backup_written);
        assert!(report.describe().contains("remote sync failed"));

        let r = svc.catalog().query(&emb(&[0.3, 0.9, 0.1]), 0.65);
        assert_eq!(r.key.as_deref(), Some("1_Alice"));
        assert_eq!(backup.read_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_success_pushes_and_backs_up() {
        let remote = Arc::new(FakeRemote::default());
        let svc = service(remote.clone());

        let report = svc.enroll("2", "Bob", emb(&[1.0, 0.0])).await.unwrap();
        assert!(report.remote_synced && report.backup_written);
        assert_eq!(remote.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_rejects_dimension_mismatch() {
        let svc = service(Arc::new(FakeRemote::default()));
        svc.enroll("1", "A", emb(&[1.0, 0.0])).await.unwrap();
        assert!(svc.enroll("2", "B", emb(&[1.0, 0.0, 0.0])).await.is_err());
        assert_eq!(svc.catalog().len(), 1);
    }

    #[tokio::test]
    async fn test_enroll_reports_similar_identity() {
        let svc = service(Arc::new(FakeRemote::default()));
        svc.enroll("1", "A", emb(&[1.0, 0.0])).await.unwrap();

        let other = svc.enroll("2", "B", emb(&[0.99, 0.05])).await.unwrap();
        assert_eq!(other.similar_to.as_deref(), Some("1_A"));

        let same = svc.enroll("1", "A", emb(&[0.98, 0.02])).await.unwrap();
        assert_eq!(same.similar_to, None);
    }

    #[tokio::test]
    async fn test_augmented_key_and_display_name() {
        let remote = Arc::new(FakeRemote::default());
        let svc = service(remote.clone());

        let report = svc
            .enroll_augmented("3", "Cat", Pose::Down, emb(&[0.0, 1.0]))
            .await
            .unwrap();
        assert_eq!(report.key, "3_Cat_down");
        let record = svc.catalog().gallery().get("3_Cat_down").unwrap();
        assert_eq!(record.full_name, "Cat (down)");
        assert_eq!(record.id_real, "3");
        assert_eq!(remote.augmentations.lock().unwrap()[0], ("3".to_string(), Pose::Down));
    }

    #[tokio::test]
    async fn test_delete_remote_failure_not_rolled_back() {
        let remote = Arc::new(FakeRemote::default());
        let svc = service(remote.clone());
        svc.enroll("1", "A", emb(&[1.0, 0.0])).await.unwrap();
        svc.enroll_augmented("1", "A", Pose::Up, emb(&[0.9, 0.2])).await.unwrap();
        svc.enroll("2", "B", emb(&[0.0, 1.0])).await.unwrap();

        remote.set_failing(true);
        let report = svc.delete("1").await;
        assert_eq!(report.removed, 2);
        assert!(!report.remote_synced);
        assert!(report.backup_written);
        assert!(!svc.catalog().gallery().contains_id("1"));

        let r = svc.catalog().query(&emb(&[1.0, 0.0]), -1.0);
        assert_eq!(r.key.as_deref(), Some("2_B"));
    }

    #[tokio::test]
    async fn test_load_prefers_remote_then_caches() {
        let remote = Arc::new(FakeRemote::default());
        remote
            .records
            .lock()
            .unwrap()
            .push(("1_A".to_string(), IdentityRecord::new("1", "A", emb(&[1.0, 0.0]))));
        let svc = service(remote.clone());

        assert_eq!(svc.load().await, LoadOutcome::Remote(1));
        assert!(svc.remote_age().is_some());

        remote.set_failing(true);
        assert_eq!(svc.load().await, LoadOutcome::Cached);
        assert_eq!(svc.catalog().len(), 1);
    }

    #[tokio::test]
    async fn test_load_refetches_after_ttl() {
        let remote = Arc::new(FakeRemote::default());
        remote
            .records
            .lock()
            .unwrap()
            .push(("1_A".to_string(), IdentityRecord::new("1", "A", emb(&[1.0, 0.0]))));
        let svc = service_with(
            remote.clone(),
            Arc::new(SqliteBackup::open_in_memory().unwrap()),
            Duration::ZERO,
        );

        assert_eq!(svc.load().await, LoadOutcome::Remote(1));
        assert_eq!(svc.load().await, LoadOutcome::Remote(1));
    }

    #[tokio::test]
    async fn test_load_falls_back_to_backup() {
        let backup = Arc::new(SqliteBackup::open_in_memory().unwrap());
        backup
            .write_entries(&[
                ("1_A".to_string(), IdentityRecord::new("1", "A", emb(&[1.0, 0.0]))),
                ("2_B".to_string(), IdentityRecord::new("2", "B", emb(&[0.0, 1.0]))),
            ])
            .unwrap();
        let svc = service_with(Arc::new(FakeRemote::failing()), backup, Duration::from_secs(300));

        assert_eq!(svc.load().await, LoadOutcome::Backup(2));
        assert_eq!(svc.remote_age(), None);
        let r = svc.catalog().query(&emb(&[0.0, 1.0]), 0.65);
        assert_eq!(r.key.as_deref(), Some("2_B"));
    }

    #[tokio::test]
    async fn test_load_with_nothing_available_starts_empty() {
        let svc = service(Arc::new(FakeRemote::failing()));
        assert_eq!(svc.load().await, LoadOutcome::Backup(0));
        assert!(svc.catalog().is_empty());
        let r = svc.catalog().query(&emb(&[0.0, 0.0]), 0.65);
        assert!(!r.is_match());
    }

    #[tokio::test]
    async fn test_load_with_corrupt_backup_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();
        let backup = Arc::new(SqliteBackup::open_or_in_memory(&path).unwrap());
        let svc = service_with(Arc::new(FakeRemote::failing()), backup, Duration::from_secs(300));

        assert_eq!(svc.load().await, LoadOutcome::Backup(0));
        assert!(svc.catalog().is_empty());

        let report = svc.enroll("1", "A", emb(&[1.0, 0.0])).await.unwrap();
        assert!(report.backup_written);
        assert_eq!(svc.catalog().query(&emb(&[1.0, 0.0]), 0.65).key.as_deref(), Some("1_A"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_enrollments_leave_latest_backup() {
        let backup = Arc::new(SqliteBackup::open_in_memory().unwrap());
        let svc = Arc::new(service_with(
            Arc::new(FakeRemote::default()),
            backup.clone(),
            Duration::from_secs(300),
        ));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    let name = format!("P{i}");
                    svc.enroll(&i.to_string(), &name, emb(&[1.0, i as f32])).await.unwrap()
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().backup_written);
        }

        assert_eq!(backup.read_entries().unwrap(), svc.catalog().gallery().entries());
        assert_eq!(svc.catalog().len(), 16);
    }
}
