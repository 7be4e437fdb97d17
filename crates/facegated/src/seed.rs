//! Directory-seeded enrollment.
//!
//! Image files named `{id}_{name}.{jpg,jpeg,png}` are enrollment requests.
//! Files are visited in sorted name order; each id is enrolled at most once
//! per run and ids already in the gallery are left alone.

use crate::service::GalleryService;
use facegate_core::FacePipeline;
use image::DynamicImage;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeedReport {
    /// Keys enrolled this run (base keys and pose variants).
    pub enrolled: Vec<String>,
    /// File names that were looked at but not enrolled.
    pub skipped: Vec<String>,
}

/// Split `"{id}_{name}"` on the first `_`; the id must be alphanumeric.
pub fn parse_enrollment_name(stem: &str) -> Option<(&str, &str)> {
    let (id, name) = stem.split_once('_')?;
    if id.is_empty() || !id.chars().all(char::is_alphanumeric) {
        return None;
    }
    Some((id, name))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Image files directly under `dir`, sorted by path.
fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Decode `path` on the blocking pool.
async fn load_image(path: PathBuf) -> Result<DynamicImage, String> {
    match tokio::task::spawn_blocking(move || image::open(path)).await {
        Ok(Ok(image)) => Ok(image),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Enroll every unseen id found in `dir`. Per-file failures are skipped.
pub async fn seed_from_directory(
    service: &GalleryService,
    pipeline: &mut FacePipeline,
    dir: &Path,
    augment: bool,
) -> std::io::Result<SeedReport> {
    let listed = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || list_images(&listed))
        .await
        .map_err(std::io::Error::other)??;

    let existing = service.catalog().gallery().ids();
    let mut processed: HashSet<String> = HashSet::new();
    let mut report = SeedReport::default();

    tracing::info!(dir = %dir.display(), files = files.len(), known = existing.len(), "seeding gallery from directory");

    for path in files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some((id_real, full_name)) = parse_enrollment_name(&stem) else {
            tracing::warn!(file = %file_name, "name is not {{id}}_{{name}}, skipping");
            report.skipped.push(file_name);
            continue;
        };

        if processed.contains(id_real) {
            tracing::debug!(file = %file_name, id_real, "id already processed this run");
            report.skipped.push(file_name);
            continue;
        }
        if existing.contains(id_real) {
            tracing::debug!(file = %file_name, id_real, "id already in gallery");
            processed.insert(id_real.to_string());
            report.skipped.push(file_name);
            continue;
        }

        let image = match load_image(path).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "unreadable image");
                report.skipped.push(file_name);
                continue;
            }
        };

        match service
            .enroll_image(pipeline, &image, id_real, full_name, augment)
            .await
        {
            Ok(result) => {
                if !result.base.remote_synced {
                    tracing::warn!(key = %result.base.key, "{}", result.base.describe());
                }
                processed.insert(id_real.to_string());
                report.enrolled.push(result.base.key);
                report
                    .enrolled
                    .extend(result.variants.into_iter().map(|v| v.key));
            }
            Err(e) => {
                tracing::warn!(file = %file_name, error = %e, "enrollment failed");
                report.skipped.push(file_name);
            }
        }
    }

    tracing::info!(
        enrolled = report.enrolled.len(),
        skipped = report.skipped.len(),
        "directory seeding finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SqliteBackup;
    use crate::sync::spawn_sync_worker;
    use crate::sync::tests::FakeRemote;
    use facegate_core::pipeline::{FaceAligner, FaceDetector, FaceEmbedder, FaceNormalizer, NormalizedFace};
    use facegate_core::types::Landmarks;
    use facegate_core::{BoundingBox, Embedding, IdentityCatalog, IndexKind, PipelineError};
    use image::{DynamicImage, GenericImageView, GrayImage, Luma};
    use std::sync::Arc;
    use std::time::Duration;

    /// One box covering the whole image.
    struct WholeImageDetector;

    impl FaceDetector for WholeImageDetector {
        fn detect(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, PipelineError> {
            let (w, h) = image.dimensions();
            Ok(vec![BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: w as f32,
                y2: h as f32,
                score: 0.9,
            }])
        }
    }

    struct PassAligner;

    impl FaceAligner for PassAligner {
        fn landmarks(&mut self, _face: &DynamicImage) -> Option<Landmarks> {
            Some([(0.0, 0.0); 5])
        }

        fn align(&mut self, face: &DynamicImage, _landmarks: &Landmarks) -> Option<DynamicImage> {
            Some(face.clone())
        }
    }

    struct LumaNormalizer;

    impl FaceNormalizer for LumaNormalizer {
        fn normalize(&mut self, aligned: &DynamicImage) -> Result<NormalizedFace, PipelineError> {
            let g = aligned.to_luma8();
            Ok(NormalizedFace {
                width: g.width(),
                height: g.height(),
                channels: 1,
                data: g.pixels().map(|p| p.0[0] as f32 / 255.0).collect(),
            })
        }
    }

    struct MeanEmbedder;

    impl FaceEmbedder for MeanEmbedder {
        fn embed(&mut self, face: &NormalizedFace) -> Result<Embedding, PipelineError> {
            let mean = face.data.iter().sum::<f32>() / face.data.len().max(1) as f32;
            Ok(Embedding::new(vec![mean, 1.0 - mean, 0.5]))
        }
    }

    fn pipeline() -> FacePipeline {
        FacePipeline::new(
            Box::new(WholeImageDetector),
            Box::new(PassAligner),
            Box::new(LumaNormalizer),
            Box::new(MeanEmbedder),
        )
    }

    fn service() -> GalleryService {
        GalleryService::new(
            Arc::new(IdentityCatalog::new(IndexKind::Linear)),
            Arc::new(SqliteBackup::open_in_memory().unwrap()),
            spawn_sync_worker(Arc::new(FakeRemote::default()), 8, Duration::from_secs(1)),
            Duration::from_secs(300),
            0.68,
        )
    }

    fn write_face(dir: &Path, name: &str, level: u8) {
        GrayImage::from_pixel(40, 40, Luma([level]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_parse_enrollment_name() {
        assert_eq!(parse_enrollment_name("7_Bob"), Some(("7", "Bob")));
        assert_eq!(parse_enrollment_name("12_Mary_Ann"), Some(("12", "Mary_Ann")));
        assert_eq!(parse_enrollment_name("A1_Nhì"), Some(("A1", "Nhì")));
        assert_eq!(parse_enrollment_name("bob"), None);
        assert_eq!(parse_enrollment_name("x-1_Bob"), None);
        assert_eq!(parse_enrollment_name("_Bob"), None);
    }

    #[test]
    fn test_list_images_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "2_Bob.PNG", 10);
        write_face(dir.path(), "1_Amy.jpg", 10);
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("3_Dir.png")).unwrap();

        let names: Vec<_> = list_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["1_Amy.jpg", "2_Bob.PNG"]);
    }

    #[tokio::test]
    async fn test_same_id_enrolled_once() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "7_Bob.jpg", 60);
        write_face(dir.path(), "7_Robert.png", 180);

        let svc = service();
        let report = seed_from_directory(&svc, &mut pipeline(), dir.path(), false)
            .await
            .unwrap();

        assert_eq!(report.enrolled, vec!["7_Bob".to_string()]);
        assert_eq!(report.skipped, vec!["7_Robert.png".to_string()]);
        assert_eq!(svc.catalog().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_files_do_not_abort_run() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "badname.png", 100);
        write_face(dir.path(), "x-1_Foo.png", 100);
        std::fs::write(dir.path().join("8_Broken.png"), b"not an image").unwrap();
        write_face(dir.path(), "8_Carl.png", 90);
        std::fs::write(dir.path().join("notes.txt"), b"9_Text").unwrap();

        let svc = service();
        let report = seed_from_directory(&svc, &mut pipeline(), dir.path(), false)
            .await
            .unwrap();

        // An unreadable file does not claim its id.
        assert_eq!(report.enrolled, vec!["8_Carl".to_string()]);
        assert_eq!(report.skipped.len(), 3);
    }

    #[tokio::test]
    async fn test_existing_ids_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "1_Ann.png", 30);
        write_face(dir.path(), "2_Ben.png", 200);

        let svc = service();
        svc.enroll("1", "Ann", Embedding::new(vec![0.0, 1.0, 0.0]))
            .await
            .unwrap();

        let report = seed_from_directory(&svc, &mut pipeline(), dir.path(), false)
            .await
            .unwrap();
        assert_eq!(report.enrolled, vec!["2_Ben".to_string()]);
        assert_eq!(
            svc.catalog().gallery().get("1_Ann").unwrap().embedding.values,
            vec![0.0, 1.0, 0.0]
        );
    }

    #[tokio::test]
    async fn test_augmented_seeding_adds_pose_keys() {
        let dir = tempfile::tempdir().unwrap();
        let img = GrayImage::from_pixel(100, 100, Luma([120]));
        img.save(dir.path().join("3_Cy.png")).unwrap();

        // Face box in the middle so both shifted windows fit.
        struct CenterDetector;
        impl FaceDetector for CenterDetector {
            fn detect(&mut self, _image: &DynamicImage) -> Result<Vec<BoundingBox>, PipelineError> {
                Ok(vec![BoundingBox {
                    x1: 30.0,
                    y1: 30.0,
                    x2: 70.0,
                    y2: 70.0,
                    score: 0.9,
                }])
            }
        }
        let mut p = FacePipeline::new(
            Box::new(CenterDetector),
            Box::new(PassAligner),
            Box::new(LumaNormalizer),
            Box::new(MeanEmbedder),
        );

        let svc = service();
        let report = seed_from_directory(&svc, &mut p, dir.path(), true).await.unwrap();
        assert_eq!(
            report.enrolled,
            vec!["3_Cy".to_string(), "3_Cy_down".to_string(), "3_Cy_up".to_string()]
        );
        assert_eq!(svc.catalog().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let svc = service();
        let missing = Path::new("/nonexistent/facegate/seed");
        assert!(seed_from_directory(&svc, &mut pipeline(), missing, false).await.is_err());
    }
}
