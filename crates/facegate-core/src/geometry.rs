//! Face-box geometry: overlap suppression, face selection, and the crop
//! windows used for liveness and pose augmentation.

use crate::types::{BoundingBox, FaceRegion};

/// Liveness crops add this fraction of the face size on each side.
pub const LIVENESS_MARGIN: f32 = 0.1;

/// Pose augmentation shifts the crop window by this fraction of face height.
pub const POSE_SHIFT_RATIO: f32 = 0.15;

/// Synthetic head-tilt variant derived from a base enrollment crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pose {
    /// Crop window moved up, simulating a downward glance.
    Down,
    /// Crop window moved down, simulating an upward glance.
    Up,
}

impl Pose {
    pub const ALL: [Pose; 2] = [Pose::Down, Pose::Up];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pose::Down => "down",
            Pose::Up => "up",
        }
    }
}

impl std::fmt::Display for Pose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute Intersection-over-Union between two bounding boxes.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

/// Greedy overlap suppression.
///
/// Drops boxes scoring below `score_threshold`, then keeps the highest
/// scoring box of every cluster whose IoU exceeds `iou_threshold`.
/// The result is sorted by descending score.
pub fn suppress_overlaps(
    detections: &[BoundingBox],
    score_threshold: f32,
    iou_threshold: f32,
) -> Vec<BoundingBox> {
    let mut candidates: Vec<BoundingBox> = detections
        .iter()
        .filter(|d| d.score >= score_threshold)
        .copied()
        .collect();
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for cand in candidates {
        if keep.iter().all(|k| iou(k, &cand) <= iou_threshold) {
            keep.push(cand);
        }
    }
    keep
}

/// Largest-area box; the first one wins on equal area.
pub fn largest_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().fold(None, |best: Option<&BoundingBox>, f| match best {
        Some(b) if b.area() >= f.area() => Some(b),
        _ => Some(f),
    })
}

/// Truncate a detector box to integer pixels inside a `width × height` image.
///
/// Returns `None` when nothing of the box remains.
pub fn clamp_to_image(bbox: &BoundingBox, width: u32, height: u32) -> Option<FaceRegion> {
    let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max);
    let x1 = clamp(bbox.x1, width);
    let y1 = clamp(bbox.y1, height);
    let x2 = clamp(bbox.x2, width);
    let y2 = clamp(bbox.y2, height);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(FaceRegion {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}

/// Grow a region by `margin` of its size on each side, clamped to the image.
pub fn expand_region(region: &FaceRegion, margin: f32, width: u32, height: u32) -> FaceRegion {
    let mx = (region.width as f32 * margin) as u32;
    let my = (region.height as f32 * margin) as u32;

    let x1 = region.x.saturating_sub(mx);
    let y1 = region.y.saturating_sub(my);
    let x2 = (region.x + region.width + mx).min(width);
    let y2 = (region.y + region.height + my).min(height);

    FaceRegion {
        x: x1,
        y: y1,
        width: x2.saturating_sub(x1),
        height: y2.saturating_sub(y1),
    }
}

/// Vertically shifted crop window for a pose variant.
///
/// `None` when the shifted window would leave the image.
pub fn shifted_region(region: &FaceRegion, pose: Pose, image_height: u32) -> Option<FaceRegion> {
    let shift = (region.height as f32 * POSE_SHIFT_RATIO) as u32;
    let y = match pose {
        Pose::Down => region.y.checked_sub(shift)?,
        Pose::Up => {
            if region.y + region.height + shift >= image_height {
                return None;
            }
            region.y + shift
        }
    };
    Some(FaceRegion { y, ..*region })
}
