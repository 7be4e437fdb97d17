use facegate_core::{IndexKind, LivenessMode};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Base URL of the remote gallery store (`/api/faces`).
    pub remote_url: String,
    /// Path to the SQLite gallery backup.
    pub backup_path: PathBuf,
    /// Cosine similarity threshold for live recognition.
    pub recognition_threshold: f32,
    /// Stricter threshold used for enrollment-side matching.
    pub enroll_threshold: f32,
    /// Liveness acceptance rule.
    pub liveness_mode: LivenessMode,
    /// Search strategy built over the gallery.
    pub index_kind: IndexKind,
    /// How long a successful remote load is reused before fetching again.
    pub cache_ttl: Duration,
    /// Upper bound for each remote call.
    pub remote_timeout: Duration,
    /// Capacity of the remote sync queue.
    pub sync_queue: usize,
    /// Attendance API endpoint; `None` disables delivery.
    pub attendance_url: Option<String>,
    /// Capacity of the attendance queue (oldest events are dropped when full).
    pub attendance_queue: usize,
    /// Delivery attempts per attendance event.
    pub attendance_retries: usize,
    /// Pause between attendance delivery attempts.
    pub attendance_retry_interval: Duration,
    /// Minimum gap between two attendance events for the same `id_real`.
    pub attendance_cooldown: Duration,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let backup_path = std::env::var("FACEGATE_BACKUP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gallery.db"));

        let spoof_threshold = env_f32("FACEGATE_SPOOF_THRESHOLD", 0.6);
        let liveness_mode = std::env::var("FACEGATE_LIVENESS_MODE")
            .ok()
            .and_then(|v| match LivenessMode::parse(&v, spoof_threshold) {
                Ok(mode) => Some(mode),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring FACEGATE_LIVENESS_MODE");
                    None
                }
            })
            .unwrap_or(LivenessMode::Strict { spoof_threshold });

        let index_kind = std::env::var("FACEGATE_INDEX")
            .ok()
            .and_then(|v| match v.parse::<IndexKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring FACEGATE_INDEX");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            remote_url: std::env::var("FACEGATE_REMOTE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000/api/faces".to_string()),
            backup_path,
            recognition_threshold: env_f32("FACEGATE_RECOGNITION_THRESHOLD", 0.65),
            enroll_threshold: env_f32("FACEGATE_ENROLL_THRESHOLD", 0.68),
            liveness_mode,
            index_kind,
            cache_ttl: Duration::from_secs(env_u64("FACEGATE_CACHE_TTL_SECS", 300)),
            remote_timeout: Duration::from_secs(env_u64("FACEGATE_REMOTE_TIMEOUT_SECS", 10)),
            sync_queue: env_usize("FACEGATE_SYNC_QUEUE", 32).max(1),
            attendance_url: std::env::var("FACEGATE_ATTENDANCE_URL")
                .ok()
                .filter(|v| !v.is_empty()),
            attendance_queue: env_usize("FACEGATE_ATTENDANCE_QUEUE", 64).max(1),
            attendance_retries: env_usize("FACEGATE_ATTENDANCE_RETRIES", 1).max(1),
            attendance_retry_interval: Duration::from_secs(env_u64("FACEGATE_ATTENDANCE_RETRY_SECS", 5)),
            attendance_cooldown: Duration::from_secs(env_u64("FACEGATE_ATTENDANCE_COOLDOWN_SECS", 10)),
            system_bus: std::env::var("FACEGATE_SYSTEM_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
