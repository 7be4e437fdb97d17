use anyhow::{Context, Result};
use facegate_core::{IdentityCatalog, MatchDecisionPolicy};
use facegated::attendance::{spawn_attendance_worker, AttendanceQueue, HttpAttendanceSink};
use facegated::backup::SqliteBackup;
use facegated::dbus_interface::{GalleryInterface, BUS_NAME, OBJECT_PATH};
use facegated::remote::HttpRemoteStore;
use facegated::sync::spawn_sync_worker;
use facegated::{Config, GalleryService};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env();
    tracing::info!(
        remote = %config.remote_url,
        backup = %config.backup_path.display(),
        index = %config.index_kind,
        threshold = config.recognition_threshold,
        "configuration loaded"
    );

    let backup = Arc::new(
        SqliteBackup::open_or_in_memory(&config.backup_path).context("opening in-memory backup")?,
    );
    let remote = HttpRemoteStore::new(&config.remote_url, config.remote_timeout)
        .context("building remote store client")?;
    let sync = spawn_sync_worker(Arc::new(remote), config.sync_queue, config.remote_timeout);

    let catalog = Arc::new(IdentityCatalog::new(config.index_kind));
    let service = Arc::new(GalleryService::new(
        catalog,
        backup,
        sync,
        config.cache_ttl,
        config.enroll_threshold,
    ));

    let outcome = service.load().await;
    tracing::info!(?outcome, identities = service.catalog().len(), "gallery ready");

    let attendance = match &config.attendance_url {
        Some(url) => {
            let queue = Arc::new(AttendanceQueue::new(config.attendance_queue, config.attendance_cooldown));
            let sink = HttpAttendanceSink::new(url.as_str(), config.remote_timeout)
                .context("building attendance client")?;
            let worker = spawn_attendance_worker(
                Arc::clone(&queue),
                Arc::new(sink),
                config.attendance_retries,
                config.attendance_retry_interval,
            );
            Some((queue, worker))
        }
        None => {
            tracing::info!("attendance delivery disabled");
            None
        }
    };

    let iface = GalleryInterface::new(
        Arc::clone(&service),
        MatchDecisionPolicy::new(config.liveness_mode),
        config.recognition_threshold,
        attendance.as_ref().map(|(queue, _)| Arc::clone(queue)),
    );

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    if let Some((queue, worker)) = attendance {
        queue.close();
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "attendance worker did not exit cleanly");
        }
    }

    Ok(())
}
