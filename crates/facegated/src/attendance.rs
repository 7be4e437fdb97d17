//! Attendance delivery.
//!
//! Accepted recognitions become [`AttendanceEvent`]s on a bounded queue.
//! An identity is marked at most once per cooldown window, so a person
//! standing in front of the camera yields one event, not one per frame.
//! Pushing never blocks: when the queue is full the oldest event is dropped.
//! One owned worker task drains the queue and posts events to the attendance API.

use crate::remote::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use facegate_core::{IdentityGallery, RecognitionOutcome};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub id_real: String,
    pub name: String,
    pub time: DateTime<Local>,
}

impl AttendanceEvent {
    /// Event for an outcome that was recognized and passed liveness.
    pub fn from_outcome(outcome: &RecognitionOutcome, gallery: &IdentityGallery) -> Option<Self> {
        if !outcome.is_accepted() {
            return None;
        }
        let key = outcome.identity_key.as_deref()?;
        let record = gallery.get(key)?;
        Some(Self {
            id_real: record.id_real,
            name: record.full_name,
            time: Local::now(),
        })
    }
}

struct QueueState {
    events: VecDeque<AttendanceEvent>,
    closed: bool,
}

/// Bounded drop-oldest queue feeding the attendance worker.
pub struct AttendanceQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    cooldown: Duration,
    last_marked: Mutex<HashMap<String, Instant>>,
}

impl AttendanceQueue {
    /// `cooldown` is the minimum gap between two events for the same `id_real`.
    pub fn new(capacity: usize, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            cooldown,
            last_marked: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `event`. Returns `false` if an older event was dropped to make room.
    pub fn try_push(&self, event: AttendanceEvent) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        let mut kept_all = true;
        if state.events.len() >= self.capacity {
            if let Some(old) = state.events.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(id_real = %old.id_real, "attendance queue full, dropped oldest event");
            }
            kept_all = false;
        }
        state.events.push_back(event);
        drop(state);
        self.notify.notify_one();
        kept_all
    }

    /// Queue an event for `outcome` if it is accepted and its identity is
    /// outside the cooldown window. Returns whether one was queued.
    pub fn record_outcome(&self, outcome: &RecognitionOutcome, gallery: &IdentityGallery) -> bool {
        let Some(event) = AttendanceEvent::from_outcome(outcome, gallery) else {
            return false;
        };
        if !self.start_cooldown(&event.id_real) {
            tracing::trace!(id_real = %event.id_real, "attendance cooldown active");
            return false;
        }
        tracing::debug!(id_real = %event.id_real, "attendance queued");
        self.try_push(event);
        true
    }

    /// Claim the cooldown slot for `id_real`; `false` while it is still running.
    fn start_cooldown(&self, id_real: &str) -> bool {
        let now = Instant::now();
        let mut last_marked = self.last_marked.lock().unwrap();
        match last_marked.get(id_real) {
            Some(at) if now.duration_since(*at) < self.cooldown => false,
            _ => {
                last_marked.insert(id_real.to_string(), now);
                true
            }
        }
    }

    /// Next event; `None` once closed and drained.
    pub async fn pop(&self) -> Option<AttendanceEvent> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting events; the worker exits after draining.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
pub trait AttendanceSink: Send + Sync {
    async fn send(&self, event: &AttendanceEvent) -> Result<(), RemoteError>;
}

/// Posts `{"id_real","name","time"}` to the attendance API.
pub struct HttpAttendanceSink {
    client: Client,
    url: String,
}

impl HttpAttendanceSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AttendanceSink for HttpAttendanceSink {
    async fn send(&self, event: &AttendanceEvent) -> Result<(), RemoteError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(RemoteError::Status(status.as_u16())),
        }
    }
}

/// Spawn the delivery worker. Each event gets up to `attempts` tries,
/// `retry_interval` apart; undeliverable events are logged and discarded.
pub fn spawn_attendance_worker(
    queue: Arc<AttendanceQueue>,
    sink: Arc<dyn AttendanceSink>,
    attempts: usize,
    retry_interval: Duration,
) -> JoinHandle<()> {
    let attempts = attempts.max(1);
    tokio::spawn(async move {
        tracing::info!(attempts, "attendance worker started");
        while let Some(event) = queue.pop().await {
            for attempt in 1..=attempts {
                match sink.send(&event).await {
                    Ok(()) => {
                        tracing::info!(id_real = %event.id_real, name = %event.name, "attendance recorded");
                        break;
                    }
                    Err(e) if attempt < attempts => {
                        tracing::warn!(id_real = %event.id_real, attempt, error = %e, "attendance delivery failed, retrying");
                        tokio::time::sleep(retry_interval).await;
                    }
                    Err(e) => {
                        tracing::error!(id_real = %event.id_real, attempts, error = %e, "attendance not delivered");
                    }
                }
            }
        }
        tracing::info!("attendance worker exiting");
    })
}
