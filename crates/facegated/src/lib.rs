//! facegated: gallery daemon for edge face recognition.
//!
//! Hosts the identity catalog, keeps it in sync with the remote gallery
//! store and a local SQLite backup, and serves matching over D-Bus.

pub mod attendance;
pub mod backup;
pub mod config;
pub mod dbus_interface;
pub mod remote;
pub mod seed;
pub mod service;
pub mod sync;

pub use config::Config;
pub use service::{DeleteReport, EnrollReport, GalleryService, LoadOutcome};
