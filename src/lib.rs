//! Slide scheduling and playback synchronization for unattended signage boards.
//!
//! The [`engine::Engine`] owns a [`scheduler::SlideScheduler`] and drives it from a
//! single tokio task. Items come from an [`provider::ItemProvider`] (CouchDB in the
//! binary) and are materialized by a [`media_manager::MediaBackend`].

pub mod config;
pub mod couchdb_client;
pub mod diagnostics;
pub mod engine;
pub mod errors;
pub mod media_manager;
pub mod media_pipeline;
pub mod model;
pub mod playback;
pub mod playlist;
pub mod provider;
pub mod scheduler;
pub mod timers;
pub mod updates;
pub mod watchdog;
