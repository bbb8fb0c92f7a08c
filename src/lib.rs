//! PeekGuard: screen-peek detection and alerting service
//!
//! Samples an injectable sensing source on a fixed cadence per subject,
//! scores each sample against configurable thresholds, raises rate-limited
//! multi-channel alerts, and keeps a bounded, queryable history.
//!
//! # Features
//!
//! - **Per-subject scheduling**: one detection loop per subject, with
//!   overrun skipping, sampling timeouts and degraded-state reporting
//! - **Multi-channel alerts**: visual, audio, haptic and webhook
//!   notification channels behind the [`alerts::AlertSink`] seam
//! - **Rate limiting**: fixed windows plus cooldowns per (subject, channel)
//! - **Bounded history**: newest-first sample and alert logs with paging,
//!   filters, read state and cached statistics
//! - **Live subscriptions**: ordered push events per subject
//! - **Persistence**: per-subject JSON keys with export/import
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peekguard::alerts::Notifier;
//! use peekguard::control::{DetectionService, ServiceOptions};
//! use peekguard::detection::SimulatedSampler;
//! use peekguard::storage::SnapshotManager;
//!
//! # async fn run() -> Result<(), peekguard::control::ServiceError> {
//! let service = DetectionService::new(
//!     Arc::new(SimulatedSampler::new(0.2)),
//!     Arc::new(Notifier::new()),
//!     Arc::new(SnapshotManager::in_memory()),
//!     ServiceOptions::default(),
//! );
//!
//! let mut events = service.subscribe("alice")?;
//! service.start("alice", None).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}: {:?}", event.kind(), event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod api;
pub mod config;
pub mod control;
pub mod detection;
pub mod history;
pub mod settings;
pub mod storage;

// Re-export commonly used types
pub use alerts::{AlertEvent, AlertLevel, Channel};
pub use config::{ConfigPatch, DetectionConfig};
pub use control::{DetectionService, PushEvent, ServiceError};
pub use detection::{Sample, SampleOutcome, Sampler};
