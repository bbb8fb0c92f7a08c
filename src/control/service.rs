//! Detection service: the transport-agnostic control and query surface

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::ServiceError;
use super::events::{EventBus, Subscription};
use crate::alerts::{AlertDispatcher, AlertEvent, AlertSink, RateLimiter};
use crate::config::{ConfigError, ConfigPatch, ConfigStore, DetectionConfig};
use crate::detection::{
    Pipeline, Sample, SampleOutcome, Sampler, SamplingError, SchedulerStatus, SubjectScheduler,
    DEFAULT_DEGRADED_AFTER,
};
use crate::history::{AlertFilter, HistoryStore, Page, PageResult, SubjectStats};
use crate::storage::{SnapshotManager, SubjectSnapshot, SCHEMA_VERSION};

const MAX_SUBJECT_ID_LEN: usize = 64;

/// Service tuning
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub max_samples: usize,
    pub max_alerts: usize,
    pub sample_timeout: Duration,
    pub delivery_timeout: Duration,
    pub degraded_after: u32,
    /// Per-subject push event buffer
    pub event_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_samples: 1000,
            max_alerts: 500,
            sample_timeout: Duration::from_millis(5000),
            delivery_timeout: Duration::from_millis(3000),
            degraded_after: DEFAULT_DEGRADED_AFTER,
            event_capacity: 256,
        }
    }
}

/// Alert counts included in status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total: usize,
    pub unread: usize,
    pub today: usize,
    /// Channel deliveries held back by rate limiting
    pub suppressed: u64,
}

/// Current status of a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionStatus {
    pub subject_id: String,
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
    pub config: DetectionConfig,
    pub alerts: AlertSummary,
    pub last_sample_at: Option<DateTime<Utc>>,
}

/// Commands accepted over any transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    StartDetection {
        #[serde(default)]
        config: Option<ConfigPatch>,
    },
    StopDetection,
    UpdateConfig {
        config: ConfigPatch,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartDetection { .. } => "start_detection",
            Command::StopDetection => "stop_detection",
            Command::UpdateConfig { .. } => "update_config",
        }
    }
}

/// Reply to a [`Command`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub command: String,
    /// False when the command was a no-op (start while running, stop while
    /// stopped)
    pub acknowledged: bool,
    pub status: DetectionStatus,
}

/// Result of running one submitted outcome through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub sample: Sample,
    /// The alert raised for the sample, if any
    pub alert: Option<AlertEvent>,
}

/// Counts installed by an import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub subject_id: String,
    pub samples: usize,
    pub alerts: usize,
}

/// Validate a subject id: 1 to 64 characters of `[A-Za-z0-9_-]`
pub fn validate_subject_id(subject_id: &str) -> Result<(), ServiceError> {
    let valid_chars = subject_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if subject_id.is_empty() || subject_id.len() > MAX_SUBJECT_ID_LEN || !valid_chars {
        return Err(ServiceError::validation(
            "subject_id",
            "must be 1 to 64 characters of [A-Za-z0-9_-]",
        ));
    }
    Ok(())
}

/// Owns every subject's config, history and scheduler
pub struct DetectionService {
    pipeline: Pipeline,
    schedulers: DashMap<String, Arc<SubjectScheduler>>,
}

impl DetectionService {
    pub fn new(
        sampler: Arc<dyn Sampler>,
        sink: Arc<dyn AlertSink>,
        snapshots: Arc<SnapshotManager>,
        options: ServiceOptions,
    ) -> Self {
        let history = Arc::new(HistoryStore::new(options.max_samples, options.max_alerts));
        let events = Arc::new(EventBus::new(options.event_capacity));
        let dispatcher = Arc::new(AlertDispatcher::new(
            Arc::new(RateLimiter::new()),
            sink,
            Arc::clone(&history),
            Arc::clone(&events),
            options.delivery_timeout,
        ));

        Self {
            pipeline: Pipeline {
                sampler,
                configs: Arc::new(ConfigStore::new()),
                history,
                dispatcher,
                events,
                snapshots,
                sample_timeout: options.sample_timeout,
                degraded_after: options.degraded_after.max(1),
            },
            schedulers: DashMap::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The scheduler of a subject, created on first use
    pub fn scheduler(&self, subject_id: &str) -> Result<Arc<SubjectScheduler>, ServiceError> {
        validate_subject_id(subject_id)?;
        if let Some(scheduler) = self.schedulers.get(subject_id) {
            return Ok(Arc::clone(&scheduler));
        }
        let scheduler = self
            .schedulers
            .entry(subject_id.to_string())
            .or_insert_with(|| Arc::new(SubjectScheduler::new(subject_id, self.pipeline.clone())));
        Ok(Arc::clone(&scheduler))
    }

    /// Subjects currently running
    pub fn running_subjects(&self) -> Vec<String> {
        self.schedulers
            .iter()
            .filter(|entry| entry.value().status().running)
            .map(|entry| entry.key().clone())
            .collect()
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Start detection, applying `patch` first. Starting a running subject
    /// only applies the patch.
    pub async fn start(
        &self,
        subject_id: &str,
        patch: Option<ConfigPatch>,
    ) -> Result<DetectionStatus, ServiceError> {
        self.start_inner(subject_id, patch).await?;
        self.status(subject_id)
    }

    async fn start_inner(
        &self,
        subject_id: &str,
        patch: Option<ConfigPatch>,
    ) -> Result<bool, ServiceError> {
        let scheduler = self.scheduler(subject_id)?;
        if let Some(patch) = patch.filter(|p| !p.is_empty()) {
            self.update_config(subject_id, &patch).await?;
        }
        scheduler
            .start()
            .await
            .map_err(|e| ServiceError::PermissionDenied(e.to_string()))
    }

    pub async fn stop(&self, subject_id: &str) -> Result<DetectionStatus, ServiceError> {
        self.scheduler(subject_id)?.stop().await;
        self.status(subject_id)
    }

    /// Validate, persist and commit a partial config update. A running loop
    /// picks up a new interval without a restart.
    pub async fn update_config(
        &self,
        subject_id: &str,
        patch: &ConfigPatch,
    ) -> Result<DetectionConfig, ServiceError> {
        validate_subject_id(subject_id)?;
        let subject = subject_id.to_string();
        let patch = patch.clone();
        let config = self
            .pipeline
            .with_subject_storage(subject_id, move |pipeline| {
                pipeline.configs.update_with(&subject, &patch, |next| {
                    pipeline
                        .snapshots
                        .persist_config(&subject, next)
                        .map_err(|e| ConfigError::Persist(e.to_string()))
                })
            })
            .await??;

        // "Today" depends on the subject's offset
        self.pipeline.history.invalidate_stats(subject_id);
        if let Some(scheduler) = self.schedulers.get(subject_id) {
            scheduler.reschedule();
        }

        tracing::info!(subject_id = %subject_id, "Configuration updated");
        Ok(config)
    }

    /// Run a transport-agnostic command
    pub async fn execute(&self, subject_id: &str, command: Command) -> Result<CommandAck, ServiceError> {
        let name = command.name();
        let acknowledged = match command {
            Command::StartDetection { config } => self.start_inner(subject_id, config).await?,
            Command::StopDetection => self.scheduler(subject_id)?.stop().await,
            Command::UpdateConfig { config } => {
                self.update_config(subject_id, &config).await?;
                true
            }
        };

        Ok(CommandAck {
            command: name.to_string(),
            acknowledged,
            status: self.status(subject_id)?,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn config(&self, subject_id: &str) -> Result<DetectionConfig, ServiceError> {
        validate_subject_id(subject_id)?;
        Ok(self.pipeline.configs.get(subject_id))
    }

    pub fn status(&self, subject_id: &str) -> Result<DetectionStatus, ServiceError> {
        validate_subject_id(subject_id)?;
        let config = self.pipeline.configs.get(subject_id);
        let scheduler = self
            .schedulers
            .get(subject_id)
            .map(|s| s.status())
            .unwrap_or_default();
        let stats = self
            .pipeline
            .history
            .stats(subject_id, config.utc_offset_minutes);

        Ok(DetectionStatus {
            subject_id: subject_id.to_string(),
            scheduler,
            alerts: AlertSummary {
                total: stats.total_alerts,
                unread: stats.unread_alerts,
                today: stats.alerts_today,
                suppressed: self
                    .pipeline
                    .dispatcher
                    .rate_limiter()
                    .suppressed_count(subject_id),
            },
            last_sample_at: self.pipeline.history.last_sample_at(subject_id),
            config,
        })
    }

    pub fn samples(&self, subject_id: &str, page: Page) -> Result<PageResult<Sample>, ServiceError> {
        validate_subject_id(subject_id)?;
        Ok(self.pipeline.history.query_samples(subject_id, page))
    }

    pub fn alerts(
        &self,
        subject_id: &str,
        filter: &AlertFilter,
        page: Page,
    ) -> Result<PageResult<AlertEvent>, ServiceError> {
        validate_subject_id(subject_id)?;
        Ok(self.pipeline.history.query_alerts(subject_id, filter, page))
    }

    pub fn alert(&self, subject_id: &str, alert_id: u64) -> Result<AlertEvent, ServiceError> {
        validate_subject_id(subject_id)?;
        self.pipeline
            .history
            .get_alert(subject_id, alert_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Alert {}", alert_id)))
    }

    /// Mark one alert read. Returns true only if it was unread.
    pub async fn mark_alert_read(&self, subject_id: &str, alert_id: u64) -> Result<bool, ServiceError> {
        validate_subject_id(subject_id)?;
        Ok(self.mark_read_persisted(subject_id, Some(alert_id)).await? > 0)
    }

    /// Mark every alert read. Returns how many changed.
    pub async fn mark_all_read(&self, subject_id: &str) -> Result<usize, ServiceError> {
        validate_subject_id(subject_id)?;
        self.mark_read_persisted(subject_id, None).await
    }

    /// Write the new read state first and apply it in memory only once it
    /// is stored, all under the subject's persistence lock.
    async fn mark_read_persisted(
        &self,
        subject_id: &str,
        alert_id: Option<u64>,
    ) -> Result<usize, ServiceError> {
        let subject = subject_id.to_string();
        let marked = self
            .pipeline
            .with_subject_storage(subject_id, move |pipeline| -> Result<usize, ServiceError> {
                let history = &pipeline.history;
                let now = Utc::now();
                let mut alerts = history.alerts(&subject);
                let ids: Vec<u64> = alerts
                    .iter_mut()
                    .filter(|a| alert_id.map_or(true, |id| a.id == id))
                    .filter_map(|a| a.mark_read(now).then_some(a.id))
                    .collect();
                if ids.is_empty() {
                    return Ok(0);
                }

                pipeline
                    .snapshots
                    .persist_history(&subject, &history.samples(&subject), &alerts, None)?;
                Ok(history.mark_read_at(&subject, &ids, now))
            })
            .await??;

        if marked > 0 {
            tracing::debug!(subject_id = %subject_id, marked, "Alerts marked read");
        }
        Ok(marked)
    }

    /// Remove every alert of a subject. Samples are kept.
    pub async fn clear_history(&self, subject_id: &str) -> Result<usize, ServiceError> {
        validate_subject_id(subject_id)?;
        let subject = subject_id.to_string();
        let cleared = self
            .pipeline
            .with_subject_storage(subject_id, move |pipeline| -> Result<usize, ServiceError> {
                let history = &pipeline.history;
                pipeline
                    .snapshots
                    .persist_history(&subject, &history.samples(&subject), &[], None)?;
                Ok(history.clear_alerts(&subject))
            })
            .await??;

        tracing::info!(subject_id = %subject_id, cleared, "Alert history cleared");
        Ok(cleared)
    }

    /// Run one externally supplied outcome through detection and alerting
    pub async fn process(
        &self,
        subject_id: &str,
        outcome: SampleOutcome,
    ) -> Result<ProcessResult, ServiceError> {
        let scheduler = self.scheduler(subject_id)?;
        let (sample, alert) = scheduler.submit(outcome).await.map_err(|e| match e {
            SamplingError::InvalidOutcome(reason) => ServiceError::validation("outcome", reason),
            other => ServiceError::Internal(other.to_string()),
        })?;
        Ok(ProcessResult { sample, alert })
    }

    pub fn stats(&self, subject_id: &str) -> Result<SubjectStats, ServiceError> {
        validate_subject_id(subject_id)?;
        let offset = self.pipeline.configs.get(subject_id).utc_offset_minutes;
        Ok(self.pipeline.history.stats(subject_id, offset))
    }

    pub fn subscribe(&self, subject_id: &str) -> Result<Subscription, ServiceError> {
        validate_subject_id(subject_id)?;
        Ok(self.pipeline.events.subscribe(subject_id))
    }

    pub fn events(&self) -> &EventBus {
        &self.pipeline.events
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn export(&self, subject_id: &str) -> Result<SubjectSnapshot, ServiceError> {
        validate_subject_id(subject_id)?;
        let history = &self.pipeline.history;
        Ok(SubjectSnapshot::new(
            subject_id,
            self.pipeline.configs.get(subject_id),
            history.samples(subject_id),
            history.alerts(subject_id),
            history.cached_stats(subject_id),
        ))
    }

    /// Replace a subject's config and history with a snapshot.
    ///
    /// Logs are truncated to capacity keeping the newest entries. Nothing is
    /// installed unless the snapshot validates and persists.
    pub async fn import(
        &self,
        subject_id: &str,
        snapshot: SubjectSnapshot,
    ) -> Result<ImportSummary, ServiceError> {
        validate_subject_id(subject_id)?;
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(ServiceError::validation(
                "schema_version",
                format!("unsupported version {}", snapshot.schema_version),
            ));
        }
        if snapshot.subject_id != subject_id {
            return Err(ServiceError::validation(
                "subject_id",
                format!("snapshot belongs to '{}'", snapshot.subject_id),
            ));
        }
        snapshot.config.validate()?;

        let history = &self.pipeline.history;
        let mut samples = snapshot.samples;
        let mut alerts = snapshot.alerts;
        samples.truncate(history.max_samples());
        alerts.truncate(history.max_alerts());

        if let Some(sample) = samples.iter().find(|s| s.subject_id != subject_id) {
            return Err(ServiceError::validation(
                "samples",
                format!("sample {} belongs to '{}'", sample.id, sample.subject_id),
            ));
        }
        if let Some(alert) = alerts.iter().find(|a| a.subject_id != subject_id) {
            return Err(ServiceError::validation(
                "alerts",
                format!("alert {} belongs to '{}'", alert.id, alert.subject_id),
            ));
        }

        let installed = SubjectSnapshot::new(subject_id, snapshot.config, samples, alerts, None);
        let summary = ImportSummary {
            subject_id: subject_id.to_string(),
            samples: installed.samples.len(),
            alerts: installed.alerts.len(),
        };

        self.pipeline
            .with_subject_storage(subject_id, move |pipeline| -> Result<(), ServiceError> {
                pipeline.snapshots.save(&installed)?;
                pipeline
                    .configs
                    .replace(&installed.subject_id, installed.config)?;
                pipeline
                    .history
                    .replace(&installed.subject_id, installed.samples, installed.alerts);
                Ok(())
            })
            .await??;

        if let Some(scheduler) = self.schedulers.get(subject_id) {
            scheduler.reschedule();
        }

        tracing::info!(
            subject_id = %subject_id,
            samples = summary.samples,
            alerts = summary.alerts,
            "Subject imported"
        );
        Ok(summary)
    }

    /// Load every persisted subject. Returns how many were restored.
    pub fn restore(&self) -> Result<usize, ServiceError> {
        let mut restored = 0;

        for subject_id in self.pipeline.snapshots.subjects()? {
            if validate_subject_id(&subject_id).is_err() {
                tracing::warn!(subject_id = %subject_id, "Skipping persisted subject with invalid id");
                continue;
            }
            let snapshot = match self.pipeline.snapshots.load(&subject_id) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(subject_id = %subject_id, error = %e, "Skipping unreadable subject");
                    continue;
                }
            };

            if let Err(e) = self.pipeline.configs.replace(&subject_id, snapshot.config) {
                tracing::warn!(subject_id = %subject_id, error = %e, "Persisted config invalid, using defaults");
            }
            let history = &self.pipeline.history;
            history.replace(&subject_id, snapshot.samples, snapshot.alerts);
            if let Some(stats) = snapshot.stats_cache {
                history.seed_stats(stats);
            }
            restored += 1;
        }

        tracing::info!("Restored {} subjects from storage", restored);
        Ok(restored)
    }

    /// Stop every running subject
    pub async fn shutdown(&self) {
        let schedulers: Vec<Arc<SubjectScheduler>> = self
            .schedulers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for scheduler in schedulers {
            scheduler.stop().await;
        }
        tracing::info!("Detection service shut down");
    }
}
