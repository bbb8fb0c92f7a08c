//! Per-subject detection loop
//!
//! Each running subject owns one task that samples on a fixed cadence,
//! records the sample, dispatches alerts and flushes history. Overdue
//! deadlines are skipped rather than queued, so at most one tick is in
//! flight per subject.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::sample::{Sample, SampleOutcome};
use super::sampler::{CapabilityError, Sampler, SamplingError};
use crate::alerts::{AlertDispatcher, AlertEvent};
use crate::config::{ConfigStore, DetectionConfig};
use crate::control::{ErrorCode, EventBus, PushEvent};
use crate::history::HistoryStore;
use crate::storage::{PersistenceError, SnapshotManager};

/// Consecutive sampling failures before a subject is reported degraded
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

/// Lifecycle of a subject's detection loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Shared collaborators of every subject's loop
#[derive(Clone)]
pub struct Pipeline {
    pub sampler: Arc<dyn Sampler>,
    pub configs: Arc<ConfigStore>,
    pub history: Arc<HistoryStore>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub events: Arc<EventBus>,
    pub snapshots: Arc<SnapshotManager>,
    pub sample_timeout: Duration,
    pub degraded_after: u32,
}

impl Pipeline {
    /// Run `f` on the blocking pool while holding the subject's persistence
    /// lock. Every write of a subject's history goes through here.
    pub async fn with_subject_storage<T, F>(
        &self,
        subject_id: &str,
        f: F,
    ) -> Result<T, tokio::task::JoinError>
    where
        F: FnOnce(&Pipeline) -> T + Send + 'static,
        T: Send + 'static,
    {
        let pipeline = self.clone();
        let lock = self.snapshots.subject_lock(subject_id);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            f(&pipeline)
        })
        .await
    }

    /// Write a subject's current logs and cached stats
    pub async fn flush_history(&self, subject_id: &str) -> Result<(), PersistenceError> {
        let subject = subject_id.to_string();
        self.with_subject_storage(subject_id, move |pipeline| {
            let history = &pipeline.history;
            pipeline.snapshots.persist_history(
                &subject,
                &history.samples(&subject),
                &history.alerts(&subject),
                history.cached_stats(&subject).as_ref(),
            )
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

/// Loop health as reported in status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub running: bool,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

struct RunningLoop {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Detection loop of one subject
pub struct SubjectScheduler {
    subject_id: String,
    pipeline: Pipeline,
    /// Serialises start/stop
    transition: Mutex<Option<RunningLoop>>,
    /// Serialises recording of scheduled and submitted samples
    recording: Mutex<()>,
    /// Wakes the loop to recompute its deadline after a config change
    reschedule: Notify,
    status: RwLock<SchedulerStatus>,
}

impl SubjectScheduler {
    pub fn new(subject_id: &str, pipeline: Pipeline) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            pipeline,
            transition: Mutex::new(None),
            recording: Mutex::new(()),
            reschedule: Notify::new(),
            status: RwLock::new(SchedulerStatus::default()),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.status.read().state
    }

    fn set_state(&self, state: SchedulerState) {
        {
            let mut status = self.status.write();
            status.state = state;
            status.running = state == SchedulerState::Running;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = self.status();
        self.pipeline.events.publish(PushEvent::SystemStatusUpdate {
            subject_id: self.subject_id.clone(),
            state: status.state,
            running: status.running,
            last_tick_latency_ms: status.last_tick_latency_ms,
            consecutive_failures: status.consecutive_failures,
            degraded: status.degraded,
            timestamp: Utc::now(),
        });
    }

    /// Start the loop. Returns `Ok(false)` if it was already running.
    pub async fn start(self: &Arc<Self>) -> Result<bool, CapabilityError> {
        let mut running = self.transition.lock().await;
        if running.is_some() {
            return Ok(false);
        }

        self.set_state(SchedulerState::Starting);

        if let Err(e) = self.pipeline.sampler.check_capability(&self.subject_id).await {
            tracing::warn!(subject_id = %self.subject_id, error = %e, "Capability check failed");
            self.pipeline.events.publish(PushEvent::error(
                &self.subject_id,
                ErrorCode::PermissionDenied,
                e.to_string(),
            ));
            self.set_state(SchedulerState::Stopped);
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(Arc::clone(self).run(shutdown_rx));
        *running = Some(RunningLoop { shutdown_tx, handle });

        self.set_state(SchedulerState::Running);
        tracing::info!(subject_id = %self.subject_id, "Detection started");
        Ok(true)
    }

    /// Stop the loop, letting an in-flight tick finish. Returns `false` if
    /// it was not running.
    pub async fn stop(&self) -> bool {
        let mut running = self.transition.lock().await;
        let Some(active) = running.take() else {
            return false;
        };

        self.set_state(SchedulerState::Stopping);

        let _ = active.shutdown_tx.send(()).await;
        if let Err(e) = active.handle.await {
            tracing::error!(subject_id = %self.subject_id, error = %e, "Detection task ended abnormally");
        }

        self.set_state(SchedulerState::Stopped);
        tracing::info!(subject_id = %self.subject_id, "Detection stopped");
        true
    }

    /// Recompute the next deadline from the current interval. A no-op when
    /// the loop is not waiting; a loop mid-tick reads the interval afterwards.
    pub fn reschedule(&self) {
        self.reschedule.notify_waiters();
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut last_started = Instant::now();
        let mut deadline = last_started;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::debug!(subject_id = %self.subject_id, "Detection loop shutting down");
                    break;
                }
                _ = self.reschedule.notified() => {
                    deadline = last_started + self.current_interval();
                    continue;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            // Outside the select so shutdown never cancels a tick midway
            last_started = Instant::now();
            let _ = self.tick().await;

            let interval = self.current_interval();
            deadline += interval;

            let now = Instant::now();
            if deadline < now {
                let behind = (now - deadline).as_nanos();
                let step = interval.as_nanos().max(1);
                let skipped = ((behind + step - 1) / step) as u32;
                deadline += interval * skipped;

                self.status.write().skipped_ticks += u64::from(skipped);
                tracing::debug!(
                    subject_id = %self.subject_id,
                    skipped,
                    "Tick overran its interval, skipping missed deadlines"
                );
            }
        }
    }

    fn current_interval(&self) -> Duration {
        let config = self.pipeline.configs.get(&self.subject_id);
        Duration::from_millis(config.sampling_interval_ms.max(1))
    }

    /// Run one tick: sample, record, dispatch, flush.
    pub async fn tick(&self) -> Result<Sample, SamplingError> {
        let started = Instant::now();
        let config = self.pipeline.configs.get(&self.subject_id);

        let result = match self.take_outcome().await {
            Ok(outcome) => self.record(outcome, &config).await.map(|(sample, _)| sample),
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }

        {
            let mut status = self.status.write();
            status.ticks += 1;
            status.last_tick_at = Some(Utc::now());
            status.last_tick_latency_ms = Some(started.elapsed().as_millis() as u64);
        }
        self.publish_status();

        result
    }

    /// Run an externally supplied outcome through the pipeline, whether or
    /// not the loop is running. Loop health is left untouched.
    pub async fn submit(
        &self,
        outcome: SampleOutcome,
    ) -> Result<(Sample, Option<AlertEvent>), SamplingError> {
        let config = self.pipeline.configs.get(&self.subject_id);
        self.record(outcome, &config).await
    }

    async fn take_outcome(&self) -> Result<SampleOutcome, SamplingError> {
        let timeout = self.pipeline.sample_timeout;
        match tokio::time::timeout(timeout, self.pipeline.sampler.sample(&self.subject_id)).await {
            Ok(result) => result,
            Err(_) => Err(SamplingError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn record(
        &self,
        outcome: SampleOutcome,
        config: &DetectionConfig,
    ) -> Result<(Sample, Option<AlertEvent>), SamplingError> {
        outcome.validate()?;
        let _recording = self.recording.lock().await;

        // Sample timestamps never go backwards, even if the clock does
        let now = Utc::now();
        let timestamp = match self.pipeline.history.last_sample_at(&self.subject_id) {
            Some(last) if last > now => last,
            _ => now,
        };
        let sample = Sample::from_outcome(
            self.pipeline.history.next_sample_id(),
            &self.subject_id,
            timestamp,
            outcome,
            config,
        );

        self.pipeline.history.append_sample(sample.clone());
        self.pipeline.events.publish(PushEvent::detection(&sample));

        let alert = if sample.triggered {
            self.pipeline.dispatcher.dispatch(&sample, config).await
        } else {
            None
        };

        if let Err(e) = self.pipeline.flush_history(&self.subject_id).await {
            tracing::warn!(subject_id = %self.subject_id, error = %e, "History flush failed");
            self.pipeline.events.publish(PushEvent::error(
                &self.subject_id,
                ErrorCode::StorageFailure,
                e.to_string(),
            ));
        }

        Ok((sample, alert))
    }

    fn record_success(&self) {
        let mut status = self.status.write();
        if status.degraded {
            tracing::info!(subject_id = %self.subject_id, "Sampling recovered");
        }
        status.consecutive_failures = 0;
        status.degraded = false;
    }

    fn record_failure(&self, error: &SamplingError) {
        let (failures, newly_degraded) = {
            let mut status = self.status.write();
            status.consecutive_failures += 1;
            let newly_degraded =
                !status.degraded && status.consecutive_failures >= self.pipeline.degraded_after;
            if newly_degraded {
                status.degraded = true;
            }
            (status.consecutive_failures, newly_degraded)
        };

        tracing::warn!(
            subject_id = %self.subject_id,
            error = %error,
            consecutive_failures = failures,
            "Sampling failed, skipping tick"
        );
        if newly_degraded {
            tracing::warn!(subject_id = %self.subject_id, "Subject degraded after {} failures", failures);
        }

        self.pipeline.events.publish(PushEvent::error(
            &self.subject_id,
            ErrorCode::SamplingFailure,
            error.to_string(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::dispatcher::tests::RecordingSink;
    use crate::alerts::RateLimiter;
    use crate::config::ConfigPatch;
    use crate::detection::{ScriptStep, ScriptedSampler};

    fn make_pipeline(sampler: ScriptedSampler) -> Pipeline {
        let history = Arc::new(HistoryStore::new(100, 100));
        let events = Arc::new(EventBus::default());
        let dispatcher = Arc::new(AlertDispatcher::new(
            Arc::new(RateLimiter::new()),
            Arc::new(RecordingSink::default()),
            Arc::clone(&history),
            Arc::clone(&events),
            Duration::from_millis(500),
        ));
        Pipeline {
            sampler: Arc::new(sampler),
            configs: Arc::new(ConfigStore::new()),
            history,
            dispatcher,
            events,
            snapshots: Arc::new(SnapshotManager::in_memory()),
            sample_timeout: Duration::from_millis(100),
            degraded_after: DEFAULT_DEGRADED_AFTER,
        }
    }

    fn kinds(sub: &mut crate::control::Subscription) -> Vec<&'static str> {
        std::iter::from_fn(|| sub.try_recv()).map(|e| e.kind()).collect()
    }

    #[tokio::test]
    async fn test_tick_sequence_raises_alerts_for_triggered_samples() {
        let pipeline = make_pipeline(ScriptedSampler::from_confidences(&[0.9, 0.3, 0.95]));
        let scheduler = SubjectScheduler::new("alice", pipeline.clone());

        for _ in 0..3 {
            scheduler.tick().await.unwrap();
        }

        let samples = pipeline.history.samples("alice");
        let triggered: Vec<bool> = samples.iter().rev().map(|s| s.triggered).collect();
        assert_eq!(triggered, vec![true, false, true]);
        assert_eq!(pipeline.history.alerts("alice").len(), 2);

        // History was flushed
        let stored = pipeline.snapshots.load("alice").unwrap().unwrap();
        assert_eq!(stored.samples.len(), 3);
        assert_eq!(stored.alerts.len(), 2);
    }

    #[tokio::test]
    async fn test_detection_update_precedes_alert() {
        let pipeline = make_pipeline(ScriptedSampler::from_confidences(&[0.9]));
        let mut sub = pipeline.events.subscribe("alice");
        let scheduler = SubjectScheduler::new("alice", pipeline);

        scheduler.tick().await.unwrap();

        assert_eq!(
            kinds(&mut sub),
            vec!["detection_update", "alert_notification", "system_status_update"]
        );
    }

    #[tokio::test]
    async fn test_gaze_below_threshold_does_not_trigger() {
        let sampler = ScriptedSampler::new([ScriptStep::Outcome(
            SampleOutcome::new(0.9).with_faces(1).with_gaze(0.1),
        )]);
        let pipeline = make_pipeline(sampler);
        let scheduler = SubjectScheduler::new("alice", pipeline.clone());

        let sample = scheduler.tick().await.unwrap();
        assert!(!sample.triggered);
        assert!(pipeline.history.alerts("alice").is_empty());
    }

    #[tokio::test]
    async fn test_failures_degrade_then_recover() {
        let sampler = ScriptedSampler::new([
            ScriptStep::Fail("camera busy".to_string()),
            ScriptStep::Fail("camera busy".to_string()),
            ScriptStep::Fail("camera busy".to_string()),
            ScriptStep::Outcome(SampleOutcome::new(0.1)),
        ]);
        let pipeline = make_pipeline(sampler);
        let mut sub = pipeline.events.subscribe("alice");
        let scheduler = SubjectScheduler::new("alice", pipeline.clone());

        for _ in 0..2 {
            assert!(scheduler.tick().await.is_err());
        }
        assert!(!scheduler.status().degraded);

        assert!(scheduler.tick().await.is_err());
        let status = scheduler.status();
        assert!(status.degraded);
        assert_eq!(status.consecutive_failures, 3);

        let degraded_pushed = std::iter::from_fn(|| sub.try_recv()).any(|e| {
            matches!(e, PushEvent::SystemStatusUpdate { degraded: true, .. })
        });
        assert!(degraded_pushed);
        assert!(pipeline.history.samples("alice").is_empty());

        scheduler.tick().await.unwrap();
        let status = scheduler.status();
        assert!(!status.degraded);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.ticks, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_sampler_times_out() {
        let pipeline = make_pipeline(ScriptedSampler::new([ScriptStep::Hang]));
        let scheduler = SubjectScheduler::new("alice", pipeline);

        let result = scheduler.tick().await;
        assert!(matches!(result, Err(SamplingError::Timeout(100))));
    }

    #[tokio::test]
    async fn test_invalid_outcome_is_a_failure() {
        let pipeline = make_pipeline(ScriptedSampler::from_confidences(&[1.5]));
        let scheduler = SubjectScheduler::new("alice", pipeline.clone());

        assert!(matches!(
            scheduler.tick().await,
            Err(SamplingError::InvalidOutcome(_))
        ));
        assert!(pipeline.history.samples("alice").is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_stays_stopped() {
        let pipeline = make_pipeline(ScriptedSampler::from_confidences(&[0.9]).with_permission(false));
        let scheduler = Arc::new(SubjectScheduler::new("alice", pipeline));

        assert!(scheduler.start().await.is_err());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.status().running);
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let pipeline = make_pipeline(ScriptedSampler::new(Vec::<ScriptStep>::new()));
        let scheduler = Arc::new(SubjectScheduler::new("alice", pipeline));

        assert!(!scheduler.stop().await);
        assert!(scheduler.start().await.unwrap());
        assert!(!scheduler.start().await.unwrap());
        assert_eq!(scheduler.state(), SchedulerState::Running);

        assert!(scheduler.stop().await);
        assert!(!scheduler.stop().await);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_loop_runs_until_stopped() {
        let pipeline = make_pipeline(ScriptedSampler::from_confidences(&[0.9, 0.3, 0.95]));
        pipeline
            .configs
            .update(
                "alice",
                &ConfigPatch {
                    sampling_interval_ms: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        let scheduler = Arc::new(SubjectScheduler::new("alice", pipeline.clone()));

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.stop().await);

        // The script is exhausted after three samples; later ticks fail
        assert_eq!(pipeline.history.samples("alice").len(), 3);
        assert_eq!(pipeline.history.alerts("alice").len(), 2);
        assert!(scheduler.status().ticks > 3);
        assert!(scheduler.status().consecutive_failures > 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_tick() {
        let sampler = ScriptedSampler::new([
            ScriptStep::Delayed(Duration::from_millis(150), SampleOutcome::new(0.9).with_faces(1)),
            ScriptStep::Outcome(SampleOutcome::new(0.9)),
        ]);
        let mut pipeline = make_pipeline(sampler);
        pipeline.sample_timeout = Duration::from_secs(2);
        pipeline
            .configs
            .update(
                "alice",
                &ConfigPatch {
                    sampling_interval_ms: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        let scheduler = Arc::new(SubjectScheduler::new("alice", pipeline.clone()));

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.stop().await);

        // The slow tick completed and no further tick started
        assert_eq!(pipeline.history.samples("alice").len(), 1);
        assert_eq!(pipeline.history.alerts("alice").len(), 1);
        assert_eq!(scheduler.status().ticks, 1);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.status().ticks, 1);
    }

    #[tokio::test]
    async fn test_interval_change_applies_without_restart() {
        let sampler = ScriptedSampler::new(Vec::<ScriptStep>::new());
        for _ in 0..50 {
            sampler.push(ScriptStep::Outcome(SampleOutcome::new(0.1)));
        }
        let pipeline = make_pipeline(sampler);
        let slow = ConfigPatch {
            sampling_interval_ms: Some(60_000),
            ..Default::default()
        };
        pipeline.configs.update("alice", &slow).unwrap();
        let scheduler = Arc::new(SubjectScheduler::new("alice", pipeline.clone()));

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.status().ticks, 1);

        let fast = ConfigPatch {
            sampling_interval_ms: Some(10),
            ..Default::default()
        };
        pipeline.configs.update("alice", &fast).unwrap();
        scheduler.reschedule();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.stop().await);

        assert!(scheduler.status().ticks >= 3);
    }

    #[tokio::test]
    async fn test_submitted_outcome_runs_the_pipeline() {
        let pipeline = make_pipeline(ScriptedSampler::new(Vec::<ScriptStep>::new()));
        let mut sub = pipeline.events.subscribe("alice");
        let scheduler = SubjectScheduler::new("alice", pipeline.clone());

        let (sample, alert) = scheduler
            .submit(SampleOutcome::new(0.92).with_faces(2))
            .await
            .unwrap();
        assert!(sample.triggered);
        assert_eq!(alert.unwrap().metadata.sample_id, sample.id);

        let (quiet, none) = scheduler.submit(SampleOutcome::new(0.2)).await.unwrap();
        assert!(!quiet.triggered);
        assert!(none.is_none());

        assert!(matches!(
            scheduler.submit(SampleOutcome::new(f64::NAN)).await,
            Err(SamplingError::InvalidOutcome(_))
        ));

        // Loop health only tracks scheduled ticks
        assert_eq!(scheduler.status().ticks, 0);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(pipeline.snapshots.load("alice").unwrap().unwrap().samples.len(), 2);
        assert_eq!(
            kinds(&mut sub),
            vec!["detection_update", "alert_notification", "detection_update"]
        );
    }
}
