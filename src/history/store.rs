//! Per-subject sample and alert history

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::log::BoundedLog;
use super::stats::{compute_stats, StatsCache, SubjectStats};
use crate::alerts::{AlertEvent, AlertLevel, Channel};
use crate::detection::Sample;

/// Largest page a query may request
pub const MAX_PAGE_LIMIT: usize = 1000;
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// A validated limit/offset window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Result<Self, QueryError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(QueryError::Invalid {
                field: "limit".to_string(),
                reason: format!("must be within [1, {}]", MAX_PAGE_LIMIT),
            });
        }
        Ok(Self {
            limit,
            offset: offset.unwrap_or(0),
        })
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

/// One page of results, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    /// Entries matching the query before paging
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Alert query filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertFilter {
    pub level: Option<AlertLevel>,
    pub channel: Option<Channel>,
    pub unread_only: bool,
}

impl AlertFilter {
    pub fn matches(&self, alert: &AlertEvent) -> bool {
        self.level.map_or(true, |l| alert.level == l)
            && self.channel.map_or(true, |c| alert.channels_sent.contains(&c))
            && (!self.unread_only || !alert.is_read)
    }
}

struct SubjectHistory {
    samples: RwLock<BoundedLog<Sample>>,
    alerts: RwLock<BoundedLog<AlertEvent>>,
}

/// Bounded sample and alert logs for every subject
pub struct HistoryStore {
    subjects: DashMap<String, Arc<SubjectHistory>>,
    max_samples: usize,
    max_alerts: usize,
    next_sample_id: AtomicU64,
    next_alert_id: AtomicU64,
    stats_cache: StatsCache,
}

impl HistoryStore {
    pub fn new(max_samples: usize, max_alerts: usize) -> Self {
        Self {
            subjects: DashMap::new(),
            max_samples: max_samples.max(1),
            max_alerts: max_alerts.max(1),
            next_sample_id: AtomicU64::new(1),
            next_alert_id: AtomicU64::new(1),
            stats_cache: StatsCache::default(),
        }
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn max_alerts(&self) -> usize {
        self.max_alerts
    }

    fn subject(&self, subject_id: &str) -> Option<Arc<SubjectHistory>> {
        self.subjects.get(subject_id).map(|h| Arc::clone(&h))
    }

    fn subject_or_create(&self, subject_id: &str) -> Arc<SubjectHistory> {
        if let Some(history) = self.subject(subject_id) {
            return history;
        }
        Arc::clone(
            &self
                .subjects
                .entry(subject_id.to_string())
                .or_insert_with(|| {
                    Arc::new(SubjectHistory {
                        samples: RwLock::new(BoundedLog::new(self.max_samples)),
                        alerts: RwLock::new(BoundedLog::new(self.max_alerts)),
                    })
                }),
        )
    }

    /// Allocate a fresh sample id
    pub fn next_sample_id(&self) -> u64 {
        self.next_sample_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate a fresh alert id
    pub fn next_alert_id(&self) -> u64 {
        self.next_alert_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a fully-built sample at the head of its subject's log
    pub fn append_sample(&self, sample: Sample) {
        let subject_id = sample.subject_id.clone();
        let history = self.subject_or_create(&subject_id);
        if let Some(evicted) = history.samples.write().push(sample) {
            tracing::trace!(subject_id = %subject_id, sample_id = evicted.id, "Sample evicted");
        }
        self.stats_cache.invalidate(&subject_id);
    }

    /// Append a fully-built alert at the head of its subject's log
    pub fn append_alert(&self, alert: AlertEvent) {
        let subject_id = alert.subject_id.clone();
        let history = self.subject_or_create(&subject_id);
        if let Some(evicted) = history.alerts.write().push(alert) {
            tracing::trace!(subject_id = %subject_id, alert_id = evicted.id, "Alert evicted");
        }
        self.stats_cache.invalidate(&subject_id);
    }

    /// Page through samples, newest first
    pub fn query_samples(&self, subject_id: &str, page: Page) -> PageResult<Sample> {
        let (items, total) = match self.subject(subject_id) {
            Some(history) => {
                let samples = history.samples.read();
                let items = samples
                    .iter()
                    .skip(page.offset)
                    .take(page.limit)
                    .cloned()
                    .collect();
                (items, samples.len())
            }
            None => (Vec::new(), 0),
        };

        PageResult {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        }
    }

    /// Page through alerts matching `filter`, newest first
    pub fn query_alerts(
        &self,
        subject_id: &str,
        filter: &AlertFilter,
        page: Page,
    ) -> PageResult<AlertEvent> {
        let (items, total) = match self.subject(subject_id) {
            Some(history) => {
                let alerts = history.alerts.read();
                let total = alerts.iter().filter(|a| filter.matches(a)).count();
                let items = alerts
                    .iter()
                    .filter(|a| filter.matches(a))
                    .skip(page.offset)
                    .take(page.limit)
                    .cloned()
                    .collect();
                (items, total)
            }
            None => (Vec::new(), 0),
        };

        PageResult {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        }
    }

    pub fn get_alert(&self, subject_id: &str, alert_id: u64) -> Option<AlertEvent> {
        let history = self.subject(subject_id)?;
        let alerts = history.alerts.read();
        let found = alerts.iter().find(|a| a.id == alert_id).cloned();
        found
    }

    /// Mark one alert read. Returns true only if it transitioned from unread;
    /// an already-read or unknown alert is a no-op.
    pub fn mark_alert_read(&self, subject_id: &str, alert_id: u64) -> bool {
        let Some(history) = self.subject(subject_id) else {
            return false;
        };

        let transitioned = history
            .alerts
            .write()
            .iter_mut()
            .find(|a| a.id == alert_id)
            .map(|a| a.mark_read(Utc::now()))
            .unwrap_or(false);

        if transitioned {
            self.stats_cache.invalidate(subject_id);
        }
        transitioned
    }

    /// Mark every unread alert read, returning how many transitioned
    pub fn mark_all_read(&self, subject_id: &str) -> usize {
        let Some(history) = self.subject(subject_id) else {
            return 0;
        };

        let now = Utc::now();
        let marked = history
            .alerts
            .write()
            .iter_mut()
            .map(|a| a.mark_read(now))
            .filter(|&transitioned| transitioned)
            .count();

        if marked > 0 {
            self.stats_cache.invalidate(subject_id);
        }
        marked
    }

    /// Mark the given alerts read at `now`, returning how many transitioned
    pub fn mark_read_at(&self, subject_id: &str, alert_ids: &[u64], now: DateTime<Utc>) -> usize {
        let Some(history) = self.subject(subject_id) else {
            return 0;
        };

        let marked = history
            .alerts
            .write()
            .iter_mut()
            .filter(|a| alert_ids.contains(&a.id))
            .map(|a| a.mark_read(now))
            .filter(|&transitioned| transitioned)
            .count();

        if marked > 0 {
            self.stats_cache.invalidate(subject_id);
        }
        marked
    }

    /// Drop every alert of a subject, returning how many were removed.
    /// Samples and id counters are kept.
    pub fn clear_alerts(&self, subject_id: &str) -> usize {
        let Some(history) = self.subject(subject_id) else {
            return 0;
        };

        let cleared = {
            let mut alerts = history.alerts.write();
            let cleared = alerts.len();
            alerts.replace(Vec::new());
            cleared
        };

        self.stats_cache.invalidate(subject_id);
        cleared
    }

    /// Statistics, served from the cache when still valid
    pub fn stats(&self, subject_id: &str, utc_offset_minutes: i32) -> SubjectStats {
        if let Some(stats) = self.stats_cache.get(subject_id) {
            return stats;
        }
        let stats = self.compute_stats_at(subject_id, Utc::now(), utc_offset_minutes);
        self.stats_cache.put(stats.clone());
        stats
    }

    /// Compute statistics as of `now`, bypassing the cache
    pub fn compute_stats_at(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
        utc_offset_minutes: i32,
    ) -> SubjectStats {
        match self.subject(subject_id) {
            Some(history) => {
                let samples = history.samples.read();
                let alerts = history.alerts.read();
                compute_stats(subject_id, &samples, &alerts, now, utc_offset_minutes)
            }
            None => compute_stats(
                subject_id,
                &BoundedLog::new(1),
                &BoundedLog::new(1),
                now,
                utc_offset_minutes,
            ),
        }
    }

    pub fn cached_stats(&self, subject_id: &str) -> Option<SubjectStats> {
        self.stats_cache.get(subject_id)
    }

    pub fn seed_stats(&self, stats: SubjectStats) {
        self.stats_cache.put(stats);
    }

    pub fn invalidate_stats(&self, subject_id: &str) {
        self.stats_cache.invalidate(subject_id);
    }

    /// Timestamp of the newest sample
    pub fn last_sample_at(&self, subject_id: &str) -> Option<DateTime<Utc>> {
        let history = self.subject(subject_id)?;
        let samples = history.samples.read();
        samples.newest().map(|s| s.timestamp)
    }

    /// Newest-first copy of a subject's samples
    pub fn samples(&self, subject_id: &str) -> Vec<Sample> {
        self.subject(subject_id)
            .map(|h| h.samples.read().to_vec())
            .unwrap_or_default()
    }

    /// Newest-first copy of a subject's alerts
    pub fn alerts(&self, subject_id: &str) -> Vec<AlertEvent> {
        self.subject(subject_id)
            .map(|h| h.alerts.read().to_vec())
            .unwrap_or_default()
    }

    /// Replace a subject's history with newest-first lists, truncated to
    /// capacity. Id counters move past every imported id.
    pub fn replace(&self, subject_id: &str, samples: Vec<Sample>, alerts: Vec<AlertEvent>) {
        if let Some(max) = samples.iter().map(|s| s.id).max() {
            self.next_sample_id.fetch_max(max + 1, Ordering::SeqCst);
        }
        if let Some(max) = alerts.iter().map(|a| a.id).max() {
            self.next_alert_id.fetch_max(max + 1, Ordering::SeqCst);
        }

        let history = self.subject_or_create(subject_id);
        {
            let mut sample_log = history.samples.write();
            let mut alert_log = history.alerts.write();
            sample_log.replace(samples);
            alert_log.replace(alerts);
        }
        self.stats_cache.invalidate(subject_id);
    }

    pub fn subjects(&self) -> Vec<String> {
        self.subjects.iter().map(|e| e.key().clone()).collect()
    }
}

/// Query parameter errors
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}
