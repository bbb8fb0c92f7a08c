//! Derived per-subject statistics and their lazy cache

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use super::log::BoundedLog;
use crate::alerts::{AlertEvent, AlertLevel, Channel};
use crate::detection::Sample;

/// Statistics over a subject's current history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStats {
    pub subject_id: String,
    pub total_samples: usize,
    pub triggered_samples: usize,
    /// triggered / total, 0 without samples
    pub trigger_rate: f64,
    pub average_confidence: f64,
    pub total_alerts: usize,
    pub unread_alerts: usize,
    /// Alerts raised on the subject's current local calendar day
    pub alerts_today: usize,
    pub alerts_by_level: BTreeMap<AlertLevel, usize>,
    pub alerts_by_channel: BTreeMap<Channel, usize>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_alert_at: Option<DateTime<Utc>>,
}

/// Compute statistics as of `now`, with "today" taken in the subject's
/// local calendar (`utc_offset_minutes` east of UTC).
pub fn compute_stats(
    subject_id: &str,
    samples: &BoundedLog<Sample>,
    alerts: &BoundedLog<AlertEvent>,
    now: DateTime<Utc>,
    utc_offset_minutes: i32,
) -> SubjectStats {
    let total_samples = samples.len();
    let mut triggered_samples = 0;
    let mut confidence_sum = 0.0;

    for sample in samples.iter() {
        if sample.triggered {
            triggered_samples += 1;
        }
        confidence_sum += sample.confidence;
    }

    let (trigger_rate, average_confidence) = if total_samples > 0 {
        (
            triggered_samples as f64 / total_samples as f64,
            confidence_sum / total_samples as f64,
        )
    } else {
        (0.0, 0.0)
    };

    let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    let today = now.with_timezone(&offset).date_naive();

    let mut unread_alerts = 0;
    let mut alerts_today = 0;
    let mut alerts_by_level = BTreeMap::new();
    let mut alerts_by_channel = BTreeMap::new();

    for alert in alerts.iter() {
        if !alert.is_read {
            unread_alerts += 1;
        }
        if alert.timestamp.with_timezone(&offset).date_naive() == today {
            alerts_today += 1;
        }
        *alerts_by_level.entry(alert.level).or_insert(0) += 1;
        for channel in &alert.channels_sent {
            *alerts_by_channel.entry(*channel).or_insert(0) += 1;
        }
    }

    SubjectStats {
        subject_id: subject_id.to_string(),
        total_samples,
        triggered_samples,
        trigger_rate,
        average_confidence,
        total_alerts: alerts.len(),
        unread_alerts,
        alerts_today,
        alerts_by_level,
        alerts_by_channel,
        last_sample_at: samples.newest().map(|s| s.timestamp),
        last_alert_at: alerts.newest().map(|a| a.timestamp),
    }
}

/// Lazily recomputed stats, invalidated on every history mutation
pub struct StatsCache {
    cache: Cache<String, SubjectStats>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, subject_id: &str) -> Option<SubjectStats> {
        if let Some(stats) = self.cache.get(subject_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(stats)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, stats: SubjectStats) {
        self.cache.insert(stats.subject_id.clone(), stats);
    }

    pub fn invalidate(&self, subject_id: &str) {
        self.cache.invalidate(subject_id);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for StatsCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertMetadata;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn sample(id: u64, confidence: f64, triggered: bool) -> Sample {
        Sample {
            id,
            subject_id: "alice".to_string(),
            timestamp: Utc::now(),
            triggered,
            confidence,
            aux_count: 1,
            aux_angles: vec![],
            gaze_score: None,
        }
    }

    fn alert(id: u64, timestamp: DateTime<Utc>) -> AlertEvent {
        AlertEvent {
            id,
            subject_id: "alice".to_string(),
            channels_sent: BTreeSet::from([Channel::Visual, Channel::Audio]),
            level: AlertLevel::High,
            message: "peek".to_string(),
            confidence: 0.9,
            timestamp,
            is_read: false,
            read_at: None,
            metadata: AlertMetadata::default(),
        }
    }

    #[test]
    fn test_empty_history_has_zero_rate() {
        let stats = compute_stats(
            "alice",
            &BoundedLog::new(10),
            &BoundedLog::new(10),
            Utc::now(),
            0,
        );
        assert_eq!(stats.total_samples, 0);
        assert_eq!(stats.trigger_rate, 0.0);
        assert_eq!(stats.average_confidence, 0.0);
        assert!(stats.last_sample_at.is_none());
    }

    #[test]
    fn test_rate_and_average() {
        let mut samples = BoundedLog::new(10);
        samples.push(sample(1, 0.9, true));
        samples.push(sample(2, 0.3, false));
        samples.push(sample(3, 0.9, true));
        samples.push(sample(4, 0.3, false));

        let stats = compute_stats("alice", &samples, &BoundedLog::new(10), Utc::now(), 0);
        assert_eq!(stats.triggered_samples, 2);
        assert!((stats.trigger_rate - 0.5).abs() < 1e-9);
        assert!((stats.average_confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_today_uses_local_calendar() {
        // 23:30 UTC on the 1st is already the 2nd at UTC+2
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap();
        let earlier_same_utc_day = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();

        let mut alerts = BoundedLog::new(10);
        alerts.push(alert(1, earlier_same_utc_day));
        alerts.push(alert(2, now));

        let utc = compute_stats("alice", &BoundedLog::new(1), &alerts, now, 0);
        let plus_two = compute_stats("alice", &BoundedLog::new(1), &alerts, now, 120);

        assert_eq!(utc.alerts_today, 2);
        assert_eq!(plus_two.alerts_today, 1);
        assert_eq!(utc.alerts_by_channel.get(&Channel::Audio), Some(&2));
        assert_eq!(utc.unread_alerts, 2);
    }

    #[test]
    fn test_cache_hit_and_invalidate() {
        let cache = StatsCache::default();
        let stats = compute_stats("alice", &BoundedLog::new(1), &BoundedLog::new(1), Utc::now(), 0);

        assert!(cache.get("alice").is_none());
        cache.put(stats.clone());
        assert_eq!(cache.get("alice"), Some(stats));
        cache.invalidate("alice");
        assert!(cache.get("alice").is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 2);
    }
}
