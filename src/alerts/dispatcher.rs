//! Turns triggered samples into delivered, recorded alerts

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use super::model::{AlertEvent, AlertLevel, AlertMetadata, Channel};
use super::notifier::{AlertSink, DeliveryError};
use super::rate_limiter::RateLimiter;
use crate::config::{ChannelSettings, DetectionConfig};
use crate::control::{EventBus, PushEvent};
use crate::detection::Sample;
use crate::history::HistoryStore;

/// Fans triggered samples out to the enabled channels
pub struct AlertDispatcher {
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn AlertSink>,
    history: Arc<HistoryStore>,
    events: Arc<EventBus>,
    delivery_timeout: Duration,
}

impl AlertDispatcher {
    pub fn new(
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn AlertSink>,
        history: Arc<HistoryStore>,
        events: Arc<EventBus>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            sink,
            history,
            events,
            delivery_timeout,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Dispatch a sample under `config`.
    ///
    /// Returns the recorded alert, or None when nothing was raised: the
    /// sample did not trigger, alerts are disabled, the confidence is below
    /// every enabled channel's `min_confidence`, or every remaining channel
    /// is rate limited. A suppressed dispatch leaves no trace in history.
    pub async fn dispatch(&self, sample: &Sample, config: &DetectionConfig) -> Option<AlertEvent> {
        if !sample.triggered {
            return None;
        }
        if !config.enabled {
            tracing::debug!(subject_id = %sample.subject_id, "Alerts disabled, skipping dispatch");
            return None;
        }

        let eligible: Vec<(Channel, ChannelSettings)> = config
            .enabled_channels
            .iter()
            .map(|&channel| (channel, config.channel_settings(channel)))
            .filter(|(_, settings)| sample.confidence >= settings.min_confidence)
            .collect();

        if eligible.is_empty() {
            tracing::debug!(
                subject_id = %sample.subject_id,
                sample_id = sample.id,
                "Confidence {:.2} below every channel threshold",
                sample.confidence
            );
            return None;
        }

        let allowed: Vec<(Channel, ChannelSettings)> = eligible
            .into_iter()
            .filter(|(channel, settings)| {
                self.limiter
                    .try_acquire(&sample.subject_id, *channel, settings)
                    .is_allowed()
            })
            .collect();

        if allowed.is_empty() {
            tracing::debug!(
                subject_id = %sample.subject_id,
                sample_id = sample.id,
                "Alert suppressed: no channel available"
            );
            return None;
        }

        let level = AlertLevel::from_confidence(sample.confidence);
        let mut alert = AlertEvent {
            id: self.history.next_alert_id(),
            subject_id: sample.subject_id.clone(),
            channels_sent: allowed.iter().map(|(c, _)| *c).collect(),
            level,
            message: config
                .custom_message
                .clone()
                .unwrap_or_else(|| default_message(sample)),
            confidence: sample.confidence,
            timestamp: Utc::now(),
            is_read: false,
            read_at: None,
            metadata: AlertMetadata {
                sample_id: sample.id,
                aux_count: sample.aux_count,
                aux_angles: sample.aux_angles.clone(),
                gaze_score: sample.gaze_score,
                delivery_failures: BTreeMap::new(),
            },
        };

        let failures = self.deliver_all(&alert, &allowed).await;
        for (channel, error) in failures {
            tracing::warn!(
                subject_id = %alert.subject_id,
                alert_id = alert.id,
                channel = %channel,
                error = %error,
                "Alert delivery failed"
            );
            alert.metadata.delivery_failures.insert(channel, error.to_string());
        }

        self.history.append_alert(alert.clone());
        self.events.publish(PushEvent::alert(&alert));

        tracing::info!(
            subject_id = %alert.subject_id,
            alert_id = alert.id,
            level = %alert.level,
            channels = alert.channels_sent.len(),
            "Alert raised (confidence: {:.2})",
            alert.confidence
        );

        Some(alert)
    }

    /// Deliver on every channel concurrently, each under the delivery
    /// timeout. Returns the failures.
    async fn deliver_all(
        &self,
        alert: &AlertEvent,
        channels: &[(Channel, ChannelSettings)],
    ) -> Vec<(Channel, DeliveryError)> {
        let timeout_ms = self.delivery_timeout.as_millis() as u64;

        let deliveries = channels.iter().map(|(channel, settings)| async move {
            let result = match tokio::time::timeout(
                self.delivery_timeout,
                self.sink.deliver(*channel, alert, settings),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(timeout_ms)),
            };
            (*channel, result)
        });

        join_all(deliveries)
            .await
            .into_iter()
            .filter_map(|(channel, result)| result.err().map(|e| (channel, e)))
            .collect()
    }
}

fn default_message(sample: &Sample) -> String {
    match sample.aux_count {
        0 => format!(
            "Screen peeking detected (confidence {:.2})",
            sample.confidence
        ),
        1 => format!(
            "Screen peeking detected: 1 onlooker (confidence {:.2})",
            sample.confidence
        ),
        n => format!(
            "Screen peeking detected: {} onlookers (confidence {:.2})",
            n, sample.confidence
        ),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// Records deliveries; fails or hangs on selected channels
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub delivered: Mutex<Vec<(u64, Channel)>>,
        pub failing: BTreeSet<Channel>,
        pub hanging: BTreeSet<Channel>,
    }

    impl AlertSink for RecordingSink {
        fn deliver<'a>(
            &'a self,
            channel: Channel,
            alert: &'a AlertEvent,
            _settings: &'a ChannelSettings,
        ) -> BoxFuture<'a, Result<(), DeliveryError>> {
            self.delivered.lock().push((alert.id, channel));
            if self.hanging.contains(&channel) {
                return futures::future::pending().boxed();
            }
            let result = if self.failing.contains(&channel) {
                Err(DeliveryError::Webhook("connection refused".to_string()))
            } else {
                Ok(())
            };
            futures::future::ready(result).boxed()
        }
    }

    fn make_dispatcher(sink: Arc<RecordingSink>) -> (AlertDispatcher, Arc<HistoryStore>, Arc<EventBus>) {
        let history = Arc::new(HistoryStore::new(100, 100));
        let events = Arc::new(EventBus::default());
        let dispatcher = AlertDispatcher::new(
            Arc::new(RateLimiter::new()),
            sink,
            Arc::clone(&history),
            Arc::clone(&events),
            Duration::from_millis(200),
        );
        (dispatcher, history, events)
    }

    fn triggered_sample(history: &HistoryStore, confidence: f64) -> Sample {
        Sample {
            id: history.next_sample_id(),
            subject_id: "alice".to_string(),
            timestamp: Utc::now(),
            triggered: true,
            confidence,
            aux_count: 2,
            aux_angles: vec![(3.0, -4.0), (1.0, 2.0)],
            gaze_score: Some(0.8),
        }
    }

    fn single_channel_config(channel: Channel, settings: ChannelSettings) -> DetectionConfig {
        let mut config = DetectionConfig {
            enabled_channels: BTreeSet::from([channel]),
            ..Default::default()
        };
        config.channels.insert(channel, settings);
        config
    }

    #[tokio::test]
    async fn test_second_alert_in_window_is_suppressed() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, history, _events) = make_dispatcher(Arc::clone(&sink));
        let config = single_channel_config(Channel::Audio, ChannelSettings::new(1, 60_000));

        let first = dispatcher.dispatch(&triggered_sample(&history, 0.9), &config).await;
        let second = dispatcher.dispatch(&triggered_sample(&history, 0.9), &config).await;

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(sink.delivered.lock().len(), 1);
        assert_eq!(history.alerts("alice").len(), 1);
        assert_eq!(dispatcher.rate_limiter().suppressed_count("alice"), 1);
    }

    #[tokio::test]
    async fn test_partial_suppression_keeps_open_channels() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, history, _events) = make_dispatcher(Arc::clone(&sink));
        let mut config = single_channel_config(Channel::Audio, ChannelSettings::new(1, 60_000));
        config.enabled_channels.insert(Channel::Visual);

        dispatcher.dispatch(&triggered_sample(&history, 0.9), &config).await.unwrap();
        let second = dispatcher
            .dispatch(&triggered_sample(&history, 0.9), &config)
            .await
            .unwrap();

        assert_eq!(second.channels_sent, BTreeSet::from([Channel::Visual]));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_recorded_not_fatal() {
        let sink = Arc::new(RecordingSink {
            failing: BTreeSet::from([Channel::Notification]),
            ..Default::default()
        });
        let (dispatcher, history, _events) = make_dispatcher(sink);
        let mut config = DetectionConfig::default();
        config.enabled_channels = BTreeSet::from([Channel::Visual, Channel::Notification]);

        let alert = dispatcher
            .dispatch(&triggered_sample(&history, 0.85), &config)
            .await
            .unwrap();

        assert!(alert.channels_sent.contains(&Channel::Notification));
        assert!(alert.metadata.delivery_failures.contains_key(&Channel::Notification));
        assert!(!alert.metadata.delivery_failures.contains_key(&Channel::Visual));
        assert_eq!(alert.level, AlertLevel::High);
        assert_eq!(alert.metadata.aux_count, 2);
        assert_eq!(history.alerts("alice")[0], alert);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_channel_times_out() {
        let sink = Arc::new(RecordingSink {
            hanging: BTreeSet::from([Channel::Haptic]),
            ..Default::default()
        });
        let (dispatcher, history, _events) = make_dispatcher(sink);
        let mut config = DetectionConfig::default();
        config.enabled_channels = BTreeSet::from([Channel::Visual, Channel::Haptic]);

        let alert = dispatcher
            .dispatch(&triggered_sample(&history, 0.9), &config)
            .await
            .unwrap();

        let failure = alert.metadata.delivery_failures.get(&Channel::Haptic).unwrap();
        assert!(failure.contains("timed out"));
    }

    #[tokio::test]
    async fn test_disabled_or_untriggered_raise_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, history, _events) = make_dispatcher(Arc::clone(&sink));

        let disabled = DetectionConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(dispatcher.dispatch(&triggered_sample(&history, 0.9), &disabled).await.is_none());

        let mut quiet = triggered_sample(&history, 0.2);
        quiet.triggered = false;
        assert!(dispatcher.dispatch(&quiet, &DetectionConfig::default()).await.is_none());

        assert!(sink.delivered.lock().is_empty());
        assert!(history.alerts("alice").is_empty());
    }

    #[tokio::test]
    async fn test_alert_is_pushed_to_subscribers() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, history, events) = make_dispatcher(sink);
        let mut sub = events.subscribe("alice");
        let config = DetectionConfig {
            custom_message: Some("Someone is looking".to_string()),
            ..Default::default()
        };

        let alert = dispatcher
            .dispatch(&triggered_sample(&history, 0.97), &config)
            .await
            .unwrap();

        match sub.try_recv() {
            Some(PushEvent::AlertNotification { alert_id, level, message, .. }) => {
                assert_eq!(alert_id, alert.id);
                assert_eq!(level, AlertLevel::Critical);
                assert_eq!(message, "Someone is looking");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channel_confidence_gates() {
        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, history, _events) = make_dispatcher(Arc::clone(&sink));
        let config = DetectionConfig::default();

        let alert = dispatcher
            .dispatch(&triggered_sample(&history, 0.75), &config)
            .await
            .unwrap();
        assert_eq!(alert.channels_sent, BTreeSet::from([Channel::Visual, Channel::Haptic]));

        let alert = dispatcher
            .dispatch(&triggered_sample(&history, 0.65), &config)
            .await
            .unwrap();
        assert_eq!(alert.channels_sent, BTreeSet::from([Channel::Haptic]));

        assert!(dispatcher
            .dispatch(&triggered_sample(&history, 0.5), &config)
            .await
            .is_none());

        // Gated channels are not rate limited, so nothing counts as suppressed
        assert_eq!(dispatcher.rate_limiter().suppressed_count("alice"), 0);
        assert_eq!(history.alerts("alice").len(), 2);
        assert_eq!(sink.delivered.lock().len(), 3);
    }
}
