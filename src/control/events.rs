//! Real-time push events and per-subject subscriptions

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::error::ErrorCode;
use crate::alerts::{AlertEvent, AlertLevel, Channel};
use crate::detection::{Sample, SchedulerState};

/// Event pushed to subscribers of a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    DetectionUpdate {
        subject_id: String,
        sample_id: u64,
        triggered: bool,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },
    AlertNotification {
        subject_id: String,
        alert_id: u64,
        channels: Vec<Channel>,
        level: AlertLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    SystemStatusUpdate {
        subject_id: String,
        state: SchedulerState,
        running: bool,
        last_tick_latency_ms: Option<u64>,
        consecutive_failures: u32,
        degraded: bool,
        timestamp: DateTime<Utc>,
    },
    Error {
        subject_id: String,
        code: ErrorCode,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl PushEvent {
    pub fn detection(sample: &Sample) -> Self {
        PushEvent::DetectionUpdate {
            subject_id: sample.subject_id.clone(),
            sample_id: sample.id,
            triggered: sample.triggered,
            confidence: sample.confidence,
            timestamp: sample.timestamp,
        }
    }

    pub fn alert(alert: &AlertEvent) -> Self {
        PushEvent::AlertNotification {
            subject_id: alert.subject_id.clone(),
            alert_id: alert.id,
            channels: alert.channels_sent.iter().copied().collect(),
            level: alert.level,
            message: alert.message.clone(),
            timestamp: alert.timestamp,
        }
    }

    pub fn error(subject_id: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        PushEvent::Error {
            subject_id: subject_id.to_string(),
            code,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::DetectionUpdate { .. } => "detection_update",
            PushEvent::AlertNotification { .. } => "alert_notification",
            PushEvent::SystemStatusUpdate { .. } => "system_status_update",
            PushEvent::Error { .. } => "error",
        }
    }

    pub fn subject_id(&self) -> &str {
        match self {
            PushEvent::DetectionUpdate { subject_id, .. }
            | PushEvent::AlertNotification { subject_id, .. }
            | PushEvent::SystemStatusUpdate { subject_id, .. }
            | PushEvent::Error { subject_id, .. } => subject_id,
        }
    }
}

/// Fan-out of push events, one broadcast channel per subject
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<PushEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Publish to the event's subject. Returns the number of receivers.
    pub fn publish(&self, event: PushEvent) -> usize {
        let subject_id = event.subject_id().to_string();
        let delivered = match self.channels.get(&subject_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => return 0,
        };

        if delivered == 0 {
            self.channels
                .remove_if(&subject_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Register interest in a subject's events
    pub fn subscribe(&self, subject_id: &str) -> Subscription {
        let receiver = self
            .channels
            .entry(subject_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        tracing::debug!(subject_id = %subject_id, "Subscriber registered");
        Subscription {
            subject_id: subject_id.to_string(),
            receiver,
        }
    }

    pub fn subscriber_count(&self, subject_id: &str) -> usize {
        self.channels
            .get(subject_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A live, ordered sequence of one subject's events. Dropping it
/// unsubscribes.
pub struct Subscription {
    subject_id: String,
    receiver: broadcast::Receiver<PushEvent>,
}

impl Subscription {
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Next event, or None once the bus is gone. A lagging subscriber skips
    /// the events it missed but never sees them out of order.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        subject_id = %self.subject_id,
                        missed,
                        "Subscriber lagged, events dropped"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-queued event, if any
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = PushEvent> {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(subject: &str, id: u64) -> PushEvent {
        PushEvent::DetectionUpdate {
            subject_id: subject.to_string(),
            sample_id: id,
            triggered: false,
            confidence: 0.1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe("alice");

        for id in 1..=3 {
            assert_eq!(bus.publish(detection("alice", id)), 1);
        }

        for expected in 1..=3 {
            match sub.recv().await {
                Some(PushEvent::DetectionUpdate { sample_id, .. }) => assert_eq!(sample_id, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_subjects_do_not_cross() {
        let bus = EventBus::new(16);
        let mut alice = bus.subscribe("alice");

        bus.publish(detection("bob", 1));
        assert!(alice.try_recv().is_none());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe("alice");
        assert_eq!(bus.subscriber_count("alice"), 1);

        drop(sub);
        assert_eq!(bus.publish(detection("alice", 1)), 0);
        assert_eq!(bus.subscriber_count("alice"), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(detection("alice", 4)).unwrap();
        assert_eq!(json["type"], "detection_update");
        assert_eq!(json["sample_id"], 4);
    }
}
