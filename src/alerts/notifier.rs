//! Channel delivery for alerts

use std::time::Duration;

use futures::future::BoxFuture;

use super::model::{AlertEvent, Channel};
use crate::config::ChannelSettings;

/// Side-effecting delivery of an alert on one channel
pub trait AlertSink: Send + Sync {
    fn deliver<'a>(
        &'a self,
        channel: Channel,
        alert: &'a AlertEvent,
        settings: &'a ChannelSettings,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Default sink: log-backed visual/audio/haptic output and a webhook channel
pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    /// Create a new notifier
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn deliver_channel(
        &self,
        channel: Channel,
        alert: &AlertEvent,
        settings: &ChannelSettings,
    ) -> Result<(), DeliveryError> {
        match channel {
            Channel::Visual => {
                tracing::warn!(
                    subject_id = %alert.subject_id,
                    alert_id = alert.id,
                    level = %alert.level,
                    display_ms = settings.duration_ms,
                    "Visual alert: {}",
                    alert.message
                );
                Ok(())
            }
            Channel::Audio => self.play_tone(alert, settings).await,
            Channel::Haptic => self.pulse(alert, settings).await,
            Channel::Notification => self.send_webhook(alert, settings).await,
        }
    }

    /// Play an alert tone for `duration_ms`
    async fn play_tone(
        &self,
        alert: &AlertEvent,
        settings: &ChannelSettings,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            subject_id = %alert.subject_id,
            alert_id = alert.id,
            volume = settings.volume,
            duration_ms = settings.duration_ms,
            "Audio alert playing"
        );
        if settings.duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(settings.duration_ms)).await;
        }
        Ok(())
    }

    /// Drive the on/off vibration pattern
    async fn pulse(&self, alert: &AlertEvent, settings: &ChannelSettings) -> Result<(), DeliveryError> {
        for (step, ms) in settings.pattern_ms.iter().enumerate() {
            if step % 2 == 0 {
                tracing::debug!(
                    subject_id = %alert.subject_id,
                    alert_id = alert.id,
                    pulse_ms = ms,
                    "Haptic pulse"
                );
            }
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        tracing::info!(
            subject_id = %alert.subject_id,
            alert_id = alert.id,
            pulses = settings.pattern_ms.len().div_ceil(2),
            "Haptic alert delivered"
        );
        Ok(())
    }

    /// Send webhook notification
    async fn send_webhook(
        &self,
        alert: &AlertEvent,
        settings: &ChannelSettings,
    ) -> Result<(), DeliveryError> {
        let url = settings
            .webhook_url
            .as_deref()
            .ok_or(DeliveryError::NotConfigured("webhook_url"))?;

        let payload = serde_json::json!({
            "alert_id": alert.id,
            "subject_id": alert.subject_id,
            "level": alert.level,
            "message": alert.message,
            "confidence": alert.confidence,
            "timestamp": alert.timestamp.to_rfc3339(),
            "face_count": alert.metadata.aux_count,
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Webhook(format!("Failed to send webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(DeliveryError::Webhook(format!(
                "Webhook returned status {}",
                response.status()
            )));
        }

        tracing::debug!(
            alert_id = alert.id,
            url = %url,
            "Webhook notification sent"
        );

        Ok(())
    }
}

impl AlertSink for Notifier {
    fn deliver<'a>(
        &'a self,
        channel: Channel,
        alert: &'a AlertEvent,
        settings: &'a ChannelSettings,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(self.deliver_channel(channel, alert, settings))
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery errors
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Channel not configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("Delivery timed out after {0} ms")]
    Timeout(u64),
}
