//! Detection configuration types and validation

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::alerts::Channel;

/// Longest accepted sampling interval (one hour)
pub const MAX_SAMPLING_INTERVAL_MS: u64 = 3_600_000;

/// Per-channel tuning and rate limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSettings {
    /// Lowest sample confidence delivered on this channel (0 disables)
    #[serde(default)]
    pub min_confidence: f64,
    /// Maximum deliveries within one window
    pub max_per_window: u32,
    /// Rate window length
    pub window_ms: u64,
    /// Minimum spacing between two deliveries (0 disables)
    #[serde(default)]
    pub cooldown_ms: u64,
    /// Playback volume, audio only
    #[serde(default = "default_volume")]
    pub volume: f64,
    /// Time box for audio playback and the visual banner
    #[serde(default)]
    pub duration_ms: u64,
    /// Alternating on/off pulse lengths, haptic only
    #[serde(default)]
    pub pattern_ms: Vec<u64>,
    /// Target of the notification channel
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_volume() -> f64 {
    0.8
}

impl ChannelSettings {
    /// Create settings allowing `max_per_window` deliveries per `window_ms`
    pub fn new(max_per_window: u32, window_ms: u64) -> Self {
        Self {
            min_confidence: 0.0,
            max_per_window,
            window_ms,
            cooldown_ms: 0,
            volume: default_volume(),
            duration_ms: 0,
            pattern_ms: Vec::new(),
            webhook_url: None,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_pattern(mut self, pattern_ms: Vec<u64>) -> Self {
        self.pattern_ms = pattern_ms;
        self
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Default settings for a channel
    pub fn default_for(channel: Channel) -> Self {
        const MINUTE_MS: u64 = 60_000;
        match channel {
            Channel::Visual => Self::new(20, MINUTE_MS)
                .with_min_confidence(0.7)
                .with_duration(3_000),
            Channel::Audio => Self::new(10, MINUTE_MS)
                .with_min_confidence(0.8)
                .with_duration(500),
            Channel::Haptic => Self::new(30, MINUTE_MS)
                .with_min_confidence(0.6)
                .with_pattern(vec![200, 100, 200]),
            Channel::Notification => Self::new(5, MINUTE_MS).with_min_confidence(0.7),
        }
    }

    fn validate(&self, channel: Channel) -> Result<(), ConfigError> {
        let field = |name: &str| format!("channels.{}.{}", channel, name);

        if !self.min_confidence.is_finite() || !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::invalid(field("min_confidence"), "must be within [0, 1]"));
        }
        if self.max_per_window == 0 {
            return Err(ConfigError::invalid(field("max_per_window"), "must be at least 1"));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid(field("window_ms"), "must be at least 1"));
        }
        if !self.volume.is_finite() || !(0.0..=1.0).contains(&self.volume) {
            return Err(ConfigError::invalid(field("volume"), "must be within [0, 1]"));
        }
        if self.pattern_ms.iter().any(|&ms| ms == 0) {
            return Err(ConfigError::invalid(field("pattern_ms"), "pulse lengths must be positive"));
        }
        if let Some(url) = &self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::invalid(field("webhook_url"), "must be an http(s) URL"));
            }
        }
        Ok(())
    }
}

/// Detection and alert configuration for one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum confidence for a sample to trigger, in (0, 1]
    pub confidence_threshold: f64,
    /// Minimum gaze score for a sample to trigger, in (0, 1]
    pub gaze_threshold: f64,
    /// Tick period
    pub sampling_interval_ms: u64,
    /// Channels alerts are delivered on
    pub enabled_channels: BTreeSet<Channel>,
    /// Settings for every known channel
    pub channels: BTreeMap<Channel, ChannelSettings>,
    /// When false, samples are still recorded but no alerts are raised
    pub enabled: bool,
    /// Overrides the generated alert message
    #[serde(default)]
    pub custom_message: Option<String>,
    /// Offset of the subject's local calendar from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            gaze_threshold: 0.3,
            sampling_interval_ms: 1_000,
            enabled_channels: BTreeSet::from([Channel::Visual, Channel::Audio, Channel::Haptic]),
            channels: Channel::ALL
                .into_iter()
                .map(|c| (c, ChannelSettings::default_for(c)))
                .collect(),
            enabled: true,
            custom_message: None,
            utc_offset_minutes: 0,
        }
    }
}

impl DetectionConfig {
    /// Settings for a channel, falling back to the channel default
    pub fn channel_settings(&self, channel: Channel) -> ChannelSettings {
        self.channels
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| ChannelSettings::default_for(channel))
    }

    /// Validate every field, naming the first offending one
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_unit_threshold("confidence_threshold", self.confidence_threshold)?;
        validate_unit_threshold("gaze_threshold", self.gaze_threshold)?;

        if !(1..=MAX_SAMPLING_INTERVAL_MS).contains(&self.sampling_interval_ms) {
            return Err(ConfigError::invalid(
                "sampling_interval_ms",
                format!("must be within [1, {}]", MAX_SAMPLING_INTERVAL_MS),
            ));
        }
        if !(-720..=840).contains(&self.utc_offset_minutes) {
            return Err(ConfigError::invalid(
                "utc_offset_minutes",
                "must be within [-720, 840]",
            ));
        }
        if let Some(message) = &self.custom_message {
            if message.trim().is_empty() || message.chars().count() > 280 {
                return Err(ConfigError::invalid(
                    "custom_message",
                    "must be 1 to 280 characters",
                ));
            }
        }
        for (channel, settings) in &self.channels {
            settings.validate(*channel)?;
        }
        Ok(())
    }

    /// Merge a patch into a copy of this config and validate the result
    pub fn merged(&self, patch: &ConfigPatch) -> Result<DetectionConfig, ConfigError> {
        let mut next = self.clone();

        if let Some(v) = patch.confidence_threshold {
            next.confidence_threshold = v;
        }
        if let Some(v) = patch.gaze_threshold {
            next.gaze_threshold = v;
        }
        if let Some(v) = patch.sampling_interval_ms {
            next.sampling_interval_ms = v;
        }
        if let Some(v) = &patch.enabled_channels {
            next.enabled_channels = v.clone();
        }
        if let Some(channels) = &patch.channels {
            for (channel, settings) in channels {
                next.channels.insert(*channel, settings.clone());
            }
        }
        if let Some(v) = patch.enabled {
            next.enabled = v;
        }
        if let Some(v) = &patch.custom_message {
            next.custom_message = (!v.is_empty()).then(|| v.clone());
        }
        if let Some(v) = patch.utc_offset_minutes {
            next.utc_offset_minutes = v;
        }

        next.validate()?;
        Ok(next)
    }
}

fn validate_unit_threshold(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be within (0, 1]"))
    }
}

/// Partial config update; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gaze_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_channels: Option<BTreeSet<Channel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<BTreeMap<Channel, ChannelSettings>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// An empty string clears the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utc_offset_minutes: Option<i32>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == ConfigPatch::default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to persist config: {0}")]
    Persist(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field, if this is a validation error
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::Invalid { field, .. } => Some(field),
            ConfigError::Persist(_) => None,
        }
    }
}
