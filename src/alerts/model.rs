//! Alert data types

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// On-screen banner
    Visual,
    /// Time-boxed tone playback
    Audio,
    /// Vibration pulse pattern
    Haptic,
    /// Outbound webhook
    Notification,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Visual,
        Channel::Audio,
        Channel::Haptic,
        Channel::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Visual => "visual",
            Channel::Audio => "audio",
            Channel::Haptic => "haptic",
            Channel::Notification => "notification",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown channel '{}'", s))
    }
}

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertLevel {
    /// Map a confidence score onto a severity band.
    ///
    /// Monotonic: a higher confidence never yields a lower level.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            AlertLevel::Critical
        } else if confidence >= 0.8 {
            AlertLevel::High
        } else if confidence >= 0.5 {
            AlertLevel::Medium
        } else {
            AlertLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Low => "low",
            AlertLevel::Medium => "medium",
            AlertLevel::High => "high",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(AlertLevel::Low),
            "medium" => Ok(AlertLevel::Medium),
            "high" => Ok(AlertLevel::High),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(format!("unknown level '{}'", other)),
        }
    }
}

/// Copy of the originating sample's auxiliary fields, plus delivery outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    pub sample_id: u64,
    pub aux_count: u32,
    #[serde(default)]
    pub aux_angles: Vec<(f64, f64)>,
    #[serde(default)]
    pub gaze_score: Option<f64>,
    /// Channels that were attempted but failed, with the reason
    #[serde(default)]
    pub delivery_failures: BTreeMap<Channel, String>,
}

/// A notification raised from a triggered sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: u64,
    pub subject_id: String,
    /// Channels a delivery was attempted on
    pub channels_sent: BTreeSet<Channel>,
    pub level: AlertLevel,
    pub message: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub metadata: AlertMetadata,
}

impl AlertEvent {
    /// Transition to read. Returns false if already read.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        self.read_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_bands_are_monotonic() {
        let mut previous = AlertLevel::Low;
        for step in 0..=100 {
            let level = AlertLevel::from_confidence(step as f64 / 100.0);
            assert!(level >= previous, "level dropped at {}", step);
            previous = level;
        }
        assert_eq!(AlertLevel::from_confidence(0.75), AlertLevel::Medium);
        assert_eq!(AlertLevel::from_confidence(0.8), AlertLevel::High);
        assert_eq!(AlertLevel::from_confidence(0.97), AlertLevel::Critical);
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!("Audio".parse::<Channel>().unwrap(), Channel::Audio);
        assert!("smoke-signal".parse::<Channel>().is_err());
    }

    #[test]
    fn test_mark_read_keeps_first_timestamp() {
        let mut alert = AlertEvent {
            id: 1,
            subject_id: "alice".to_string(),
            channels_sent: BTreeSet::from([Channel::Visual]),
            level: AlertLevel::High,
            message: "peek".to_string(),
            confidence: 0.9,
            timestamp: Utc::now(),
            is_read: false,
            read_at: None,
            metadata: AlertMetadata::default(),
        };

        let first = Utc::now();
        assert!(alert.mark_read(first));
        assert!(!alert.mark_read(first + chrono::Duration::seconds(5)));
        assert_eq!(alert.read_at, Some(first));
    }
}
