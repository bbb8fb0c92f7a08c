//! Samples produced by detection ticks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sampler::SamplingError;
use crate::config::DetectionConfig;

/// Raw result handed back by a sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOutcome {
    /// Peek confidence in [0, 1]
    pub confidence: f64,
    /// Number of faces observed
    pub aux_count: u32,
    /// (pitch, yaw) per observed face, in degrees
    #[serde(default)]
    pub aux_angles: Vec<(f64, f64)>,
    /// How squarely the observed gaze hits the screen, in [0, 1]
    #[serde(default)]
    pub gaze_score: Option<f64>,
}

impl SampleOutcome {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence,
            aux_count: 0,
            aux_angles: Vec::new(),
            gaze_score: None,
        }
    }

    pub fn with_faces(mut self, count: u32) -> Self {
        self.aux_count = count;
        self
    }

    pub fn with_angles(mut self, angles: Vec<(f64, f64)>) -> Self {
        self.aux_angles = angles;
        self
    }

    pub fn with_gaze(mut self, score: f64) -> Self {
        self.gaze_score = Some(score);
        self
    }

    /// Reject outcomes a sampler should never produce
    pub fn validate(&self) -> Result<(), SamplingError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(SamplingError::InvalidOutcome(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let Some(gaze) = self.gaze_score {
            if !gaze.is_finite() || !(0.0..=1.0).contains(&gaze) {
                return Err(SamplingError::InvalidOutcome(format!(
                    "gaze score {} outside [0, 1]",
                    gaze
                )));
            }
        }
        Ok(())
    }

    /// Whether this outcome crosses the configured thresholds.
    ///
    /// A missing gaze score passes the gaze check.
    pub fn crosses(&self, config: &DetectionConfig) -> bool {
        let confident = self.confidence >= config.confidence_threshold;
        let gazing = self
            .gaze_score
            .map(|g| g >= config.gaze_threshold)
            .unwrap_or(true);
        confident && gazing
    }
}

/// One scored observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: u64,
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub triggered: bool,
    pub confidence: f64,
    pub aux_count: u32,
    #[serde(default)]
    pub aux_angles: Vec<(f64, f64)>,
    #[serde(default)]
    pub gaze_score: Option<f64>,
}

impl Sample {
    /// Build a sample and score it against `config`
    pub fn from_outcome(
        id: u64,
        subject_id: &str,
        timestamp: DateTime<Utc>,
        outcome: SampleOutcome,
        config: &DetectionConfig,
    ) -> Self {
        let triggered = outcome.crosses(config);
        Self {
            id,
            subject_id: subject_id.to_string(),
            timestamp,
            triggered,
            confidence: outcome.confidence,
            aux_count: outcome.aux_count,
            aux_angles: outcome.aux_angles,
            gaze_score: outcome.gaze_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_threshold(threshold: f64) -> DetectionConfig {
        DetectionConfig {
            confidence_threshold: threshold,
            ..Default::default()
        }
    }

    #[test]
    fn test_trigger_against_threshold() {
        let config = config_with_threshold(0.7);

        let high = Sample::from_outcome(1, "alice", Utc::now(), SampleOutcome::new(0.95), &config);
        let low = Sample::from_outcome(2, "alice", Utc::now(), SampleOutcome::new(0.5), &config);
        let edge = Sample::from_outcome(3, "alice", Utc::now(), SampleOutcome::new(0.7), &config);

        assert!(high.triggered);
        assert!(!low.triggered);
        assert!(edge.triggered);
    }

    #[test]
    fn test_gaze_check() {
        let config = config_with_threshold(0.7);

        assert!(!SampleOutcome::new(0.9).with_gaze(0.1).crosses(&config));
        assert!(SampleOutcome::new(0.9).with_gaze(0.3).crosses(&config));
        assert!(SampleOutcome::new(0.9).crosses(&config));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(SampleOutcome::new(1.2).validate().is_err());
        assert!(SampleOutcome::new(f64::NAN).validate().is_err());
        assert!(SampleOutcome::new(0.4).with_gaze(-0.1).validate().is_err());
        assert!(SampleOutcome::new(0.4).with_faces(2).validate().is_ok());
    }
}
