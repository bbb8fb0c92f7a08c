//! The injectable sensing boundary
//!
//! Real sensing (camera access, face and gaze inference) lives behind the
//! [`Sampler`] trait. The pipeline only sees a [`SampleOutcome`] per tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use rand::Rng;

use super::sample::SampleOutcome;

/// Source of per-tick detection outcomes
pub trait Sampler: Send + Sync {
    /// Check that sensing is available (e.g. camera permission) for a subject
    fn check_capability<'a>(&'a self, _subject_id: &'a str) -> BoxFuture<'a, Result<(), CapabilityError>> {
        future::ready(Ok(())).boxed()
    }

    /// Produce one outcome. May be slow; callers bound it with a timeout.
    fn sample<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<SampleOutcome, SamplingError>>;
}

/// Randomised stand-in used when no real sensor is wired in
pub struct SimulatedSampler {
    peek_probability: f64,
}

impl SimulatedSampler {
    pub fn new(peek_probability: f64) -> Self {
        Self {
            peek_probability: peek_probability.clamp(0.0, 1.0),
        }
    }

    fn generate(&self) -> SampleOutcome {
        let mut rng = rand::thread_rng();

        if rng.gen_bool(self.peek_probability) {
            let faces = rng.gen_range(1..=3);
            let angles = (0..faces)
                .map(|_| (rng.gen_range(-15.0..15.0), rng.gen_range(-20.0..20.0)))
                .collect();
            SampleOutcome::new(rng.gen_range(0.7..=1.0))
                .with_faces(faces)
                .with_angles(angles)
                .with_gaze(rng.gen_range(0.3..=1.0))
        } else {
            let faces = rng.gen_range(0..=1);
            let angles = (0..faces)
                .map(|_| (rng.gen_range(-60.0..60.0), rng.gen_range(-80.0..80.0)))
                .collect();
            SampleOutcome::new(rng.gen_range(0.0..0.5))
                .with_faces(faces)
                .with_angles(angles)
                .with_gaze(rng.gen_range(0.0..0.3))
        }
    }
}

impl Sampler for SimulatedSampler {
    fn sample<'a>(&'a self, _subject_id: &'a str) -> BoxFuture<'a, Result<SampleOutcome, SamplingError>> {
        future::ready(Ok(self.generate())).boxed()
    }
}

/// One step of a scripted sampler
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Outcome(SampleOutcome),
    Fail(String),
    /// Resolves to the outcome after a delay
    Delayed(Duration, SampleOutcome),
    /// Never resolves, to exercise the sampling timeout
    Hang,
}

/// Replays a fixed sequence of outcomes, for demos and tests
pub struct ScriptedSampler {
    steps: Mutex<VecDeque<ScriptStep>>,
    granted: AtomicBool,
}

impl ScriptedSampler {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            granted: AtomicBool::new(true),
        }
    }

    /// Script that yields one outcome per confidence value
    pub fn from_confidences(confidences: &[f64]) -> Self {
        Self::new(
            confidences
                .iter()
                .map(|&c| ScriptStep::Outcome(SampleOutcome::new(c).with_faces(1))),
        )
    }

    pub fn with_permission(self, granted: bool) -> Self {
        self.granted.store(granted, Ordering::SeqCst);
        self
    }

    pub fn push(&self, step: ScriptStep) {
        self.steps.lock().push_back(step);
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().len()
    }
}

impl Sampler for ScriptedSampler {
    fn check_capability<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<(), CapabilityError>> {
        let result = if self.granted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CapabilityError::Denied(format!(
                "camera access not granted for '{}'",
                subject_id
            )))
        };
        future::ready(result).boxed()
    }

    fn sample<'a>(&'a self, _subject_id: &'a str) -> BoxFuture<'a, Result<SampleOutcome, SamplingError>> {
        let step = self.steps.lock().pop_front();
        match step {
            Some(ScriptStep::Outcome(outcome)) => future::ready(Ok(outcome)).boxed(),
            Some(ScriptStep::Fail(reason)) => future::ready(Err(SamplingError::Failed(reason))).boxed(),
            Some(ScriptStep::Delayed(delay, outcome)) => async move {
                tokio::time::sleep(delay).await;
                Ok(outcome)
            }
            .boxed(),
            Some(ScriptStep::Hang) => future::pending().boxed(),
            None => future::ready(Err(SamplingError::Unavailable("script exhausted".to_string()))).boxed(),
        }
    }
}

/// Capability check errors
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Permission denied: {0}")]
    Denied(String),
}

/// Sampling errors
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("Sampling failed: {0}")]
    Failed(String),

    #[error("Sampler unavailable: {0}")]
    Unavailable(String),

    #[error("Sampler returned an invalid outcome: {0}")]
    InvalidOutcome(String),

    #[error("Sampling timed out after {0} ms")]
    Timeout(u64),
}
