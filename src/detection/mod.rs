//! Detection: samplers, samples and the per-subject scheduling loop

pub mod sample;
pub mod sampler;
pub mod scheduler;

pub use sample::{Sample, SampleOutcome};
pub use sampler::{CapabilityError, Sampler, SamplingError, ScriptStep, ScriptedSampler, SimulatedSampler};
pub use scheduler::{Pipeline, SchedulerState, SchedulerStatus, SubjectScheduler, DEFAULT_DEGRADED_AFTER};
