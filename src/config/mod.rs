//! Configuration store for per-subject detection and alert settings

pub mod model;
pub mod store;

pub use model::{ChannelSettings, ConfigError, ConfigPatch, DetectionConfig, MAX_SAMPLING_INTERVAL_MS};
pub use store::ConfigStore;
