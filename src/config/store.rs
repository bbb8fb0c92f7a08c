//! Per-subject configuration store

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::model::{ConfigError, ConfigPatch, DetectionConfig};

/// Holds the current config of every subject
pub struct ConfigStore {
    configs: DashMap<String, Arc<RwLock<DetectionConfig>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            configs: DashMap::new(),
        }
    }

    fn slot(&self, subject_id: &str) -> Arc<RwLock<DetectionConfig>> {
        if let Some(slot) = self.configs.get(subject_id) {
            return Arc::clone(&slot);
        }
        Arc::clone(
            &self
                .configs
                .entry(subject_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(DetectionConfig::default()))),
        )
    }

    /// Current config of a subject (defaults if never set)
    pub fn get(&self, subject_id: &str) -> DetectionConfig {
        self.configs
            .get(subject_id)
            .map(|slot| slot.read().clone())
            .unwrap_or_default()
    }

    /// Merge and validate a patch, then commit it
    pub fn update(
        &self,
        subject_id: &str,
        patch: &ConfigPatch,
    ) -> Result<DetectionConfig, ConfigError> {
        self.update_with(subject_id, patch, |_| Ok(()))
    }

    /// Merge and validate a patch, run `persist` on the result, then commit.
    ///
    /// The subject's write lock is held throughout, so a concurrent reader
    /// observes either the old or the new config. Nothing is committed if
    /// validation or `persist` fails.
    pub fn update_with<F>(
        &self,
        subject_id: &str,
        patch: &ConfigPatch,
        persist: F,
    ) -> Result<DetectionConfig, ConfigError>
    where
        F: FnOnce(&DetectionConfig) -> Result<(), ConfigError>,
    {
        let slot = self.slot(subject_id);
        let mut current = slot.write();

        let next = current.merged(patch)?;
        persist(&next)?;
        *current = next.clone();

        tracing::debug!(subject_id = %subject_id, "Config updated");
        Ok(next)
    }

    /// Install a whole config after validating it
    pub fn replace(&self, subject_id: &str, config: DetectionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let slot = self.slot(subject_id);
        *slot.write() = config;
        Ok(())
    }

    /// Subjects with an explicitly stored config
    pub fn subjects(&self) -> Vec<String> {
        self.configs.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
