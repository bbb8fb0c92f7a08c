//! Snapshot manager: the persisted per-subject layout and export/import

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::backend::MemoryBackend;
use super::{PersistenceBackend, PersistenceError};
use crate::alerts::AlertEvent;
use crate::config::DetectionConfig;
use crate::detection::Sample;
use crate::history::SubjectStats;

/// Current export format version
pub const SCHEMA_VERSION: u32 = 1;

const CONFIG_SUFFIX: &str = "config";
const SAMPLES_SUFFIX: &str = "samples";
const ALERTS_SUFFIX: &str = "alerts";
const STATS_SUFFIX: &str = "stats-cache";
const SUFFIXES: [&str; 4] = [CONFIG_SUFFIX, SAMPLES_SUFFIX, ALERTS_SUFFIX, STATS_SUFFIX];

/// Everything stored for one subject. Logs are newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub schema_version: u32,
    pub subject_id: String,
    pub exported_at: DateTime<Utc>,
    pub config: DetectionConfig,
    #[serde(default)]
    pub samples: Vec<Sample>,
    #[serde(default)]
    pub alerts: Vec<AlertEvent>,
    #[serde(default)]
    pub stats_cache: Option<SubjectStats>,
}

impl SubjectSnapshot {
    pub fn new(
        subject_id: &str,
        config: DetectionConfig,
        samples: Vec<Sample>,
        alerts: Vec<AlertEvent>,
        stats_cache: Option<SubjectStats>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            subject_id: subject_id.to_string(),
            exported_at: Utc::now(),
            config,
            samples,
            alerts,
            stats_cache,
        }
    }
}

fn key(subject_id: &str, suffix: &str) -> String {
    format!("{}.{}", subject_id, suffix)
}

/// Reads and writes subjects through a [`PersistenceBackend`]
pub struct SnapshotManager {
    backend: Arc<dyn PersistenceBackend>,
    /// Serialises read-modify-write cycles of one subject's keys
    subject_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SnapshotManager {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            backend,
            subject_locks: DashMap::new(),
        }
    }

    /// Lock guarding a subject's stored keys.
    ///
    /// Hold it from taking an in-memory snapshot until the write completes,
    /// so a later snapshot is never overwritten by an earlier one.
    pub fn subject_lock(&self, subject_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.subject_locks.get(subject_id) {
            return Arc::clone(&lock);
        }
        Arc::clone(
            &self
                .subject_locks
                .entry(subject_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Manager over a fresh [`MemoryBackend`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend(&self) -> &dyn PersistenceBackend {
        self.backend.as_ref()
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let data = serde_json::to_vec(value)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        self.backend.write(key, &data)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        match self.backend.read(key)? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| PersistenceError::Corrupted {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn persist_config(&self, subject_id: &str, config: &DetectionConfig) -> Result<(), PersistenceError> {
        self.write_json(&key(subject_id, CONFIG_SUFFIX), config)?;
        self.backend.sync()
    }

    /// Flush a subject's logs and, when present, its cached stats
    pub fn persist_history(
        &self,
        subject_id: &str,
        samples: &[Sample],
        alerts: &[AlertEvent],
        stats_cache: Option<&SubjectStats>,
    ) -> Result<(), PersistenceError> {
        self.write_json(&key(subject_id, SAMPLES_SUFFIX), samples)?;
        self.write_json(&key(subject_id, ALERTS_SUFFIX), alerts)?;
        match stats_cache {
            Some(stats) => self.write_json(&key(subject_id, STATS_SUFFIX), stats)?,
            None => self.backend.delete(&key(subject_id, STATS_SUFFIX))?,
        }
        self.backend.sync()
    }

    /// Write every key of a snapshot
    pub fn save(&self, snapshot: &SubjectSnapshot) -> Result<(), PersistenceError> {
        self.write_json(&key(&snapshot.subject_id, CONFIG_SUFFIX), &snapshot.config)?;
        self.persist_history(
            &snapshot.subject_id,
            &snapshot.samples,
            &snapshot.alerts,
            snapshot.stats_cache.as_ref(),
        )
    }

    /// Load a subject. Returns None when nothing is stored for it; a
    /// missing config falls back to defaults.
    pub fn load(&self, subject_id: &str) -> Result<Option<SubjectSnapshot>, PersistenceError> {
        let config: Option<DetectionConfig> = self.read_json(&key(subject_id, CONFIG_SUFFIX))?;
        let samples: Option<Vec<Sample>> = self.read_json(&key(subject_id, SAMPLES_SUFFIX))?;
        let alerts: Option<Vec<AlertEvent>> = self.read_json(&key(subject_id, ALERTS_SUFFIX))?;

        if config.is_none() && samples.is_none() && alerts.is_none() {
            return Ok(None);
        }

        // A corrupt stats cache is only a cache
        let stats_cache = match self.read_json(&key(subject_id, STATS_SUFFIX)) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(subject_id = %subject_id, error = %e, "Dropping unreadable stats cache");
                None
            }
        };

        Ok(Some(SubjectSnapshot::new(
            subject_id,
            config.unwrap_or_default(),
            samples.unwrap_or_default(),
            alerts.unwrap_or_default(),
            stats_cache,
        )))
    }

    /// Subjects with at least one stored key
    pub fn subjects(&self) -> Result<Vec<String>, PersistenceError> {
        let subjects: BTreeSet<String> = self
            .backend
            .list_keys()?
            .into_iter()
            .filter_map(|k| {
                SUFFIXES.iter().find_map(|suffix| {
                    k.strip_suffix(suffix)
                        .and_then(|rest| rest.strip_suffix('.'))
                        .filter(|subject| !subject.is_empty())
                        .map(str::to_string)
                })
            })
            .collect();
        Ok(subjects.into_iter().collect())
    }

    /// Remove every key of a subject
    pub fn delete(&self, subject_id: &str) -> Result<(), PersistenceError> {
        for suffix in SUFFIXES {
            self.backend.delete(&key(subject_id, suffix))?;
        }
        self.backend.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileBackend;
    use tempfile::TempDir;

    fn make_sample(id: u64, confidence: f64) -> Sample {
        Sample {
            id,
            subject_id: "alice".to_string(),
            timestamp: Utc::now(),
            triggered: confidence >= 0.7,
            confidence,
            aux_count: 1,
            aux_angles: vec![(0.0, 5.0)],
            gaze_score: None,
        }
    }

    #[test]
    fn test_file_round_trip_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let config = DetectionConfig {
            confidence_threshold: 0.8,
            ..Default::default()
        };
        let samples = vec![make_sample(2, 0.9), make_sample(1, 0.2)];

        {
            let manager = SnapshotManager::new(Arc::new(FileBackend::new(temp_dir.path()).unwrap()));
            manager.persist_config("alice", &config).unwrap();
            manager.persist_history("alice", &samples, &[], None).unwrap();
        }

        let manager = SnapshotManager::new(Arc::new(FileBackend::new(temp_dir.path()).unwrap()));
        assert_eq!(manager.subjects().unwrap(), vec!["alice".to_string()]);

        let loaded = manager.load("alice").unwrap().unwrap();
        assert_eq!(loaded.config, config);
        assert_eq!(loaded.samples, samples);
        assert!(loaded.alerts.is_empty());
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_load_unknown_subject() {
        let manager = SnapshotManager::in_memory();
        assert!(manager.load("nobody").unwrap().is_none());
    }

    #[test]
    fn test_history_without_config_uses_defaults() {
        let manager = SnapshotManager::in_memory();
        manager
            .persist_history("bob", &[make_sample(1, 0.5)], &[], None)
            .unwrap();

        let loaded = manager.load("bob").unwrap().unwrap();
        assert_eq!(loaded.config, DetectionConfig::default());
        assert_eq!(loaded.samples.len(), 1);
    }

    #[test]
    fn test_corrupt_value_is_reported() {
        let manager = SnapshotManager::in_memory();
        manager.backend().write("alice.samples", b"not json").unwrap();

        match manager.load("alice") {
            Err(PersistenceError::Corrupted { key, .. }) => assert_eq!(key, "alice.samples"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_subject_lock_is_shared_per_subject() {
        let manager = SnapshotManager::in_memory();
        let alice = manager.subject_lock("alice");

        assert!(Arc::ptr_eq(&alice, &manager.subject_lock("alice")));
        assert!(!Arc::ptr_eq(&alice, &manager.subject_lock("bob")));

        let _guard = alice.lock();
        assert!(manager.subject_lock("alice").try_lock().is_none());
        assert!(manager.subject_lock("bob").try_lock().is_some());
    }

    #[test]
    fn test_subjects_with_dotted_keys() {
        let manager = SnapshotManager::in_memory();
        manager.persist_config("team-a_1", &DetectionConfig::default()).unwrap();
        manager.persist_history("bob", &[], &[], None).unwrap();
        manager.backend().write("stray", b"{}").unwrap();

        assert_eq!(
            manager.subjects().unwrap(),
            vec!["bob".to_string(), "team-a_1".to_string()]
        );

        manager.delete("bob").unwrap();
        assert_eq!(manager.subjects().unwrap(), vec!["team-a_1".to_string()]);
    }
}
