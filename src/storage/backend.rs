//! File and in-memory backends

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{PersistenceBackend, PersistenceError};

const FILE_EXTENSION: &str = "json";

/// One `<key>.json` file per key in a data directory
pub struct FileBackend {
    data_dir: PathBuf,
    /// Distinguishes temp files of concurrent writes to one key
    write_seq: AtomicU64,
}

impl FileBackend {
    /// Open (and create if needed) a data directory
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        Ok(Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            write_seq: AtomicU64::new(0),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.data_dir.join(format!("{}.{}", key, FILE_EXTENSION)))
    }
}

impl PersistenceBackend for FileBackend {
    fn write(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        let path = self.key_path(key)?;
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!(
            "{}.{}-{}.tmp",
            FILE_EXTENSION,
            std::process::id(),
            seq
        ));

        let result = write_synced(&tmp_path, data)
            // Readers never see a half-written value
            .and_then(|()| std::fs::rename(&tmp_path, &path));

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.key_path(key)?;
        match std::fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        let path = self.key_path(key)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_keys(&self) -> Result<Vec<String>, PersistenceError> {
        let mut keys = Vec::new();

        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == FILE_EXTENSION) {
                if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(name.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn sync(&self) -> Result<(), PersistenceError> {
        // Every write is already synced
        Ok(())
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// In-process backend, used when no data directory is configured
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn write(&self, key: &str, data: &[u8]) -> Result<(), PersistenceError> {
        self.entries.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn sync(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();

        backend.write("alice.config", b"{\"enabled\":true}").unwrap();

        let data = backend.read("alice.config").unwrap().unwrap();
        assert_eq!(data, b"{\"enabled\":true}");
        assert!(temp_dir.path().join("alice.config.json").exists());
        assert!(backend.read("bob.config").unwrap().is_none());
    }

    #[test]
    fn test_file_list_keys_skips_other_files() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();

        backend.write("alice.samples", b"[]").unwrap();
        backend.write("alice.alerts", b"[]").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"ignore me").unwrap();

        let keys = backend.list_keys().unwrap();
        assert_eq!(keys, vec!["alice.alerts".to_string(), "alice.samples".to_string()]);
    }

    #[test]
    fn test_file_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();

        backend.write("to_delete", b"data").unwrap();
        backend.delete("to_delete").unwrap();
        backend.delete("to_delete").unwrap();
        assert!(backend.read("to_delete").unwrap().is_none());
    }

    #[test]
    fn test_file_rejects_path_keys() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();

        assert!(matches!(
            backend.write("../escape", b"x"),
            Err(PersistenceError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_concurrent_writes_to_one_key() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::new(temp_dir.path()).unwrap();
        let short = b"[]".to_vec();
        let long = format!("[{}]", vec!["1"; 512].join(",")).into_bytes();

        std::thread::scope(|scope| {
            for payload in [&short, &long] {
                let backend = &backend;
                scope.spawn(move || {
                    for _ in 0..200 {
                        backend.write("alice.alerts", payload).unwrap();
                    }
                });
            }
        });

        let stored = backend.read("alice.alerts").unwrap().unwrap();
        assert!(stored == short || stored == long);
        assert_eq!(backend.list_keys().unwrap(), vec!["alice.alerts".to_string()]);

        let leftovers = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map_or(false, |ext| ext == "tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_memory_backend() {
        let backend = MemoryBackend::new();
        backend.write("k", b"v1").unwrap();
        backend.write("k", b"v2").unwrap();

        assert_eq!(backend.read("k").unwrap().unwrap(), b"v2");
        assert_eq!(backend.list_keys().unwrap(), vec!["k".to_string()]);

        backend.delete("k").unwrap();
        assert!(backend.read("k").unwrap().is_none());
    }
}
