//! File-Backed Snapshot Storage
//!
//! Persists each key as a pretty-printed JSON file so a workflow interrupted
//! by a crash or Ctrl-C can be resumed by the next process.
//!
//! Keys map to file names one-to-one: `:` becomes `_`, ASCII letters,
//! digits, `-` and `.` are kept, and every other byte (`_` included) is
//! written as `%XX`. `work:extract` is stored as `{dir}/work_extract.json`,
//! `step:a/b` as `{dir}/step_a%2Fb.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;
use tokio::fs;

use super::Storage;
use crate::error::{Error, Result};

/// Storage that keeps one JSON document per key inside a directory.
///
/// The directory is created on the first write.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the state files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path used for a key.
    ///
    /// Distinct keys always map to distinct files.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut file_name = String::with_capacity(key.len() + 5);
        for byte in key.bytes() {
            match byte {
                b':' => file_name.push('_'),
                b if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' => {
                    file_name.push(b as char)
                }
                b => file_name.push_str(&format!("%{:02X}", b)),
            }
        }
        file_name.push_str(".json");
        self.dir.join(file_name)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "failed to read state file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        debug!("Loaded state for '{}' from {}", key, path.display());
        let value = serde_json::from_str(&content).map_err(|e| {
            Error::Storage(format!("corrupt state file {}: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let json = serde_json::to_string_pretty(&value)?;
        fs::write(&path, json).await?;

        debug!("Saved state for '{}' to {}", key, path.display());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted state file: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_path_for_escapes_key() {
        let storage = FileStorage::new("/tmp/state");
        assert_eq!(
            storage.path_for("work:extract"),
            PathBuf::from("/tmp/state/work_extract.json")
        );
        assert_eq!(
            storage.path_for("step:a/b"),
            PathBuf::from("/tmp/state/step_a%2Fb.json")
        );
        assert_eq!(
            storage.path_for("step:read_file"),
            PathBuf::from("/tmp/state/step_read%5Ffile.json")
        );
    }

    #[test]
    fn test_path_for_keeps_keys_apart() {
        let storage = FileStorage::new("/tmp/state");
        let keys = ["step:a/b", "step:a_b", "step:a:b", "step:a\\b", "step:a%2Fb", "step_a:b"];

        let paths: std::collections::HashSet<PathBuf> =
            keys.iter().map(|k| storage.path_for(k)).collect();
        assert_eq!(paths.len(), keys.len());
    }

    #[tokio::test]
    async fn test_similar_step_ids_keep_separate_state() {
        use crate::execution::{Step, Work};
        use crate::workflow::model::Status;
        use std::sync::Arc;

        let temp_dir = tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp_dir.path()));

        let work = Work::new("w").with_storage(Arc::clone(&storage));
        work.add(Step::from_fn("a/b", |x| Ok(x)))
            .add(Step::from_fn("a_b", |_| Err("boom".into())));
        assert!(work.run(json!(1)).await.is_err());

        let stored = storage.get("step:a/b").await.unwrap().unwrap();
        assert_eq!(stored["id"], "a/b");
        assert_eq!(stored["status"], "success");

        // A fresh process picks up the settled step instead of rerunning it
        let fresh = Step::from_fn("a/b", |x| Ok(x)).with_storage(Arc::clone(&storage));
        assert!(fresh.auto_restore().await.unwrap());
        assert_eq!(fresh.status(), Status::Success);
    }

    #[tokio::test]
    async fn test_file_storage_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let storage = FileStorage::new(temp_dir.path().join("state"));

        let value = json!({"id": "w1", "type": "work", "status": "success", "steps": []});
        storage.set("work:w1", value.clone()).await.unwrap();

        assert!(temp_dir.path().join("state/work_w1.json").exists());
        assert_eq!(storage.get("work:w1").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn test_file_storage_get_missing() {
        let temp_dir = tempdir().unwrap();
        let storage = FileStorage::new(temp_dir.path());

        assert!(storage.get("step:nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_delete() {
        let temp_dir = tempdir().unwrap();
        let storage = FileStorage::new(temp_dir.path());

        storage.set("step:s1", json!(1)).await.unwrap();
        storage.delete("step:s1").await.unwrap();
        assert!(!storage.path_for("step:s1").exists());

        // Should not error when deleting a non-existent file
        assert!(storage.delete("step:s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_file_storage_corrupt_file() {
        let temp_dir = tempdir().unwrap();
        let storage = FileStorage::new(temp_dir.path());

        std::fs::write(storage.path_for("step:bad"), "not json {").unwrap();
        let err = storage.get("step:bad").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.to_string().contains("step_bad.json"));
    }
}
