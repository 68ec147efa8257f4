use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ProfileError, Result};

const STORAGE_VERSION: i32 = 1;

/// String-typed key/value storage backing the field store across
/// process restarts.
pub trait Persistence: Send {
    fn string(&self, key: &str) -> Option<String>;

    /// Store a value, or remove the key when `value` is `None`.
    fn set_string(&mut self, key: &str, value: Option<&str>) -> Result<()>;

    /// Remove every persisted entry.
    fn erase(&mut self) -> Result<()>;
}

/// Volatile storage, lost with the process.
#[derive(Default)]
pub struct MemoryStorage {
    entries: BTreeMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStorage {
    fn string(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set_string(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                self.entries
                    .insert(key.to_owned(), value.to_owned());
            }
            None => {
                self.entries.remove(key);
            }
        }
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// JSON document on disk, rewritten on every change.
pub struct FileStorage {
    label: String,
    path: PathBuf,
    data: FileStorageData,
}

#[derive(Serialize, Deserialize)]
struct FileStorageData {
    version: i32,
    entries: BTreeMap<String, String>,
}

impl FileStorage {
    /// Open the storage at `path`, loading entries if the file exists.
    pub fn open(label: String, path: &Path) -> Result<Self> {
        let mut storage = Self {
            label,
            path: PathBuf::from(path),
            data: FileStorageData {
                version: STORAGE_VERSION,
                entries: BTreeMap::new(),
            },
        };
        if storage.path.exists() {
            storage.data.entries = storage.read_fs()?;
        }
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_fs(&self) -> Result<BTreeMap<String, String>> {
        let file = File::open(&self.path)?;
        let data: FileStorageData = serde_json::from_reader(file)
            .map_err(|err| {
                ProfileError::Storage(self.label.clone(), err.to_string())
            })?;
        if data.version != STORAGE_VERSION {
            return Err(ProfileError::Storage(
                self.label.clone(),
                format!(
                    "Storage version mismatch: expected {}, got {}",
                    STORAGE_VERSION, data.version
                ),
            ));
        }
        log::info!(
            "file-storage/{}: {} entries have been read",
            self.label,
            data.entries.len()
        );
        Ok(data.entries)
    }

    fn write_fs(&self) -> Result<()> {
        let parent_dir = self.path.parent().ok_or_else(|| {
            ProfileError::Storage(
                self.label.clone(),
                "Failed to get parent directory".to_owned(),
            )
        })?;
        fs::create_dir_all(parent_dir)?;

        // write beside the target, then move over it
        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &self.data)?;
            writer.flush()?;
        }
        fs::rename(&temp_path, &self.path)?;

        log::debug!(
            "file-storage/{}: {} entries have been written",
            self.label,
            self.data.entries.len()
        );
        Ok(())
    }
}

impl Persistence for FileStorage {
    fn string(&self, key: &str) -> Option<String> {
        self.data.entries.get(key).cloned()
    }

    fn set_string(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                self.data
                    .entries
                    .insert(key.to_owned(), value.to_owned());
            }
            None => {
                self.data.entries.remove(key);
            }
        }
        self.write_fs()
    }

    fn erase(&mut self) -> Result<()> {
        self.data.entries.clear();
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|err| {
                ProfileError::Storage(self.label.clone(), err.to_string())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn file_storage_survives_reopen() {
        let temp_dir = TempDir::new("profilelib_test").unwrap();
        let path = temp_dir.path().join("defaults.json");

        let mut storage =
            FileStorage::open("TestStorage".to_owned(), &path).unwrap();
        storage.set_string("nickname", Some("NIX")).unwrap();
        storage
            .set_string("introduction", Some("Hello"))
            .unwrap();
        storage.set_string("introduction", None).unwrap();
        drop(storage);

        let storage =
            FileStorage::open("TestStorage".to_owned(), &path).unwrap();
        assert_eq!(storage.string("nickname").as_deref(), Some("NIX"));
        assert_eq!(storage.string("introduction"), None);
    }

    #[test]
    fn file_storage_erase_removes_the_file() {
        let temp_dir = TempDir::new("profilelib_test").unwrap();
        let path = temp_dir.path().join("defaults.json");

        let mut storage =
            FileStorage::open("TestStorage".to_owned(), &path).unwrap();
        storage.set_string("nickname", Some("NIX")).unwrap();
        assert!(path.exists());

        storage.erase().unwrap();
        assert!(!path.exists());
        assert_eq!(storage.string("nickname"), None);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let temp_dir = TempDir::new("profilelib_test").unwrap();
        let path = temp_dir.path().join("defaults.json");
        fs::write(&path, r#"{"version": 99, "entries": {}}"#).unwrap();

        let result = FileStorage::open("TestStorage".to_owned(), &path);
        assert!(matches!(result, Err(ProfileError::Storage(_, _))));
    }

    #[test]
    fn memory_storage_set_and_remove() {
        let mut storage = MemoryStorage::new();
        storage.set_string("badge", Some("heart")).unwrap();
        assert_eq!(storage.string("badge").as_deref(), Some("heart"));
        storage.set_string("badge", None).unwrap();
        assert_eq!(storage.string("badge"), None);
    }
}
