//! File-backed config store.
//!
//! A backing file is a JSON document of typed values keyed by `\`-separated
//! paths. Loading takes an exclusive lock on the file that is held until the
//! alias is unloaded, so a second loader of the same file sees it as busy.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{ConfigStoreBackend, ConfigValue};
use crate::error::{BuildError, IoContext, Result};

const FORMAT: &str = "image-builder-hive/1";

#[derive(Debug, Serialize, Deserialize)]
struct HiveDocument {
    format: String,
    #[serde(default)]
    values: BTreeMap<String, ConfigValue>,
}

struct LoadedHive {
    path: PathBuf,
    // Holds the exclusive lock for as long as the alias is loaded.
    lock: File,
    values: BTreeMap<String, ConfigValue>,
    dirty: bool,
}

#[derive(Default)]
pub struct HiveFileBackend {
    loaded: BTreeMap<String, LoadedHive>,
}

impl HiveFileBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a new backing file holding `values`.
    pub fn create_file(path: &Path, values: &BTreeMap<String, ConfigValue>) -> Result<()> {
        let normalized = values
            .iter()
            .map(|(k, v)| (normalize_key(k), v.clone()))
            .collect();
        write_document(path, &normalized)
    }

    /// Read the values of a backing file without loading it.
    pub fn read_file(path: &Path) -> Result<BTreeMap<String, ConfigValue>> {
        let text = fs::read_to_string(path)
            .io_context(|| format!("reading config store '{}'", path.display()))?;
        let doc: HiveDocument = serde_json::from_str(&text).map_err(|err| {
            BuildError::Validation(format!(
                "config store '{}' is malformed: {err}",
                path.display()
            ))
        })?;
        if doc.format != FORMAT {
            return Err(BuildError::Validation(format!(
                "config store '{}' has unsupported format '{}'",
                path.display(),
                doc.format
            )));
        }
        Ok(doc.values)
    }

    fn hive(&self, alias: &str) -> Result<&LoadedHive> {
        self.loaded
            .get(alias)
            .ok_or_else(|| BuildError::NotLoaded(alias.to_string()))
    }

    fn write_back(hive: &mut LoadedHive) -> Result<()> {
        if hive.dirty {
            write_document(&hive.path, &hive.values)?;
            hive.dirty = false;
        }
        Ok(())
    }
}

impl ConfigStoreBackend for HiveFileBackend {
    fn load(&mut self, alias: &str, backing_file: &Path) -> Result<()> {
        if self.loaded.contains_key(alias) {
            return Err(BuildError::AlreadyLoaded(alias.to_string()));
        }
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .open(backing_file)
            .io_context(|| format!("opening config store '{}'", backing_file.display()))?;
        lock.try_lock_exclusive().map_err(|_| {
            BuildError::Busy(format!(
                "config store '{}' is loaded elsewhere",
                backing_file.display()
            ))
        })?;
        let values = Self::read_file(backing_file)?;
        self.loaded.insert(
            alias.to_string(),
            LoadedHive {
                path: backing_file.to_path_buf(),
                lock,
                values,
                dirty: false,
            },
        );
        Ok(())
    }

    fn get(&self, alias: &str, key: &str) -> Result<Option<ConfigValue>> {
        Ok(self.hive(alias)?.values.get(&normalize_key(key)).cloned())
    }

    fn set(&mut self, alias: &str, key: &str, value: ConfigValue) -> Result<()> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(BuildError::Validation("empty config store key".to_string()));
        }
        let hive = self
            .loaded
            .get_mut(alias)
            .ok_or_else(|| BuildError::NotLoaded(alias.to_string()))?;
        hive.values.insert(key, value);
        hive.dirty = true;
        Ok(())
    }

    fn export(&self, alias: &str, dest: &Path) -> Result<()> {
        let hive = self.hive(alias)?;
        let doc = HiveDocument {
            format: FORMAT.to_string(),
            values: hive.values.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|err| BuildError::io("serializing export", std::io::Error::other(err)))?;
        fs::write(dest, format!("{json}\n"))
            .io_context(|| format!("writing export '{}'", dest.display()))
    }

    fn unload(&mut self, alias: &str) -> Result<()> {
        let hive = self
            .loaded
            .get_mut(alias)
            .ok_or_else(|| BuildError::NotLoaded(alias.to_string()))?;
        Self::write_back(hive)?;
        if let Some(hive) = self.loaded.remove(alias) {
            let _ = FileExt::unlock(&hive.lock);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Vec<(String, BuildError)> {
        let mut failed = Vec::new();
        for (alias, hive) in self.loaded.iter_mut() {
            if let Err(err) = Self::write_back(hive) {
                failed.push((alias.clone(), err));
            }
        }
        failed
    }
}

/// Forward slashes become `\`; leading and trailing separators are dropped.
fn normalize_key(key: &str) -> String {
    key.replace('/', "\\").trim_matches('\\').to_string()
}

/// Write in place through a truncating open. Replacing the file by rename
/// would leave the lock on the old inode.
fn write_document(path: &Path, values: &BTreeMap<String, ConfigValue>) -> Result<()> {
    let doc = HiveDocument {
        format: FORMAT.to_string(),
        values: values.clone(),
    };
    let json = serde_json::to_string_pretty(&doc)
        .map_err(|err| BuildError::io("serializing config store", std::io::Error::other(err)))?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .io_context(|| format!("opening '{}' for write", path.display()))?;
    file.write_all(json.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .and_then(|()| file.sync_all())
        .io_context(|| format!("writing config store '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hive_file(tmp: &TempDir) -> PathBuf {
        let path = tmp.path().join("SOFTWARE");
        let mut values = BTreeMap::new();
        values.insert(
            "Microsoft/Windows NT/CurrentVersion\\ProductName".to_string(),
            ConfigValue::String("Windows".into()),
        );
        HiveFileBackend::create_file(&path, &values).unwrap();
        path
    }

    #[test]
    fn keys_are_normalized() {
        let tmp = TempDir::new().unwrap();
        let path = hive_file(&tmp);
        let mut backend = HiveFileBackend::new();
        backend.load("SW", &path).unwrap();
        assert_eq!(
            backend
                .get("SW", "\\Microsoft\\Windows NT\\CurrentVersion\\ProductName")
                .unwrap(),
            Some(ConfigValue::String("Windows".into()))
        );
    }

    #[test]
    fn second_load_of_same_file_is_busy() {
        let tmp = TempDir::new().unwrap();
        let path = hive_file(&tmp);
        let mut first = HiveFileBackend::new();
        first.load("A", &path).unwrap();

        let mut second = HiveFileBackend::new();
        let err = second.load("B", &path).unwrap_err();
        assert!(err.is_retryable());

        first.unload("A").unwrap();
        second.load("B", &path).unwrap();
    }

    #[test]
    fn unload_writes_only_when_dirty() {
        let tmp = TempDir::new().unwrap();
        let path = hive_file(&tmp);
        let before = fs::read(&path).unwrap();

        let mut backend = HiveFileBackend::new();
        backend.load("SW", &path).unwrap();
        backend.unload("SW").unwrap();
        assert_eq!(fs::read(&path).unwrap(), before);

        backend.load("SW", &path).unwrap();
        backend
            .set("SW", "Setup\\OOBEInProgress", ConfigValue::Numeric64(1))
            .unwrap();
        backend.unload("SW").unwrap();
        let values = HiveFileBackend::read_file(&path).unwrap();
        assert_eq!(
            values.get("Setup\\OOBEInProgress"),
            Some(&ConfigValue::Numeric64(1))
        );
    }

    #[test]
    fn malformed_file_is_a_validation_failure() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken");
        fs::write(&path, "not json").unwrap();
        let err = HiveFileBackend::read_file(&path).unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }
}
