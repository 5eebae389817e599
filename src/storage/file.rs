use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use crate::storage::error::{io_error, StorageResult};
use crate::storage::KeyValueStore;

/// Stores each key in its own file under a base directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    base_dir: Arc<PathBuf>,
}

impl FileStore {
    pub fn new(base_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|err| {
            io_error(format!(
                "Failed to create local storage directory '{}': {}",
                base_dir.display(),
                err
            ))
        })?;
        Ok(Self {
            base_dir: Arc::new(base_dir),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let encoded = percent_encode(key.as_bytes(), NON_ALPHANUMERIC).to_string();
        self.base_dir.join(format!("{encoded}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.file_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(format!(
                "Failed to read local storage entry '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.file_for(key);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value.as_bytes())
            .and_then(|_| fs::rename(&staging, &path))
            .map_err(|err| {
                io_error(format!(
                    "Failed to write local storage entry '{}': {}",
                    path.display(),
                    err
                ))
            })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.file_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(format!(
                "Failed to remove local storage entry '{}': {}",
                path.display(),
                err
            ))),
        }
    }
}
