#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Durable persistence of the last flushed replication position.
//!
//! The store is the one piece of state that must survive a process restart:
//! on startup the pipeline resumes streaming from whatever position was last
//! saved here, which is what makes at-least-once delivery possible.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use row::PositionMarker;

/// All the errors this crate can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The position file (or its containing directory) could not be read or written.
    #[error("position store io error at {path}: {source}")]
    Io {
        /// The path being operated on.
        path: PathBuf,
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },
    /// The on-disk position file was not valid JSON.
    #[error("position file at {path} is corrupt: {source}")]
    Decode {
        /// The path being operated on.
        path: PathBuf,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// Persists and loads the last durably-flushed replication position.
///
/// `save` is only ever called by the pipeline's consumer loop after the bulk
/// writer has successfully flushed (see the flush controller's ordering
/// invariant), never before.
pub trait PositionStore: Send + Sync {
    /// Returns the last saved position, or `None` if none has ever been
    /// saved (a fresh deployment should start from a snapshot).
    fn load(&self) -> Result<Option<PositionMarker>, Error>;

    /// Durably persists `position`. Must not return before the write is
    /// safe against a crash (atomic rename, fsync'd).
    fn save(&self, position: &PositionMarker) -> Result<(), Error>;
}

impl<T: PositionStore + ?Sized> PositionStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Option<PositionMarker>, Error> {
        (**self).load()
    }

    fn save(&self, position: &PositionMarker) -> Result<(), Error> {
        (**self).save(position)
    }
}

/// A `PositionStore` backed by a single JSON file inside `data_dir`, replaced
/// atomically (write to a temp file in the same directory, fsync it, rename
/// over the real path, then fsync the directory) on every save.
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    /// Creates a store that persists to `<data_dir>/position.json`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("position.json"),
        }
    }

    fn io_err(&self, source: std::io::Error) -> Error {
        Error::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl PositionStore for FilePositionStore {
    fn load(&self) -> Result<Option<PositionMarker>, Error> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.path).map_err(|e| self.io_err(e))?;
        let position = serde_json::from_slice(&bytes).map_err(|source| Error::Decode {
            path: self.path.clone(),
            source,
        })?;

        Ok(Some(position))
    }

    fn save(&self, position: &PositionMarker) -> Result<(), Error> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;

        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("position")
        ));

        let body = serde_json::to_vec_pretty(position).map_err(|source| Error::Decode {
            path: tmp_path.clone(),
            source,
        })?;

        {
            let mut tmp = File::create(&tmp_path).map_err(|e| self.io_err(e))?;
            tmp.write_all(&body).map_err(|e| self.io_err(e))?;
            tmp.sync_all().map_err(|e| self.io_err(e))?;
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;

        if let Ok(dir_handle) = File::open(dir) {
            let _ = dir_handle.sync_all();
        }

        tracing::debug!(log_name = %position.log_name, log_offset = position.log_offset, "position saved");

        Ok(())
    }
}

/// An in-memory `PositionStore` for tests and the in-process demo wiring.
#[derive(Default)]
pub struct MemoryPositionStore {
    inner: std::sync::Mutex<Option<PositionMarker>>,
}

impl PositionStore for MemoryPositionStore {
    fn load(&self) -> Result<Option<PositionMarker>, Error> {
        Ok(self.inner.lock().expect("position mutex poisoned").clone())
    }

    fn save(&self, position: &PositionMarker) -> Result<(), Error> {
        *self.inner.lock().expect("position mutex poisoned") = Some(position.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilePositionStore::new(dir.path());

        assert!(store.load().unwrap().is_none());

        let pos = PositionMarker {
            log_name: "bin.000002".into(),
            log_offset: 4,
            force: true,
        };
        store.save(&pos).unwrap();

        assert_eq!(store.load().unwrap(), Some(pos));
    }

    #[test]
    fn file_store_save_is_atomic_replace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilePositionStore::new(dir.path());

        store
            .save(&PositionMarker {
                log_name: "bin.000001".into(),
                log_offset: 10,
                force: false,
            })
            .unwrap();
        store
            .save(&PositionMarker {
                log_name: "bin.000001".into(),
                log_offset: 20,
                force: false,
            })
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.log_offset, 20);

        // no leftover temp file
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryPositionStore::default();
        assert!(store.load().unwrap().is_none());

        let pos = PositionMarker {
            log_name: "bin.000001".into(),
            log_offset: 1,
            force: false,
        };
        store.save(&pos).unwrap();
        assert_eq!(store.load().unwrap(), Some(pos));
    }
}
