use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::PathBuf,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Flat file store addressed by absolute-looking paths such as `/temperature_log.txt`.
pub trait Storage {
    fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    /// Truncates and rewrites the file.
    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    /// Returns whether a file was actually removed.
    fn remove(&mut self, path: &str) -> Result<bool, StorageError>;
    fn exists(&self, path: &str) -> bool;
}

/// Storage rooted at a directory on a mounted filesystem (a host directory, or the
/// SPIFFS mount point on the device).
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn ensure_parent(&self, path: &str, full: &std::path::Path) -> Result<(), StorageError> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Open {
                path: path.to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

impl Storage for FsStorage {
    fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path);
        self.ensure_parent(path, &full)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .map_err(|source| StorageError::Open {
                path: path.to_string(),
                source,
            })?;
        file.write_all(bytes).map_err(|source| StorageError::Write {
            path: path.to_string(),
            source,
        })
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path);
        self.ensure_parent(path, &full)?;
        fs::write(&full, bytes).map_err(|source| StorageError::Write {
            path: path.to_string(),
            source,
        })
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(source) => Err(StorageError::Read {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn remove(&mut self, path: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Remove {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }
}

/// In-memory store for simulations and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, path: &str) -> Option<&str> {
        self.files
            .get(path)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

impl Storage for MemoryStorage {
    fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.files
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn remove(&mut self, path: &str) -> Result<bool, StorageError> {
        Ok(self.files.remove(path).is_some())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Memory store whose writes, or removal of one path, fail with an I/O error.
    #[derive(Default)]
    pub(crate) struct FailingStorage {
        pub inner: MemoryStorage,
        pub fail_writes: bool,
        pub fail_remove: Option<&'static str>,
    }

    impl FailingStorage {
        pub fn rejecting_writes() -> Self {
            Self {
                fail_writes: true,
                ..Self::default()
            }
        }

        pub fn rejecting_removal_of(path: &'static str) -> Self {
            Self {
                fail_remove: Some(path),
                ..Self::default()
            }
        }
    }

    fn disk_full() -> std::io::Error {
        std::io::Error::new(ErrorKind::Other, "no space left on device")
    }

    impl Storage for FailingStorage {
        fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
            if self.fail_writes {
                return Err(StorageError::Write {
                    path: path.to_string(),
                    source: disk_full(),
                });
            }
            self.inner.append(path, bytes)
        }

        fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
            if self.fail_writes {
                return Err(StorageError::Write {
                    path: path.to_string(),
                    source: disk_full(),
                });
            }
            self.inner.write(path, bytes)
        }

        fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.read(path)
        }

        fn remove(&mut self, path: &str) -> Result<bool, StorageError> {
            if self.fail_remove == Some(path) {
                return Err(StorageError::Remove {
                    path: path.to_string(),
                    source: disk_full(),
                });
            }
            self.inner.remove(path)
        }

        fn exists(&self, path: &str) -> bool {
            self.inner.exists(path)
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "templog-storage-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn fs_storage_appends_and_rewrites() {
        let dir = scratch_dir("append");
        let mut storage = FsStorage::new(&dir);

        storage.append("/log.txt", b"a\n").unwrap();
        storage.append("/log.txt", b"b\n").unwrap();
        assert_eq!(storage.read("/log.txt").unwrap(), b"a\nb\n");

        storage.write("/log.txt", b"c\n").unwrap();
        assert_eq!(storage.read("/log.txt").unwrap(), b"c\n");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fs_storage_reports_missing_files() {
        let dir = scratch_dir("missing");
        let mut storage = FsStorage::new(&dir);

        assert!(!storage.exists("/nope.txt"));
        assert!(matches!(
            storage.read("/nope.txt"),
            Err(StorageError::NotFound(_))
        ));
        assert!(!storage.remove("/nope.txt").unwrap());
    }

    #[test]
    fn fs_storage_remove_reports_removal() {
        let dir = scratch_dir("remove");
        let mut storage = FsStorage::new(&dir);

        storage.write("/data.csv", b"x").unwrap();
        assert!(storage.exists("/data.csv"));
        assert!(storage.remove("/data.csv").unwrap());
        assert!(!storage.exists("/data.csv"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn memory_storage_behaves_like_files() {
        let mut storage = MemoryStorage::new();
        storage.append("/a", b"1").unwrap();
        storage.append("/a", b"2").unwrap();
        assert_eq!(storage.contents("/a"), Some("12"));
        assert!(storage.remove("/a").unwrap());
        assert!(!storage.remove("/a").unwrap());
    }
}
