//! Database directory management.
//!
//! File system layout:
//!
//! ```text
//! <db_path>/
//! ├─ MANIFEST          # Schema version and database identity
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ store.log         # Record log (documents, tasks, mapped results)
//! ├─ definitions/      # One JSON file per index definition
//! └─ indexes/
//!    └─ <index>/       # Generation files, one per published snapshot
//! ```
//!
//! The LOCK file ensures only one process opens the database at a time.

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "store.log";
const DEFINITIONS_DIR: &str = "definitions";
const INDEXES_DIR: &str = "indexes";
/// Temporary file for atomic manifest writes.
const MANIFEST_TEMP: &str = "MANIFEST.tmp";

/// Manages the database directory structure and file locking.
///
/// Holds an exclusive advisory lock on the directory; only one
/// `DatabaseDir` instance can exist per directory at a time.
#[derive(Debug)]
pub struct DatabaseDir {
    /// Root directory path.
    path: PathBuf,
    /// Lock file handle, held for exclusive access.
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the record log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Returns the directory holding index definition files.
    #[must_use]
    pub fn definitions_dir(&self) -> PathBuf {
        self.path.join(DEFINITIONS_DIR)
    }

    /// Returns the directory holding one subdirectory per index.
    #[must_use]
    pub fn indexes_dir(&self) -> PathBuf {
        self.path.join(INDEXES_DIR)
    }

    /// Returns the snapshot directory for a single index, creating it if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn index_dir(&self, encoded_name: &str) -> CoreResult<PathBuf> {
        let dir = self.indexes_dir().join(encoded_name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Removes the snapshot directory for an index, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub fn remove_index_dir(&self, encoded_name: &str) -> CoreResult<()> {
        let dir = self.indexes_dir().join(encoded_name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            self.sync_directory_at(&self.indexes_dir())?;
        }
        Ok(())
    }

    /// Loads the manifest from disk.
    ///
    /// Returns `None` if the manifest file doesn't exist (new database).
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or when the file is not a valid
    /// manifest.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        let manifest_path = self.manifest_path();

        if !manifest_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&manifest_path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if data.is_empty() {
            return Ok(None);
        }

        let manifest = Manifest::decode(&data)?;
        Ok(Some(manifest))
    }

    /// Saves the manifest to disk atomically.
    ///
    /// Uses write-then-rename for crash safety, then fsyncs the directory
    /// so the rename itself is durable.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        let manifest_path = self.manifest_path();
        let temp_path = self.path.join(MANIFEST_TEMP);

        let data = manifest.encode()?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &manifest_path)?;
        self.sync_directory_at(&self.path)?;

        Ok(())
    }

    /// Checks if this is a new (empty) database directory.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        !self.manifest_path().exists() && !self.log_path().exists()
    }

    /// Fsyncs a directory so entry creations, renames, and deletions are
    /// durable. Directory fsync is a no-op on non-Unix platforms, where the
    /// filesystem journal covers metadata.
    #[cfg(unix)]
    pub fn sync_directory_at(&self, dir: &Path) -> CoreResult<()> {
        let handle = File::open(dir)?;
        handle.sync_all()?;
        Ok(())
    }

    /// Fsyncs a directory so entry creations, renames, and deletions are
    /// durable. Directory fsync is a no-op on non-Unix platforms, where the
    /// filesystem journal covers metadata.
    #[cfg(not(unix))]
    pub fn sync_directory_at(&self, _dir: &Path) -> CoreResult<()> {
        Ok(())
    }
}

/// Encodes an index name into a filesystem-safe file or directory name.
///
/// Alphanumerics, `-`, `_`, and `.` pass through; everything else becomes
/// `%XX`. The encoding is injective, so distinct index names never collide
/// on disk.
#[must_use]
pub fn encode_index_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}
