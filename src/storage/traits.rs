//! Storage abstraction trait and common types.

use std::io::{Read, Seek, Write};

use serde::{Deserialize, Serialize};

use crate::error::{QuiverError, Result};

/// File metadata information.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes.
    pub size: u64,

    /// Last modified time (seconds since epoch).
    pub modified: u64,

    /// Creation time (seconds since epoch).
    pub created: u64,

    /// Whether the file is read-only.
    pub readonly: bool,
}

/// A trait for storage backends that can store and retrieve data.
///
/// Names are `/`-separated relative paths. Every engine component (manifests,
/// segments, write-ahead logs, the catalog) goes through this interface, so a
/// whole engine can run against [`MemoryStorage`](crate::storage::MemoryStorage)
/// in tests and against [`FileStorage`](crate::storage::FileStorage) in production.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any previous content.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Create a file for appending.
    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, recursively, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Get file metadata.
    fn metadata(&self, name: &str) -> Result<FileMetadata>;

    /// Rename a file, replacing the destination atomically when it exists.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Cut a file down to `len` bytes.
    fn truncate_file(&self, name: &str, len: u64) -> Result<()>;

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;

    /// Read a whole file into memory.
    fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        let mut buffer = Vec::with_capacity(input.size()? as usize);
        input.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Replace `name` with `bytes` so that readers observe either the old or the
    /// new content, never a mixture.
    ///
    /// The content goes to `<name>.tmp` first, is synced, and is then renamed
    /// over `name`.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let temp_name = format!("{name}.tmp");
        {
            let mut output = self.create_output(&temp_name)?;
            output.write_all(bytes)?;
            output.flush_and_sync()?;
            output.close()?;
        }
        self.rename_file(&temp_name, name)
    }
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream.
    fn close(&mut self) -> Result<()>;
}

// Implement StorageOutput for Box<dyn StorageOutput> to allow trait objects
impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

// Implement StorageInput for Box<dyn StorageInput> to allow trait objects
impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// Configuration for storage backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Buffer size for I/O operations.
    pub buffer_size: usize,

    /// Whether to flush the OS buffer on every write call.
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            buffer_size: 65536, // 64KB buffer for better I/O performance
            sync_writes: false,
        }
    }
}

impl StorageConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(QuiverError::invalid_config(
                "storage.buffer_size must be > 0",
            ));
        }
        Ok(())
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// Permission denied.
    PermissionDenied(String),

    /// I/O error.
    IoError(String),

    /// Storage is closed.
    StorageClosed,

    /// Invalid file name.
    InvalidName(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::PermissionDenied(name) => write!(f, "Permission denied: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::StorageClosed => write!(f, "Storage is closed"),
            StorageError::InvalidName(name) => write!(f, "Invalid file name: {name}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for QuiverError {
    fn from(err: StorageError) -> Self {
        QuiverError::storage(err.to_string())
    }
}

/// Map an `io::Error` raised while touching `name` onto a [`StorageError`].
pub(crate) fn map_io_error(name: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StorageError::FileNotFound(name.to_string()),
        std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(name.to_string()),
        _ => StorageError::IoError(format!("{name}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();

        assert_eq!(config.buffer_size, 65536);
        assert!(!config.sync_writes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("MANIFEST".to_string());
        assert_eq!(err.to_string(), "File not found: MANIFEST");

        let err = StorageError::StorageClosed;
        assert_eq!(err.to_string(), "Storage is closed");

        let err = StorageError::InvalidName("../escape".to_string());
        assert_eq!(err.to_string(), "Invalid file name: ../escape");
    }

    #[test]
    fn test_storage_error_converts_to_io_kind() {
        let err: QuiverError = StorageError::IoError("disk full".to_string()).into();
        assert!(err.is_io());
    }
}
