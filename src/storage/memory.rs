//! In-memory storage implementation for testing and ephemeral engines.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::traits::{
    FileMetadata, Storage, StorageConfig, StorageError, StorageInput, StorageOutput,
};

type FileMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// An in-memory storage implementation.
///
/// Writes go straight into the shared file map, so bytes written before a
/// simulated crash (dropping every engine handle without a clean shutdown)
/// are still visible to the next engine opened on a clone of this storage.
/// Cloning shares the underlying files.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    files: FileMap,
    #[allow(dead_code)]
    config: StorageConfig,
    closed: Arc<AtomicBool>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::new())),
            config,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Check if the storage is closed.
    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    /// Mark the storage closed; every later operation fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(data.clone())))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        self.files.lock().insert(name.to_string(), Vec::new());
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
            0,
        )))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let position = {
            let mut files = self.files.lock();
            files.entry(name.to_string()).or_default().len() as u64
        };
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
            position,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut file_names: Vec<String> = self.files.lock().keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn metadata(&self, name: &str) -> Result<FileMetadata> {
        let size = self.file_size(name)?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Ok(FileMetadata {
            size,
            modified: now,
            created: now,
            readonly: false,
        })
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn truncate_file(&self, name: &str, len: u64) -> Result<()> {
        self.check_closed()?;

        let mut files = self.files.lock();
        let data = files
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        data.truncate(len as usize);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()
    }
}

/// A memory-based input implementation over a snapshot of the file.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Vec<u8>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output that writes through to the shared file map.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    files: FileMap,
    position: u64,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap, position: u64) -> Self {
        MemoryOutput {
            name,
            files,
            position,
            closed: false,
        }
    }

    fn current_len(&self) -> u64 {
        self.files
            .lock()
            .get(&self.name)
            .map(|data| data.len() as u64)
            .unwrap_or(0)
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let mut files = self.files.lock();
        let data = files
            .get_mut(&self.name)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "file was deleted"))?;

        let start = self.position as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let len = self.current_len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => len + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };

        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Invalid seek position",
            ));
        }

        self.position = target as u64;
        Ok(self.position)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_storage_creation() {
        let storage = MemoryStorage::new_default();
        assert_eq!(storage.file_count(), 0);
        assert_eq!(storage.total_size(), 0);
    }

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("test.txt").unwrap();
        output.write_all(b"Hello, Memory!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, Memory!");
        assert_eq!(input.size().unwrap(), 14);
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.total_size(), 14);
    }

    #[test]
    fn test_writes_visible_before_close() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output_append("wal.log").unwrap();
        output.write_all(b"frame-1").unwrap();

        assert_eq!(storage.read_bytes("wal.log").unwrap(), b"frame-1");

        // A clone shares the same files.
        let reopened = storage.clone();
        drop(output);
        assert_eq!(reopened.file_size("wal.log").unwrap(), 7);
    }

    #[test]
    fn test_file_operations() {
        let storage = MemoryStorage::new_default();

        assert!(!storage.file_exists("nonexistent.txt"));

        storage.write_atomic("test.txt", b"Test content").unwrap();
        assert!(storage.file_exists("test.txt"));
        assert!(!storage.file_exists("test.txt.tmp"));
        assert_eq!(storage.file_size("test.txt").unwrap(), 12);
        assert_eq!(storage.list_files().unwrap(), vec!["test.txt"]);

        storage.rename_file("test.txt", "renamed.txt").unwrap();
        assert!(!storage.file_exists("test.txt"));
        assert!(storage.file_exists("renamed.txt"));

        storage.truncate_file("renamed.txt", 4).unwrap();
        assert_eq!(storage.read_bytes("renamed.txt").unwrap(), b"Test");

        storage.delete_file("renamed.txt").unwrap();
        assert!(!storage.file_exists("renamed.txt"));
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_seek_and_overwrite() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("segment.seg").unwrap();
        output.write_all(b"0123456789").unwrap();
        output.seek(SeekFrom::Start(2)).unwrap();
        output.write_all(b"ab").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("segment.seg").unwrap();
        input.seek(SeekFrom::End(-8)).unwrap();
        let mut buffer = [0u8; 3];
        input.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer, b"ab4");
    }

    #[test]
    fn test_file_not_found() {
        let storage = MemoryStorage::new_default();

        assert!(storage.open_input("nonexistent.txt").is_err());
        assert!(storage.file_size("nonexistent.txt").is_err());
        assert!(storage.truncate_file("nonexistent.txt", 0).is_err());
    }

    #[test]
    fn test_storage_close() {
        let storage = MemoryStorage::new_default();

        storage.close();
        assert!(storage.create_output("test.txt").is_err());
    }
}
