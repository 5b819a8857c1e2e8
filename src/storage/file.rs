//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::error::{QuiverError, Result};
use crate::storage::traits::{
    FileMetadata, Storage, StorageConfig, StorageError, StorageInput, StorageOutput, map_io_error,
};

/// A file-based storage implementation rooted at one directory.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: StorageConfig,
    /// Whether the storage is closed.
    closed: AtomicBool,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| QuiverError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(QuiverError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage {
            directory,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// The root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Mark the storage closed; every later operation fails.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Get the full path for a file name, rejecting names that escape the root.
    fn file_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(StorageError::InvalidName(name.to_string()).into());
        }
        Ok(self.directory.join(relative))
    }

    /// Check if the storage is closed.
    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::IoError(format!("Failed to create directory: {e}")))?;
            }
        }
        Ok(())
    }

    fn collect_files(&self, dir: &Path, files: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir).map_err(|e| StorageError::IoError(e.to_string()))? {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_dir() {
                self.collect_files(&path, files)?;
            } else if path.is_file() {
                if let Ok(relative) = path.strip_prefix(&self.directory) {
                    let name = relative
                        .components()
                        .filter_map(|c| c.as_os_str().to_str())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push(name);
                }
            }
        }
        Ok(())
    }

    /// Remove now-empty parent directories up to (not including) the root.
    fn prune_empty_dirs(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.directory || !dir.starts_with(&self.directory) {
                break;
            }
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    #[cfg(unix)]
    fn sync_parent(path: &Path) {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    #[cfg(not(unix))]
    fn sync_parent(_path: &Path) {}
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let path = self.file_path(name)?;
        let file = File::open(&path).map_err(|e| map_io_error(name, e))?;

        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let path = self.file_path(name)?;
        self.ensure_parent(&path)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| map_io_error(name, e))?;

        Ok(Box::new(FileOutput::new(
            file,
            0,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let path = self.file_path(name)?;
        self.ensure_parent(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| map_io_error(name, e))?;
        let position = file
            .metadata()
            .map_err(|e| map_io_error(name, e))?
            .len();

        Ok(Box::new(FileOutput::new(
            file,
            position,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }

        self.file_path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        let path = self.file_path(name)?;
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::IoError(format!("Failed to delete file: {e}")))?;
            self.prune_empty_dirs(&path);
        }

        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut files = Vec::new();
        self.collect_files(&self.directory, &mut files)?;
        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let path = self.file_path(name)?;
        let metadata = path.metadata().map_err(|e| map_io_error(name, e))?;

        Ok(metadata.len())
    }

    fn metadata(&self, name: &str) -> Result<FileMetadata> {
        self.check_closed()?;

        let path = self.file_path(name)?;
        let metadata = path.metadata().map_err(|e| map_io_error(name, e))?;

        let modified = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let created = metadata
            .created()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Ok(FileMetadata {
            size: metadata.len(),
            modified,
            created,
            readonly: metadata.permissions().readonly(),
        })
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        let old_path = self.file_path(old_name)?;
        let new_path = self.file_path(new_name)?;
        self.ensure_parent(&new_path)?;

        std::fs::rename(&old_path, &new_path)
            .map_err(|e| StorageError::IoError(format!("Failed to rename file: {e}")))?;
        Self::sync_parent(&new_path);

        Ok(())
    }

    fn truncate_file(&self, name: &str, len: u64) -> Result<()> {
        self.check_closed()?;

        let path = self.file_path(name)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| map_io_error(name, e))?;
        file.set_len(len).map_err(|e| map_io_error(name, e))?;
        file.sync_all().map_err(|e| map_io_error(name, e))?;

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()?;
        // Individual files are synced through StorageOutput::flush_and_sync.
        Ok(())
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(|e| QuiverError::storage(format!("Failed to get file metadata: {e}")))?;

        let size = metadata.len();
        let reader = BufReader::with_capacity(buffer_size, file);

        Ok(FileInput { reader, size })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        // The file is closed when the BufReader is dropped.
        Ok(())
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
}

impl FileOutput {
    fn new(file: File, position: u64, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = self.writer.seek(pos)?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| QuiverError::storage(format!("Failed to flush: {e}")))?;

        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| QuiverError::storage(format!("Failed to sync: {e}")))?;

        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig::default();
        let storage = FileStorage::new(temp_dir.path(), config).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("test.bin").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        output.close().unwrap();

        let bytes = storage.read_bytes("test.bin").unwrap();
        assert_eq!(bytes, b"Hello, World!");
        assert_eq!(storage.file_size("test.bin").unwrap(), 13);
    }

    #[test]
    fn test_nested_names_and_recursive_listing() {
        let (_temp_dir, storage) = create_test_storage();

        storage.write_atomic("collections/a/MANIFEST", b"{}").unwrap();
        storage.write_atomic("catalog.json", b"[]").unwrap();

        let files = storage.list_files().unwrap();
        assert_eq!(
            files,
            vec!["catalog.json".to_string(), "collections/a/MANIFEST".to_string()]
        );

        storage.delete_file("collections/a/MANIFEST").unwrap();
        assert!(!storage.directory().join("collections/a").exists());
    }

    #[test]
    fn test_append_continues_position() {
        let (_temp_dir, storage) = create_test_storage();

        {
            let mut output = storage.create_output_append("wal.log").unwrap();
            output.write_all(b"abc").unwrap();
            output.close().unwrap();
        }
        let mut output = storage.create_output_append("wal.log").unwrap();
        assert_eq!(output.position().unwrap(), 3);
        output.write_all(b"def").unwrap();
        output.close().unwrap();

        assert_eq!(storage.read_bytes("wal.log").unwrap(), b"abcdef");
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let (_temp_dir, storage) = create_test_storage();

        storage.write_atomic("MANIFEST", b"first").unwrap();
        storage.write_atomic("MANIFEST", b"second").unwrap();

        assert_eq!(storage.read_bytes("MANIFEST").unwrap(), b"second");
        assert!(!storage.file_exists("MANIFEST.tmp"));
    }

    #[test]
    fn test_truncate_file() {
        let (_temp_dir, storage) = create_test_storage();

        storage.write_atomic("segment.seg", b"0123456789").unwrap();
        storage.truncate_file("segment.seg", 4).unwrap();

        assert_eq!(storage.read_bytes("segment.seg").unwrap(), b"0123");
    }

    #[test]
    fn test_rejects_escaping_names() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(storage.create_output("../outside").is_err());
        assert!(storage.open_input("/etc/passwd").is_err());
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(storage.open_input("nonexistent.bin").is_err());
        assert!(storage.file_size("nonexistent.bin").is_err());
        assert!(storage.delete_file("nonexistent.bin").is_ok());
    }

    #[test]
    fn test_storage_close() {
        let (_temp_dir, storage) = create_test_storage();

        storage.close();
        assert!(storage.create_output("test.bin").is_err());
    }
}
