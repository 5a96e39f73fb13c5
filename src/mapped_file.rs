//! Growable memory-mapped file regions
//!
//! Each storage file is mapped read-write for the lifetime of the shard and
//! grown in place when a write would land past the mapped length: flush the
//! old mapping, extend the file with zeros, remap. Growth is geometric and
//! the resulting length is kept a multiple of the 1 MiB file unit.

use anyhow::{Context, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Initial size of every storage file, and the unit file lengths are rounded
/// up to when growing.
pub const FILE_UNIT: u64 = 1024 * 1024;

/// A read-write memory mapping over a single storage file.
pub struct MappedFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
}

impl MappedFile {
    /// Open `path`, creating it as a zero-filled 1 MiB file if it does not
    /// exist yet. Returns the mapping together with whether the file was
    /// freshly created, so the caller knows to initialise its header.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, bool)> {
        let path = path.as_ref().to_path_buf();
        let created = !path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open storage file {}", path.display()))?;

        if created {
            file.set_len(FILE_UNIT)
                .with_context(|| format!("failed to size new storage file {}", path.display()))?;
        }

        // SAFETY: the shard exclusively owns its storage files for the
        // lifetime of the process; no other mapping of this file exists.
        let mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .with_context(|| format!("failed to memory-map {}", path.display()))?
        };

        Ok((Self { path, file, mmap }, created))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    /// Bounds-checked read of `len` bytes starting at `offset`. Returns
    /// `None` when the range is not fully mapped; the storage layer turns
    /// that into its fatal short-read error.
    pub fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.mmap.get(offset..end)
    }

    /// The whole mapped region. Record decoding takes this and does its own
    /// bounds checking while walking variable-length payloads.
    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Grow the mapping so that the region strictly contains `end`.
    ///
    /// The file is extended by `2 * (end - size) + size / 2` zero bytes and
    /// the new length rounded up to the next [`FILE_UNIT`] boundary, then the
    /// region is remapped. Callers holding offsets into the old mapping must
    /// re-resolve them through the new one.
    pub fn ensure_len(&mut self, end: usize) -> Result<()> {
        if self.mmap.len() > end {
            return Ok(());
        }

        let size = self.mmap.len();
        let grown = size + (end - size) * 2 + size / 2;
        let new_len = (grown as u64).div_ceil(FILE_UNIT) * FILE_UNIT;

        self.mmap
            .flush()
            .with_context(|| format!("failed to flush {} before growth", self.path.display()))?;
        self.file
            .set_len(new_len)
            .with_context(|| format!("failed to extend {} to {}", self.path.display(), new_len))?;

        // SAFETY: same exclusive-ownership argument as in `open`.
        self.mmap = unsafe {
            MmapOptions::new()
                .map_mut(&self.file)
                .with_context(|| format!("failed to remap {}", self.path.display()))?
        };

        debug!(
            file = %self.path.display(),
            old_len = size,
            new_len = self.mmap.len(),
            "grew storage file"
        );
        debug_assert!(self.mmap.len() > end);
        Ok(())
    }

    /// Write `bytes` at `offset`, growing the region first if needed.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len();
        self.ensure_len(end)?;
        self.mmap[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Flush dirty pages back to the file.
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_file_is_one_unit_of_zeros() {
        let dir = TempDir::new().unwrap();
        let (mapped, created) = MappedFile::open(dir.path().join("t.bin")).unwrap();
        assert!(created);
        assert_eq!(mapped.len(), FILE_UNIT as usize);
        assert!(mapped.slice(0, 4).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reopen_reports_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        {
            let (mut mapped, _) = MappedFile::open(&path).unwrap();
            mapped.write_at(100, b"persisted").unwrap();
            mapped.flush().unwrap();
        }
        let (mapped, created) = MappedFile::open(&path).unwrap();
        assert!(!created);
        assert_eq!(mapped.slice(100, 9).unwrap(), b"persisted");
    }

    #[test]
    fn test_growth_preserves_written_bytes() {
        let dir = TempDir::new().unwrap();
        let (mut mapped, _) = MappedFile::open(dir.path().join("t.bin")).unwrap();

        mapped.write_at(17, b"early write").unwrap();
        let far = 3 * FILE_UNIT as usize + 123;
        mapped.write_at(far, b"late write").unwrap();

        assert!(mapped.len() > far + 10);
        assert_eq!(mapped.len() % FILE_UNIT as usize, 0);
        assert_eq!(mapped.slice(17, 11).unwrap(), b"early write");
        assert_eq!(mapped.slice(far, 10).unwrap(), b"late write");
    }

    #[test]
    fn test_slice_past_end_is_none() {
        let dir = TempDir::new().unwrap();
        let (mapped, _) = MappedFile::open(dir.path().join("t.bin")).unwrap();
        let len = mapped.len();
        assert!(mapped.slice(len - 2, 4).is_none());
        assert!(mapped.slice(len, 1).is_none());
        assert!(mapped.slice(0, len).is_some());
    }
}
