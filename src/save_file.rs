//! The on-disk scratch arena for spilled vertex data.
//!
//! One [`SaveFile`] is shared by every disk-tier buffer. Writes place a byte
//! run at an allocator-chosen offset and return a [`SaveBlock`]; reads fetch
//! a block's bytes back; freeing a block returns its range to a first-fit
//! free list with coalescing. The file is pure scratch: it is created fresh
//! on startup and deleted when the save file drops.

use parking_lot::Mutex;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// An allocator-assigned (offset, length) pair inside the save file.
///
/// Blocks are move-only: the owning buffer hands the block back to
/// [`SaveFile::free`] exactly once.
#[derive(Debug)]
pub struct SaveBlock {
    offset: u64,
    size: usize,
}

impl SaveBlock {
    /// Byte offset of the block within the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the block in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

struct FreeRange {
    offset: u64,
    size: u64,
}

struct SaveInner {
    file: NamedTempFile,
    // Sorted by offset; adjacent ranges are always coalesced.
    free: Vec<FreeRange>,
    // High-water mark: every byte at or past this offset is unallocated.
    end: u64,
}

/// A single scratch file with a first-fit free-list allocator.
pub struct SaveFile {
    max_size: Option<u64>,
    inner: Mutex<SaveInner>,
}

impl SaveFile {
    /// Create the scratch file in `directory` with the given filename
    /// prefix. `max_size` of `None` lets the file grow without bound.
    pub fn new(directory: &Path, prefix: &str, max_size: Option<u64>) -> io::Result<SaveFile> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".vdata")
            .tempfile_in(directory)?;
        debug!(path = %file.path().display(), "created vertex data save file");
        Ok(SaveFile {
            max_size,
            inner: Mutex::new(SaveInner {
                file,
                free: Vec::new(),
                end: 0,
            }),
        })
    }

    /// Write `data` at an allocator-chosen offset.
    ///
    /// Returns `Ok(None)` when placing the bytes would push the file past
    /// its configured maximum; the caller keeps the buffer in a higher
    /// tier. An I/O failure releases the allocation before returning.
    pub fn write_data(&self, data: &[u8]) -> io::Result<Option<SaveBlock>> {
        let mut inner = self.inner.lock();
        let Some(offset) = Self::allocate(&mut inner, data.len() as u64, self.max_size) else {
            return Ok(None);
        };
        let result = (|| {
            let file = inner.file.as_file_mut();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)
        })();
        if let Err(err) = result {
            Self::release(&mut inner, offset, data.len() as u64);
            return Err(err);
        }
        Ok(Some(SaveBlock {
            offset,
            size: data.len(),
        }))
    }

    /// Read back the bytes of a previously written block.
    pub fn read_data(&self, block: &SaveBlock) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let mut data = vec![0u8; block.size];
        let file = inner.file.as_file_mut();
        file.seek(SeekFrom::Start(block.offset))?;
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Return a block's range to the free list.
    pub fn free(&self, block: SaveBlock) {
        let mut inner = self.inner.lock();
        Self::release(&mut inner, block.offset, block.size as u64);
    }

    /// Bytes currently allocated to live blocks.
    pub fn allocated_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.end - inner.free.iter().map(|r| r.size).sum::<u64>()
    }

    fn allocate(inner: &mut SaveInner, size: u64, max_size: Option<u64>) -> Option<u64> {
        if size == 0 {
            return Some(inner.end);
        }
        // First fit over the free list.
        for i in 0..inner.free.len() {
            if inner.free[i].size >= size {
                let offset = inner.free[i].offset;
                if inner.free[i].size == size {
                    inner.free.remove(i);
                } else {
                    inner.free[i].offset += size;
                    inner.free[i].size -= size;
                }
                return Some(offset);
            }
        }
        // Grow the file, up to the cap.
        let offset = inner.end;
        if let Some(max) = max_size {
            if offset + size > max {
                return None;
            }
        }
        inner.end = offset + size;
        Some(offset)
    }

    fn release(inner: &mut SaveInner, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        let at = inner
            .free
            .partition_point(|range| range.offset < offset);
        let mut range = FreeRange { offset, size };
        // Coalesce with the following range.
        if at < inner.free.len() && range.offset + range.size == inner.free[at].offset {
            range.size += inner.free[at].size;
            inner.free.remove(at);
        }
        // Coalesce with the preceding range.
        if at > 0 && inner.free[at - 1].offset + inner.free[at - 1].size == range.offset {
            inner.free[at - 1].size += range.size;
        } else {
            inner.free.insert(at, range);
        }
        // Trim a trailing free range back off the high-water mark.
        if let Some(last) = inner.free.last() {
            if last.offset + last.size == inner.end {
                inner.end = last.offset;
                inner.free.pop();
            }
        }
    }

    /// Accessor used by tests to inspect the backing file.
    #[cfg(test)]
    fn with_file<R>(&self, f: impl FnOnce(&std::fs::File) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.file.as_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_save_file(max_size: Option<u64>) -> (tempfile::TempDir, SaveFile) {
        let dir = tempdir().expect("failed to create temp dir");
        let save = SaveFile::new(dir.path(), "test-vertex", max_size)
            .expect("failed to create save file");
        (dir, save)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, save) = create_save_file(None);
        let data: Vec<u8> = (0..255).collect();
        let block = save
            .write_data(&data)
            .expect("write should succeed")
            .expect("allocation should succeed");
        assert_eq!(block.size(), data.len());
        let read = save.read_data(&block).expect("read should succeed");
        assert_eq!(read, data);
    }

    #[test]
    fn test_cap_refuses_oversize_write() {
        let (_dir, save) = create_save_file(Some(1024));
        let data = vec![0x55u8; 2048];
        let block = save.write_data(&data).expect("write should not error");
        assert!(block.is_none());
        assert_eq!(save.allocated_bytes(), 0);
    }

    #[test]
    fn test_free_allows_reuse_under_cap() {
        let (_dir, save) = create_save_file(Some(1024));
        let a = save.write_data(&[1u8; 600]).unwrap().unwrap();
        assert!(save.write_data(&[2u8; 600]).unwrap().is_none());
        save.free(a);
        let b = save.write_data(&[2u8; 600]).unwrap().unwrap();
        assert_eq!(b.offset(), 0);
    }

    #[test]
    fn test_first_fit_reuses_freed_hole() {
        let (_dir, save) = create_save_file(None);
        let a = save.write_data(&[1u8; 100]).unwrap().unwrap();
        let _b = save.write_data(&[2u8; 100]).unwrap().unwrap();
        save.free(a);
        let c = save.write_data(&[3u8; 80]).unwrap().unwrap();
        assert_eq!(c.offset(), 0);
        // The remaining 20-byte hole is still available.
        let d = save.write_data(&[4u8; 20]).unwrap().unwrap();
        assert_eq!(d.offset(), 80);
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let (_dir, save) = create_save_file(None);
        let a = save.write_data(&[1u8; 100]).unwrap().unwrap();
        let b = save.write_data(&[2u8; 100]).unwrap().unwrap();
        let _c = save.write_data(&[3u8; 100]).unwrap().unwrap();
        save.free(a);
        save.free(b);
        // The coalesced 200-byte hole satisfies a 150-byte request.
        let d = save.write_data(&[4u8; 150]).unwrap().unwrap();
        assert_eq!(d.offset(), 0);
    }

    #[test]
    fn test_trailing_free_shrinks_high_water() {
        let (_dir, save) = create_save_file(Some(1000));
        let _a = save.write_data(&[1u8; 400]).unwrap().unwrap();
        let b = save.write_data(&[2u8; 400]).unwrap().unwrap();
        save.free(b);
        // With the tail reclaimed, a 600-byte write fits under the cap.
        assert!(save.write_data(&[3u8; 600]).unwrap().is_some());
    }

    #[test]
    fn test_interleaved_blocks_keep_contents() {
        let (_dir, save) = create_save_file(None);
        let a = save.write_data(&[0xAAu8; 64]).unwrap().unwrap();
        let b = save.write_data(&[0xBBu8; 64]).unwrap().unwrap();
        save.free(a);
        let c = save.write_data(&[0xCCu8; 64]).unwrap().unwrap();
        assert_eq!(save.read_data(&b).unwrap(), vec![0xBBu8; 64]);
        assert_eq!(save.read_data(&c).unwrap(), vec![0xCCu8; 64]);
    }

    #[test]
    fn test_scratch_file_exists_on_disk() {
        let (_dir, save) = create_save_file(None);
        save.write_data(&[1u8; 128]).unwrap().unwrap();
        let len = save.with_file(|file| file.metadata().unwrap().len());
        assert!(len >= 128);
    }

    #[test]
    fn test_empty_write() {
        let (_dir, save) = create_save_file(Some(16));
        let block = save.write_data(&[]).unwrap().unwrap();
        assert_eq!(block.size(), 0);
        assert!(save.read_data(&block).unwrap().is_empty());
        save.free(block);
    }
}
