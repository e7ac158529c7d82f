//! Scoped read/write access to a buffer's bytes.
//!
//! All byte access goes through a handle. Opening a handle forces the
//! buffer resident and pins that residency for the handle's lifetime: the
//! handle holds the buffer's lock, so the eviction hook (which only tries
//! the lock) cannot demote the buffer underneath it. Dropping a
//! [`WriteHandle`] restamps the modified counter, re-sizes the LRU entry if
//! the authoring stage's byte length changed, and marks the buffer recently
//! used.
//!
//! Handles on the same buffer must not be nested on one thread; the inner
//! acquisition would deadlock on the buffer's lock.

use crate::buffer::{BufferInner, RamClass, UsageHint, VertexBuffer};
use crate::registry::UpdateSeq;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

/// A scoped, read-only view of one pipeline stage's snapshot.
pub struct ReadHandle<'a> {
    buffer: &'a VertexBuffer,
    guard: RwLockReadGuard<'a, BufferInner>,
    stage: usize,
}

/// A scoped, exclusive view of one pipeline stage's snapshot.
pub struct WriteHandle<'a> {
    buffer: &'a VertexBuffer,
    guard: RwLockWriteGuard<'a, BufferInner>,
    stage: usize,
    initial_len: usize,
    dirty: bool,
}

impl VertexBuffer {
    /// Open a read handle on the given pipeline stage.
    ///
    /// Forces the buffer resident first, then downgrades to shared access
    /// so reads at other stages can proceed concurrently.
    pub fn read_handle(&self, stage: usize) -> ReadHandle<'_> {
        let mut guard = self.inner.write();
        self.do_make_resident(&mut guard);
        let guard = RwLockWriteGuard::downgrade(guard);
        ReadHandle {
            buffer: self,
            guard,
            stage,
        }
    }

    /// Open a writable handle on the given pipeline stage.
    ///
    /// Forces the buffer resident and holds exclusive access until the
    /// handle drops.
    pub fn write_handle(&self, stage: usize) -> WriteHandle<'_> {
        let mut guard = self.inner.write();
        self.do_make_resident(&mut guard);
        let initial_len = guard.cycler.read(0).data().len();
        WriteHandle {
            buffer: self,
            guard,
            stage,
            initial_len,
            dirty: false,
        }
    }
}

impl ReadHandle<'_> {
    /// The stage's bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.guard.cycler.read(self.stage).data()
    }

    /// Byte length of the stage's snapshot.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the snapshot holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Number of complete rows in the snapshot.
    pub fn num_rows(&self) -> usize {
        let stride = self.buffer.format().stride();
        if stride == 0 { 0 } else { self.len() / stride }
    }

    /// The snapshot's modification stamp.
    pub fn modified(&self) -> UpdateSeq {
        self.guard.cycler.read(self.stage).modified()
    }

    /// The buffer's usage hint as of this snapshot.
    pub fn usage_hint(&self) -> UsageHint {
        self.guard.cycler.read(self.stage).usage()
    }

    fn same_buffer(&self, other: &VertexBuffer) -> bool {
        std::ptr::eq(self.buffer, other)
    }
}

impl WriteHandle<'_> {
    /// The stage's bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.guard.cycler.read(self.stage).data()
    }

    /// The stage's bytes, mutably. Obtains a private copy of the snapshot
    /// if downstream stages still share it.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.guard.cycler.write(self.stage, false).data
    }

    /// Byte length of the stage's snapshot.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the snapshot holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Number of complete rows in the snapshot.
    pub fn num_rows(&self) -> usize {
        let stride = self.buffer.format().stride();
        if stride == 0 { 0 } else { self.len() / stride }
    }

    /// Resize to `n` rows, zero-filling any new bytes. Returns whether the
    /// byte length changed.
    pub fn set_num_rows(&mut self, n: usize) -> bool {
        let new_len = n * self.buffer.format().stride();
        if self.guard.cycler.read(self.stage).data().len() == new_len {
            return false;
        }
        let stage = self.guard.cycler.write(self.stage, false);
        stage.data.resize(new_len, 0);
        stage.full_size = new_len;
        self.dirty = true;
        true
    }

    /// Resize to `n` rows without preserving existing contents; the bytes
    /// are unspecified and about to be overwritten. Returns whether the
    /// byte length changed.
    pub fn unclean_set_num_rows(&mut self, n: usize) -> bool {
        let new_len = n * self.buffer.format().stride();
        if self.guard.cycler.read(self.stage).data().len() == new_len {
            return false;
        }
        // Just make a new array; no reason to keep the old bytes around.
        let stage = self.guard.cycler.write(self.stage, false);
        stage.data = vec![0; new_len];
        stage.full_size = new_len;
        self.dirty = true;
        true
    }

    /// Replace this stage's bytes with the other handle's entire snapshot.
    pub fn copy_data_from(&mut self, other: &ReadHandle<'_>) {
        assert!(
            !other.same_buffer(self.buffer),
            "copy_data_from within one buffer would deadlock"
        );
        let data = other.as_slice().to_vec();
        let stage = self.guard.cycler.write(self.stage, false);
        stage.full_size = data.len();
        stage.data = data;
        self.dirty = true;
    }

    /// Copy a byte range from the other handle into a byte range of this
    /// stage.
    ///
    /// If the source and destination ranges differ in length, this stage's
    /// bytes are grown or shrunk around `dst_start` so the copied region
    /// fits. Both ranges are clamped to the actual snapshot sizes.
    pub fn copy_subdata_from(
        &mut self,
        dst_start: usize,
        dst_size: usize,
        other: &ReadHandle<'_>,
        src_start: usize,
        src_size: usize,
    ) {
        assert!(
            !other.same_buffer(self.buffer),
            "copy_subdata_from within one buffer would deadlock"
        );
        let src = other.as_slice();
        let src_start = src_start.min(src.len());
        let src_size = src_size.min(src.len() - src_start);

        let stage = self.guard.cycler.write(self.stage, false);
        let dst_start = dst_start.min(stage.data.len());
        let dst_size = dst_size.min(stage.data.len() - dst_start);

        if src_size < dst_size {
            // Reduce the array.
            stage.data.drain(dst_start + src_size..dst_start + dst_size);
        } else if dst_size < src_size {
            // Expand the array.
            stage.data.splice(
                dst_start + dst_size..dst_start + dst_size,
                std::iter::repeat_n(0u8, src_size - dst_size),
            );
        }
        stage.data[dst_start..dst_start + src_size]
            .copy_from_slice(&src[src_start..src_start + src_size]);
        stage.full_size = stage.data.len();
        self.dirty = true;
    }

    /// The snapshot's modification stamp as of the last completed mutation.
    pub fn modified(&self) -> UpdateSeq {
        self.guard.cycler.read(self.stage).modified()
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if self.dirty {
            // Draw the stamp after all bytes are in place.
            let modified = self.buffer.registry().next_modified();
            self.guard.cycler.write(self.stage, false).modified = modified;
        }
        if self.stage == 0 {
            let len = self.guard.cycler.read(0).data().len();
            if len != self.initial_len {
                debug_assert_eq!(self.guard.ram_class, RamClass::Resident);
                self.buffer
                    .registry()
                    .tier(self.guard.ram_class)
                    .resize(self.buffer.page_id(), len);
            }
        }
        self.buffer.mark_used(&self.guard);
    }
}
