//! The vertex buffer and its four-state residency machine.
//!
//! A [`VertexBuffer`] holds a contiguous byte blob interpreted through a
//! [`VertexFormat`](crate::format::VertexFormat). At any moment the bytes
//! live in exactly one of four residency classes; the transitions compress,
//! expand, spill, and restore the bytes while keeping the buffer enrolled in
//! the LRU tier matching its class:
//!
//! ```text
//!     Resident <--> Compressed
//!        |              |
//!        v              v
//!       Disk      CompressedDisk
//! ```
//!
//! Demotion happens through the eviction hook when a tier runs over budget;
//! promotion happens on demand when a handle needs the bytes.

use crate::cycler::DataCycler;
use crate::device::{DeviceContext, DeviceId, GraphicsDevice, PreparedEntry};
use crate::format::VertexFormat;
use crate::metrics;
use crate::registry::Registry;
use crate::save_file::SaveBlock;
use crate::tier::{LruPage, PageId};
use ahash::AHashMap;
use flate2::Compression;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use parking_lot::{Mutex, RwLock};
use std::io::{self, Read};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Advisory tag recorded with a buffer and consumed by device
/// collaborators; the core does not act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageHint {
    /// Uploaded once, rendered from client RAM.
    Client,
    /// Rewritten every frame.
    Stream,
    /// Rewritten occasionally.
    Dynamic,
    /// Written once, rendered many times.
    Static,
}

impl UsageHint {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            UsageHint::Client => 0,
            UsageHint::Stream => 1,
            UsageHint::Dynamic => 2,
            UsageHint::Static => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(UsageHint::Client),
            1 => Some(UsageHint::Stream),
            2 => Some(UsageHint::Dynamic),
            3 => Some(UsageHint::Static),
            _ => None,
        }
    }
}

/// Where a buffer's bytes physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RamClass {
    /// Full uncompressed bytes in RAM.
    Resident,
    /// Compressed bytes in RAM (or raw bytes below the compress threshold).
    Compressed,
    /// Uncompressed bytes in the save file.
    Disk,
    /// Compressed bytes in the save file; restoring yields `Compressed`.
    CompressedDisk,
}

impl RamClass {
    /// Whether the bytes currently live in the save file.
    pub fn is_on_disk(self) -> bool {
        matches!(self, RamClass::Disk | RamClass::CompressedDisk)
    }
}

/// Stable identity of a buffer across residency changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

impl BufferId {
    /// The raw identity value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

pub(crate) struct BufferInner {
    pub(crate) cycler: DataCycler,
    pub(crate) ram_class: RamClass,
    pub(crate) saved_block: Option<SaveBlock>,
    // Set when a foreign-endian stream payload was staged before its format
    // was resolved; cleared by the byte flip at finalization.
    pub(crate) endian_reversed: bool,
}

/// A tiered-residency vertex array buffer.
///
/// Buffers are created through
/// [`Registry::create_buffer`](crate::registry::Registry::create_buffer) and
/// accessed through scoped handles
/// ([`read_handle`](VertexBuffer::read_handle) /
/// [`write_handle`](VertexBuffer::write_handle)). Handles pin residency for
/// their lifetime; the eviction hook refuses to demote a pinned buffer.
pub struct VertexBuffer {
    id: BufferId,
    format: Arc<VertexFormat>,
    registry: Arc<Registry>,
    weak_self: Weak<VertexBuffer>,
    pub(crate) inner: RwLock<BufferInner>,
    contexts: Mutex<AHashMap<DeviceId, PreparedEntry>>,
}

impl std::fmt::Debug for VertexBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexBuffer").field("id", &self.id).finish()
    }
}

impl VertexBuffer {
    pub(crate) fn new(
        registry: Arc<Registry>,
        format: Arc<VertexFormat>,
        usage: UsageHint,
    ) -> Arc<VertexBuffer> {
        assert!(
            registry.formats().is_canonical(&format),
            "vertex format must be registered before constructing a buffer"
        );
        let id = registry.allocate_buffer_id();
        let modified = registry.next_modified();
        let stages = registry.pipeline_stages();
        let buffer = Arc::new_cyclic(|weak| VertexBuffer {
            id,
            format,
            registry: registry.clone(),
            weak_self: weak.clone(),
            inner: RwLock::new(BufferInner {
                cycler: DataCycler::new(stages, usage, modified),
                ram_class: RamClass::Resident,
                saved_block: None,
                endian_reversed: false,
            }),
            contexts: Mutex::new(AHashMap::new()),
        });
        registry
            .tier(RamClass::Resident)
            .enroll(buffer.page_id(), buffer.weak_page(), 0);
        buffer
    }

    /// The buffer's stable identity.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// The buffer's canonical array format.
    pub fn format(&self) -> &Arc<VertexFormat> {
        &self.format
    }

    /// The buffer's current residency class.
    pub fn ram_class(&self) -> RamClass {
        self.inner.read().ram_class
    }

    /// The buffer's usage hint as of the authoring stage.
    pub fn usage_hint(&self) -> UsageHint {
        self.inner.read().cycler.read(0).usage()
    }

    /// Change the usage hint.
    ///
    /// Don't call this from a downstream stage unless you don't mind it
    /// blowing away changes recently made upstream.
    pub fn set_usage_hint(&self, usage: UsageHint) {
        let modified = self.registry.next_modified();
        let mut inner = self.inner.write();
        let stage = inner.cycler.write(0, true);
        stage.usage = usage;
        stage.modified = modified;
    }

    /// Advance the buffer's pipeline one step, making the authoring stage's
    /// snapshot visible downstream.
    pub fn cycle(&self) {
        self.inner.write().cycler.cycle();
    }

    /// Replace this buffer's contents with `other`'s.
    ///
    /// Not pipeline-safe: every stage snapshot is replaced at once, so do
    /// not call this for a buffer that is actively being rendered.
    pub fn copy_from(&self, other: &Arc<VertexBuffer>) {
        if std::ptr::eq(self, Arc::as_ptr(other)) {
            return;
        }
        other.make_resident();
        let cycler = other.inner.read().cycler.clone();

        let mut inner = self.inner.write();
        inner.cycler = cycler;
        for stage in 0..inner.cycler.num_stages() {
            let modified = self.registry.next_modified();
            inner.cycler.write(stage, true).modified = modified;
        }
        if let Some(block) = inner.saved_block.take() {
            if let Some(save_file) = self.registry.existing_save_file() {
                save_file.free(block);
            }
        }
        let size = inner.cycler.read(0).data().len();
        if inner.ram_class == RamClass::Resident {
            self.registry
                .tier(RamClass::Resident)
                .resize(self.page_id(), size);
        } else {
            self.set_ram_class(&mut inner, RamClass::Resident);
        }
        self.mark_used(&inner);
    }

    /// Move the buffer to fully resident status, expanding it or reading it
    /// from disk as necessary.
    pub fn make_resident(&self) {
        let mut inner = self.inner.write();
        self.do_make_resident(&mut inner);
    }

    /// Move the buffer to compressed status, compressing it or reading it
    /// from disk as necessary.
    pub fn make_compressed(&self) {
        let mut inner = self.inner.write();
        self.do_make_compressed(&mut inner);
    }

    /// Move the buffer to disk status by writing it to the save file.
    ///
    /// If the save file refuses the write, the buffer keeps its current
    /// class and is re-marked recently used so it is not retried this
    /// epoch.
    pub fn make_disk(&self) {
        let mut inner = self.inner.write();
        self.do_make_disk(&mut inner);
    }

    /// Restore the buffer from disk, making it compressed or resident
    /// according to the form it was stored in.
    pub fn restore_from_disk(&self) {
        let mut inner = self.inner.write();
        self.do_restore_from_disk(&mut inner);
    }

    pub(crate) fn do_make_resident(&self, inner: &mut BufferInner) {
        if inner.ram_class == RamClass::Resident {
            self.mark_used(inner);
            return;
        }
        if inner.ram_class.is_on_disk() {
            self.do_restore_from_disk(inner);
        }
        if inner.ram_class == RamClass::Compressed {
            let snapshot = inner.cycler.read(0).clone();
            if snapshot.data().len() < snapshot.full_size() {
                metrics::EXPANSIONS.increment();
                debug!(
                    buffer = self.id.0,
                    from = snapshot.data().len(),
                    to = snapshot.full_size(),
                    "expanding vertex data"
                );
                let expanded = match expand(snapshot.data(), snapshot.full_size()) {
                    Ok(expanded) => expanded,
                    Err(err) => {
                        error!(buffer = self.id.0, %err, "couldn't expand vertex data");
                        panic!("corrupt compressed vertex data: {err}");
                    }
                };
                inner.cycler.write(0, true).data = expanded;
            }
            self.set_ram_class(inner, RamClass::Resident);
        }
    }

    pub(crate) fn do_make_compressed(&self, inner: &mut BufferInner) {
        if inner.ram_class == RamClass::Compressed {
            self.mark_used(inner);
            return;
        }
        if inner.ram_class.is_on_disk() {
            self.do_restore_from_disk(inner);
        }
        if inner.ram_class == RamClass::Resident {
            let snapshot = inner.cycler.read(0).clone();
            let full_size = snapshot.full_size();
            if full_size > self.registry.config().min_vertex_data_compress_size {
                metrics::COMPRESSIONS.increment();
                let level = self.registry.config().vertex_data_compression_level;
                match compress(snapshot.data(), level) {
                    Ok(compressed) if compressed.len() < full_size => {
                        debug!(
                            buffer = self.id.0,
                            from = full_size,
                            to = compressed.len(),
                            "compressed vertex data"
                        );
                        inner.cycler.write(0, true).data = compressed;
                    }
                    Ok(compressed) => {
                        // The codec grew the data; keep the raw bytes.
                        debug!(
                            buffer = self.id.0,
                            from = full_size,
                            to = compressed.len(),
                            "compression did not shrink vertex data, keeping raw bytes"
                        );
                    }
                    Err(err) => {
                        error!(buffer = self.id.0, %err, "couldn't compress vertex data");
                    }
                }
            }
            self.set_ram_class(inner, RamClass::Compressed);
        }
    }

    pub(crate) fn do_make_disk(&self, inner: &mut BufferInner) {
        if inner.ram_class.is_on_disk() {
            self.mark_used(inner);
            return;
        }
        assert!(
            inner.saved_block.is_none(),
            "in-memory buffer must not hold a save block"
        );
        let save_file = match self.registry.save_file() {
            Ok(save_file) => save_file,
            Err(err) => {
                error!(buffer = self.id.0, %err, "couldn't open vertex data save file");
                self.mark_used(inner);
                return;
            }
        };
        let snapshot = inner.cycler.read(0).clone();
        debug!(
            buffer = self.id.0,
            bytes = snapshot.data().len(),
            "storing vertex data to disk"
        );
        match save_file.write_data(snapshot.data()) {
            Ok(Some(block)) => {
                metrics::DISK_SAVES.increment();
                inner.saved_block = Some(block);
                // Swap with an empty vector to actually release the memory.
                inner.cycler.write(0, true).data = Vec::new();
                let class = if inner.ram_class == RamClass::Resident {
                    RamClass::Disk
                } else {
                    RamClass::CompressedDisk
                };
                self.set_ram_class(inner, class);
            }
            Ok(None) => {
                metrics::SAVE_FILE_FULL.increment();
                warn!(
                    buffer = self.id.0,
                    bytes = snapshot.data().len(),
                    "save file is full, vertex data stays in memory"
                );
                self.mark_used(inner);
            }
            Err(err) => {
                error!(buffer = self.id.0, %err, "couldn't write vertex data to disk");
                self.mark_used(inner);
            }
        }
    }

    pub(crate) fn do_restore_from_disk(&self, inner: &mut BufferInner) {
        if !inner.ram_class.is_on_disk() {
            return;
        }
        let block = inner
            .saved_block
            .take()
            .expect("disk-resident buffer must hold a save block");
        let save_file = self
            .registry
            .existing_save_file()
            .expect("disk-resident buffer requires the save file");
        metrics::DISK_RESTORES.increment();
        debug!(
            buffer = self.id.0,
            bytes = block.size(),
            "restoring vertex data from disk"
        );
        let data = match save_file.read_data(&block) {
            Ok(data) => data,
            Err(err) => {
                error!(buffer = self.id.0, %err, "couldn't read vertex data back from disk");
                panic!("vertex data save file read failed: {err}");
            }
        };
        save_file.free(block);
        inner.cycler.write(0, true).data = data;
        let class = if inner.ram_class == RamClass::CompressedDisk {
            RamClass::Compressed
        } else {
            RamClass::Resident
        };
        self.set_ram_class(inner, class);
    }

    /// Withdraw from the old class's tier, record the new class, and enroll
    /// at the MRU end of the new class's tier with the current byte size.
    fn set_ram_class(&self, inner: &mut BufferInner, class: RamClass) {
        if inner.ram_class == class {
            return;
        }
        let id = self.page_id();
        self.registry.tier(inner.ram_class).withdraw(id);
        inner.ram_class = class;
        let size = inner.cycler.read(0).data().len();
        self.registry.tier(class).enroll(id, self.weak_page(), size);
    }

    pub(crate) fn mark_used(&self, inner: &BufferInner) {
        self.registry.tier(inner.ram_class).touch(self.page_id());
    }

    pub(crate) fn page_id(&self) -> PageId {
        PageId::new(self as *const VertexBuffer as usize)
    }

    fn weak_page(&self) -> Weak<dyn LruPage> {
        self.weak_self.clone() as Weak<dyn LruPage>
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn arc_self(&self) -> Arc<VertexBuffer> {
        self.weak_self
            .upgrade()
            .expect("buffer is alive while its methods run")
    }

    // ------------------------------------------------------------------
    // Device-context table
    // ------------------------------------------------------------------

    /// Enqueue the buffer to be prepared on the device at the start of the
    /// next frame.
    pub fn prepare(&self, device: &Arc<dyn GraphicsDevice>) {
        device.enqueue_vertex_buffer(&self.arc_self());
    }

    /// Whether the buffer has a context on the device or is queued to get
    /// one.
    pub fn is_prepared(&self, device: &Arc<dyn GraphicsDevice>) -> bool {
        if self.contexts.lock().contains_key(&DeviceId::of(device)) {
            return true;
        }
        device.is_vertex_buffer_queued(&self.arc_self())
    }

    /// Create a context on the device immediately, or return the existing
    /// one. Returns `None` if the device refuses.
    pub fn prepare_now(&self, device: &Arc<dyn GraphicsDevice>) -> Option<DeviceContext> {
        let key = DeviceId::of(device);
        if let Some(entry) = self.contexts.lock().get(&key) {
            return Some(entry.context);
        }
        let context = device.prepare_vertex_buffer_now(&self.arc_self())?;
        self.contexts.lock().insert(
            key,
            PreparedEntry {
                device: Arc::downgrade(device),
                context,
            },
        );
        Some(context)
    }

    /// Free the buffer's context on the device, if any. Returns whether a
    /// context (or queue entry) was released.
    pub fn release(&self, device: &Arc<dyn GraphicsDevice>) -> bool {
        let context = self
            .contexts
            .lock()
            .get(&DeviceId::of(device))
            .map(|entry| entry.context);
        if let Some(context) = context {
            device.release_vertex_buffer(context);
            return true;
        }
        // Maybe it wasn't prepared yet, but it's about to be.
        device.dequeue_vertex_buffer(&self.arc_self())
    }

    /// Free the buffer's contexts on every device. Returns how many were
    /// released.
    pub fn release_all(&self) -> usize {
        // Walk a snapshot: each device's release calls clear_prepared back,
        // mutating the table underneath us.
        let snapshot: Vec<(Weak<dyn GraphicsDevice>, DeviceContext)> = self
            .contexts
            .lock()
            .values()
            .map(|entry| (entry.device.clone(), entry.context))
            .collect();
        let released = snapshot.len();
        for (device, context) in snapshot {
            if let Some(device) = device.upgrade() {
                device.release_vertex_buffer(context);
            }
        }
        self.contexts.lock().clear();
        released
    }

    /// Drop the device's entry from the context table without releasing the
    /// context. Called by the device from its release path; never by user
    /// code.
    pub fn clear_prepared(&self, device: DeviceId) {
        if self.contexts.lock().remove(&device).is_none() {
            // The device forgot it never prepared this buffer.
            error!(
                buffer = self.id.0,
                "clear_prepared for a device with no context"
            );
            debug_assert!(false, "clear_prepared for a device with no context");
        }
    }

    /// Number of devices currently holding a context.
    pub fn num_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    // ------------------------------------------------------------------
    // Stream support
    // ------------------------------------------------------------------

    pub(crate) fn fill_from_stream(
        &self,
        data: Vec<u8>,
        usage: UsageHint,
        endian_reversed: bool,
    ) {
        let modified = self.registry.next_modified();
        let mut inner = self.inner.write();
        let stage = inner.cycler.write(0, true);
        stage.data = data;
        stage.full_size = stage.data.len();
        stage.usage = usage;
        stage.modified = modified;
        inner.endian_reversed = endian_reversed;
        let size = inner.cycler.read(0).data().len();
        self.registry
            .tier(inner.ram_class)
            .resize(self.page_id(), size);
        self.mark_used(&inner);
    }

    pub(crate) fn finalize_stream_read(&self) {
        let mut inner = self.inner.write();
        if inner.endian_reversed {
            inner.endian_reversed = false;
            let snapshot = inner.cycler.read(0).clone();
            let flipped = self.format.reverse_endianness(snapshot.data());
            inner.cycler.write(0, true).data = flipped;
        }
        debug_assert_eq!(inner.ram_class, RamClass::Resident);
    }
}

impl LruPage for VertexBuffer {
    /// Demote one tier when the owning LRU runs over budget.
    ///
    /// A buffer pinned by an active handle refuses eviction and is retried
    /// next epoch. The disk tier never evicts.
    fn evict_lru(&self) {
        let Some(mut inner) = self.inner.try_write() else {
            debug!(buffer = self.id.0, "eviction deferred, buffer is pinned");
            return;
        };
        match inner.ram_class {
            RamClass::Resident => {
                metrics::EVICTIONS.increment();
                if self.registry.tier(RamClass::Compressed).budget() == Some(0) {
                    self.do_make_disk(&mut inner);
                } else {
                    self.do_make_compressed(&mut inner);
                }
            }
            RamClass::Compressed => {
                metrics::EVICTIONS.increment();
                self.do_make_disk(&mut inner);
            }
            RamClass::Disk | RamClass::CompressedDisk => {
                warn!(buffer = self.id.0, "cannot evict vertex data from disk");
            }
        }
    }
}

impl Drop for VertexBuffer {
    fn drop(&mut self) {
        self.release_all();
        let id = self.page_id();
        let inner = self.inner.get_mut();
        self.registry.tier(inner.ram_class).withdraw(id);
        if let Some(block) = inner.saved_block.take() {
            if let Some(save_file) = self.registry.existing_save_file() {
                save_file.free(block);
            }
        }
    }
}

fn compress(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(data, Compression::new(level));
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

fn expand(data: &[u8], full_size: usize) -> io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(full_size);
    decoder.read_to_end(&mut out)?;
    if out.len() != full_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expanded vertex data has the wrong length",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_hint_roundtrip() {
        for hint in [
            UsageHint::Client,
            UsageHint::Stream,
            UsageHint::Dynamic,
            UsageHint::Static,
        ] {
            assert_eq!(UsageHint::from_u8(hint.to_u8()), Some(hint));
        }
        assert_eq!(UsageHint::from_u8(4), None);
    }

    #[test]
    fn test_compress_expand_roundtrip() {
        let data = vec![0x7Au8; 10_000];
        let compressed = compress(&data, 1).expect("compress should succeed");
        assert!(compressed.len() < data.len());
        let expanded = expand(&compressed, data.len()).expect("expand should succeed");
        assert_eq!(expanded, data);
    }

    #[test]
    fn test_expand_rejects_wrong_length() {
        let data = vec![0x7Au8; 100];
        let compressed = compress(&data, 1).unwrap();
        assert!(expand(&compressed, 99).is_err());
    }

    #[test]
    fn test_ram_class_is_on_disk() {
        assert!(!RamClass::Resident.is_on_disk());
        assert!(!RamClass::Compressed.is_on_disk());
        assert!(RamClass::Disk.is_on_disk());
        assert!(RamClass::CompressedDisk.is_on_disk());
    }
}
