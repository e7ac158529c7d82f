//! The process-wide registry: tiers, save file, and the epoch driver.
//!
//! Production deployments build one [`Registry`] at startup and thread it
//! through; tests build their own so each gets independent tiers and a
//! private save file. The registry owns nothing beyond bookkeeping — tiers
//! hold buffers weakly, so dropping the last handle to a buffer destroys it
//! and frees its disk block.

use crate::buffer::{BufferId, RamClass, UsageHint, VertexBuffer};
use crate::config::{MAX_PIPELINE_STAGES, VertexDataConfig};
use crate::error::VertexDataResult;
use crate::format::{FormatRegistry, VertexFormat};
use crate::save_file::SaveFile;
use crate::serialize::{self, Endian};
use crate::tier::LruTier;
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A stamp from the process-wide monotonic modification counter.
///
/// Two observers that see the same stamp see byte-identical contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpdateSeq(u64);

impl UpdateSeq {
    /// The stamp carried by data that has never been modified.
    pub fn initial() -> Self {
        Self(0)
    }
}

/// Process-wide state for the tiered vertex data manager.
pub struct Registry {
    config: VertexDataConfig,
    weak_self: Weak<Registry>,
    ram_tier: LruTier,
    compressed_tier: LruTier,
    disk_tier: LruTier,
    formats: FormatRegistry,
    save_file: Mutex<Option<Arc<SaveFile>>>,
    next_modified: AtomicU64,
    next_buffer_id: AtomicU64,
}

impl Registry {
    /// Build a registry from a configuration record.
    pub fn new(config: VertexDataConfig) -> Arc<Registry> {
        assert!(
            (1..=9).contains(&config.vertex_data_compression_level),
            "compression level must be 1-9"
        );
        assert!(
            (1..=MAX_PIPELINE_STAGES).contains(&config.pipeline_stages),
            "pipeline stages must be 1-{MAX_PIPELINE_STAGES}"
        );
        let ram_budget = VertexDataConfig::budget(config.max_ram_vertex_data);
        let compressed_budget = VertexDataConfig::budget(config.max_compressed_vertex_data);
        Arc::new_cyclic(|weak| Registry {
            config,
            weak_self: weak.clone(),
            ram_tier: LruTier::new("ram", ram_budget),
            compressed_tier: LruTier::new("compressed", compressed_budget),
            // The disk tier tracks membership only; lru_epoch never asks it
            // to evict.
            disk_tier: LruTier::new("disk", Some(0)),
            formats: FormatRegistry::new(),
            save_file: Mutex::new(None),
            next_modified: AtomicU64::new(1),
            next_buffer_id: AtomicU64::new(1),
        })
    }

    fn arc_self(&self) -> Arc<Registry> {
        self.weak_self
            .upgrade()
            .expect("registry is alive while its methods run")
    }

    /// The configuration the registry was built with.
    pub fn config(&self) -> &VertexDataConfig {
        &self.config
    }

    /// The RAM tier, holding `Resident` buffers.
    pub fn ram_tier(&self) -> &LruTier {
        &self.ram_tier
    }

    /// The compressed tier, holding `Compressed` buffers.
    pub fn compressed_tier(&self) -> &LruTier {
        &self.compressed_tier
    }

    /// The disk tier, holding `Disk` and `CompressedDisk` buffers.
    pub fn disk_tier(&self) -> &LruTier {
        &self.disk_tier
    }

    pub(crate) fn tier(&self, class: RamClass) -> &LruTier {
        match class {
            RamClass::Resident => &self.ram_tier,
            RamClass::Compressed => &self.compressed_tier,
            RamClass::Disk | RamClass::CompressedDisk => &self.disk_tier,
        }
    }

    /// Mark that an epoch has passed, typically once per rendered frame.
    ///
    /// Asks the RAM and compressed tiers to consider evictions. There is no
    /// automatic eviction from the disk tier. Must not be called
    /// concurrently with itself.
    pub fn lru_epoch(&self) {
        self.ram_tier.begin_epoch();
        self.compressed_tier.begin_epoch();
    }

    /// Intern a format, returning the canonical `Arc` for its schema.
    pub fn register_format(&self, format: VertexFormat) -> Arc<VertexFormat> {
        self.formats.register(format)
    }

    pub(crate) fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    /// Create a buffer with the given (registered) format and usage hint.
    ///
    /// The buffer starts `Resident` and empty.
    ///
    /// # Panics
    ///
    /// Panics if `format` is not the canonical interned `Arc` for its
    /// schema.
    pub fn create_buffer(&self, format: Arc<VertexFormat>, usage: UsageHint) -> Arc<VertexBuffer> {
        VertexBuffer::new(self.arc_self(), format, usage)
    }

    /// Serialize a buffer into `out` with the given stream endianness.
    pub fn write_buffer(
        &self,
        buffer: &VertexBuffer,
        out: &mut impl BufMut,
        endian: Endian,
    ) -> VertexDataResult<()> {
        serialize::write_buffer(buffer, out, endian)
    }

    /// Deserialize a buffer from `src`, interning its format.
    pub fn read_buffer(&self, src: &mut impl Buf) -> VertexDataResult<Arc<VertexBuffer>> {
        serialize::read_buffer(&self.arc_self(), src)
    }

    /// Draw a fresh stamp from the modification counter.
    pub(crate) fn next_modified(&self) -> UpdateSeq {
        UpdateSeq(self.next_modified.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_buffer_id(&self) -> BufferId {
        BufferId(self.next_buffer_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn pipeline_stages(&self) -> usize {
        self.config.pipeline_stages
    }

    /// The shared save file, created on first use from the configured
    /// directory, prefix, and cap.
    pub(crate) fn save_file(&self) -> io::Result<Arc<SaveFile>> {
        let mut slot = self.save_file.lock();
        if let Some(save_file) = slot.as_ref() {
            return Ok(save_file.clone());
        }
        let max_size = VertexDataConfig::budget(self.config.max_disk_vertex_data)
            .map(|bytes| bytes as u64);
        let save_file = Arc::new(SaveFile::new(
            &self.config.save_file_directory(),
            &self.config.vertex_save_file_prefix,
            max_size,
        )?);
        *slot = Some(save_file.clone());
        Ok(save_file)
    }

    /// The save file if one has been created already.
    pub(crate) fn existing_save_file(&self) -> Option<Arc<SaveFile>> {
        self.save_file.lock().clone()
    }
}
