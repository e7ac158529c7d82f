//! Configuration for the tiered vertex data manager.
//!
//! All values are read once when the [`Registry`](crate::registry::Registry)
//! is built; changing them at runtime is not supported.

use serde::Deserialize;
use std::path::PathBuf;

/// Maximum number of pipeline stages a registry may be built with.
pub const MAX_PIPELINE_STAGES: usize = 4;

/// Configuration record for the tiered vertex data manager.
///
/// Byte budgets use `-1` for "unlimited". A compressed-tier budget of `0`
/// bypasses that tier entirely: buffers evicted from RAM spill straight to
/// disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct VertexDataConfig {
    /// Maximum bytes of vertex data resident in RAM at once (`-1` unlimited).
    pub max_ram_vertex_data: i64,

    /// Maximum bytes of compressed vertex data in RAM at once
    /// (`-1` unlimited, `0` bypass).
    pub max_compressed_vertex_data: i64,

    /// zlib compression level, 1-9. Larger values are slower but give
    /// better compression.
    pub vertex_data_compression_level: u32,

    /// Maximum bytes of vertex data written to the save file (`-1` unlimited).
    pub max_disk_vertex_data: i64,

    /// Buffers at or below this size skip the codec entirely; they are
    /// assumed to have minimal compression gains (or even end up larger).
    pub min_vertex_data_compress_size: usize,

    /// Directory for the scratch save file. Defaults to the OS temp dir.
    pub vertex_save_file_directory: Option<PathBuf>,

    /// Filename prefix for the scratch save file.
    pub vertex_save_file_prefix: String,

    /// Number of pipeline stages each buffer cycles through, 1-4.
    pub pipeline_stages: usize,
}

impl Default for VertexDataConfig {
    fn default() -> Self {
        Self {
            max_ram_vertex_data: -1,
            max_compressed_vertex_data: -1,
            vertex_data_compression_level: 1,
            max_disk_vertex_data: -1,
            min_vertex_data_compress_size: 64,
            vertex_save_file_directory: None,
            vertex_save_file_prefix: "vertex-data".to_string(),
            pipeline_stages: 1,
        }
    }
}

impl VertexDataConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the RAM tier budget in bytes (`-1` unlimited).
    pub fn with_max_ram(mut self, bytes: i64) -> Self {
        self.max_ram_vertex_data = bytes;
        self
    }

    /// Set the compressed tier budget in bytes (`-1` unlimited, `0` bypass).
    pub fn with_max_compressed(mut self, bytes: i64) -> Self {
        self.max_compressed_vertex_data = bytes;
        self
    }

    /// Set the zlib compression level, clamped to 1-9.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.vertex_data_compression_level = level.clamp(1, 9);
        self
    }

    /// Set the save file cap in bytes (`-1` unlimited).
    pub fn with_max_disk(mut self, bytes: i64) -> Self {
        self.max_disk_vertex_data = bytes;
        self
    }

    /// Set the minimum size worth passing through the codec.
    pub fn with_min_compress_size(mut self, bytes: usize) -> Self {
        self.min_vertex_data_compress_size = bytes;
        self
    }

    /// Set the scratch directory for the save file.
    pub fn with_save_file_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.vertex_save_file_directory = Some(dir.into());
        self
    }

    /// Set the filename prefix for the save file.
    pub fn with_save_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.vertex_save_file_prefix = prefix.into();
        self
    }

    /// Set the number of pipeline stages, clamped to 1-4.
    pub fn with_pipeline_stages(mut self, stages: usize) -> Self {
        self.pipeline_stages = stages.clamp(1, MAX_PIPELINE_STAGES);
        self
    }

    /// The directory the save file is created in.
    pub fn save_file_directory(&self) -> PathBuf {
        self.vertex_save_file_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Translate a `-1`-means-unlimited budget into an `Option`.
    pub(crate) fn budget(bytes: i64) -> Option<usize> {
        if bytes < 0 { None } else { Some(bytes as usize) }
    }
}
