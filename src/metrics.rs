//! Vertex data metrics.

use metriken::{Counter, metric};

/// Buffers compressed on demotion from resident state.
#[metric(
    name = "vertex_data_compress",
    description = "Buffers compressed on demotion from resident state"
)]
pub static COMPRESSIONS: Counter = Counter::new();

/// Buffers expanded on promotion back to resident state.
#[metric(
    name = "vertex_data_decompress",
    description = "Buffers expanded on promotion back to resident state"
)]
pub static EXPANSIONS: Counter = Counter::new();

/// Buffers written to the disk save file.
#[metric(
    name = "vertex_data_save",
    description = "Buffers written to the disk save file"
)]
pub static DISK_SAVES: Counter = Counter::new();

/// Buffers restored from the disk save file.
#[metric(
    name = "vertex_data_restore",
    description = "Buffers restored from the disk save file"
)]
pub static DISK_RESTORES: Counter = Counter::new();

/// Pages demoted one tier by LRU eviction.
#[metric(
    name = "vertex_data_evictions",
    description = "Pages demoted one tier by LRU eviction"
)]
pub static EVICTIONS: Counter = Counter::new();

/// Disk writes refused because the save file cap was reached.
#[metric(
    name = "vertex_data_save_file_full",
    description = "Disk writes refused because the save file cap was reached"
)]
pub static SAVE_FILE_FULL: Counter = Counter::new();
