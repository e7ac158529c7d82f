//! vertexcache: a tiered residency manager for vertex array data.
//!
//! A scene can hold thousands of vertex buffers totalling gigabytes, far
//! more than should stay resident in RAM. This crate keeps a working set
//! resident and demotes the rest through a cascade of storage tiers, each
//! governed by an independent byte-budgeted LRU:
//!
//! ```text
//!        +--------------------+
//!        |  Resident (RAM)    |   full uncompressed bytes
//!        +---------+----------+
//!                  | evict
//!                  v
//!        +--------------------+
//!        |  Compressed (RAM)  |   zlib-compressed bytes
//!        +---------+----------+
//!                  | evict
//!                  v
//!        +--------------------+
//!        |  Disk (save file)  |   spilled, uncompressed or compressed
//!        +--------------------+
//! ```
//!
//! Eviction is epoch-driven: the host calls [`Registry::lru_epoch`] once
//! per rendered frame and over-budget tiers demote their
//! least-recently-used buffers one tier. Any buffer promotes back to
//! resident on demand when a handle needs its bytes.
//!
//! # Example
//!
//! ```
//! use vertexcache::{Registry, UsageHint, VertexColumn, VertexDataConfig, VertexFormat};
//!
//! let registry = Registry::new(VertexDataConfig::default());
//! let format = registry.register_format(VertexFormat::new(
//!     vec![VertexColumn::new(0, 3, 4)], // one column of three f32s
//!     12,
//! ));
//! let buffer = registry.create_buffer(format, UsageHint::Static);
//!
//! {
//!     let mut handle = buffer.write_handle(0);
//!     handle.set_num_rows(3);
//!     handle.as_mut_slice()[0] = 0x7F;
//! }
//!
//! buffer.make_compressed();
//! buffer.make_resident();
//! assert_eq!(buffer.read_handle(0).as_slice()[0], 0x7F);
//! ```
//!
//! # Concurrency
//!
//! Buffers follow a pipeline-stage discipline: writes at stage 0 land in a
//! private copy-on-write snapshot and become visible downstream only after
//! [`VertexBuffer::cycle`]. Handles pin residency for their lifetime; the
//! eviction hook refuses buffers it cannot lock. The epoch driver must not
//! run concurrently with itself but may run alongside buffer access on
//! other threads.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod buffer;
mod config;
mod cycler;
mod device;
mod error;
mod format;
mod handle;
mod registry;
mod save_file;
mod serialize;
mod tier;

pub mod metrics;

pub use buffer::{BufferId, RamClass, UsageHint, VertexBuffer};
pub use config::{MAX_PIPELINE_STAGES, VertexDataConfig};
pub use device::{DeviceContext, DeviceId, GraphicsDevice};
pub use error::{VertexDataError, VertexDataResult};
pub use format::{VertexColumn, VertexFormat};
pub use handle::{ReadHandle, WriteHandle};
pub use registry::{Registry, UpdateSeq};
pub use save_file::{SaveBlock, SaveFile};
pub use serialize::{Endian, STREAM_VERSION_MAJOR, STREAM_VERSION_MINOR};
pub use tier::{LruPage, LruTier, PageId};
