//! Array formats: the row schema that describes a vertex buffer's bytes.
//!
//! A [`VertexFormat`] is an ordered list of columns, each occupying a byte
//! range within a fixed-stride row. The format drives endianness
//! normalization during serialization and the row arithmetic on handles.
//!
//! Formats are interned: equal schemas share one canonical `Arc`, and a
//! buffer may only be constructed with a canonical format.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// One column of a vertex row: a run of equally-sized numeric components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexColumn {
    start: usize,
    num_components: usize,
    component_bytes: usize,
}

impl VertexColumn {
    /// Create a column starting at `start` bytes into the row, holding
    /// `num_components` components of `component_bytes` bytes each.
    pub fn new(start: usize, num_components: usize, component_bytes: usize) -> Self {
        assert!(num_components > 0, "column must have at least one component");
        assert!(component_bytes > 0, "component width must be nonzero");
        Self {
            start,
            num_components,
            component_bytes,
        }
    }

    /// Byte offset of the column within a row.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of components in the column.
    pub fn num_components(&self) -> usize {
        self.num_components
    }

    /// Width of each component in bytes.
    pub fn component_bytes(&self) -> usize {
        self.component_bytes
    }

    /// Byte offset one past the end of the column.
    pub fn end(&self) -> usize {
        self.start + self.num_components * self.component_bytes
    }
}

/// The schema of one vertex row: ordered columns plus the row stride.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexFormat {
    columns: Vec<VertexColumn>,
    stride: usize,
}

impl VertexFormat {
    /// Create a format from its columns and row stride.
    ///
    /// # Panics
    ///
    /// Panics if any column extends past the stride.
    pub fn new(columns: Vec<VertexColumn>, stride: usize) -> Self {
        assert!(
            Self::columns_fit(&columns, stride),
            "column extends past the row stride"
        );
        Self { columns, stride }
    }

    pub(crate) fn columns_fit(columns: &[VertexColumn], stride: usize) -> bool {
        columns.iter().all(|c| c.end() <= stride)
    }

    /// Row width in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The columns of the format, in order.
    pub fn columns(&self) -> &[VertexColumn] {
        &self.columns
    }

    /// Number of columns.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Return a copy of `source` with every multi-byte component's bytes
    /// reversed, converting little-endian data to big-endian and vice versa.
    ///
    /// Walks each full row; bytes past the last full row (and row bytes not
    /// covered by any column) are copied through unchanged.
    pub(crate) fn reverse_endianness(&self, source: &[u8]) -> Vec<u8> {
        let mut dest = source.to_vec();
        if self.stride == 0 {
            return dest;
        }
        let mut row = 0;
        while row + self.stride <= source.len() {
            for column in &self.columns {
                if column.component_bytes > 1 {
                    for c in 0..column.num_components {
                        let at = row + column.start + c * column.component_bytes;
                        dest[at..at + column.component_bytes].reverse();
                    }
                }
            }
            row += self.stride;
        }
        dest
    }
}

/// Intern table mapping schemas to their canonical `Arc`.
pub(crate) struct FormatRegistry {
    formats: Mutex<AHashMap<VertexFormat, Arc<VertexFormat>>>,
}

impl FormatRegistry {
    pub(crate) fn new() -> Self {
        Self {
            formats: Mutex::new(AHashMap::new()),
        }
    }

    /// Intern a format, returning the canonical `Arc` for its schema.
    ///
    /// If an equal schema was registered before, the previously-interned
    /// `Arc` is returned and `format` is discarded.
    pub(crate) fn register(&self, format: VertexFormat) -> Arc<VertexFormat> {
        let mut formats = self.formats.lock();
        if let Some(canonical) = formats.get(&format) {
            return canonical.clone();
        }
        let canonical = Arc::new(format.clone());
        formats.insert(format, canonical.clone());
        canonical
    }

    /// Whether `format` is the canonical `Arc` for its schema.
    pub(crate) fn is_canonical(&self, format: &Arc<VertexFormat>) -> bool {
        self.formats
            .lock()
            .get(format.as_ref())
            .is_some_and(|canonical| Arc::ptr_eq(canonical, format))
    }
}
