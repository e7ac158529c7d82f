//! The durable stream format for vertex buffers.
//!
//! A serialized buffer is written in the *stream's* endianness, which need
//! not match the machine's. Layout:
//!
//! ```text
//! +--------------------+
//! | magic "VTXD"       |  4 bytes
//! | endian flag        |  1 byte (0 = little, 1 = big)
//! | version major      |  u16
//! | version minor      |  u16
//! | usage hint         |  u8
//! | byte count         |  u32
//! | raw bytes          |  byte-count bytes, endian-normalized per format
//! | stride             |  u32
//! | column count       |  u16
//! | per column:        |  start u32, components u8, component bytes u8
//! +--------------------+
//! ```
//!
//! The column schema trails the payload, mirroring the original format's
//! deferred pointer resolution: a reader staging a foreign-endian payload
//! does not yet know how to flip it, so the buffer records
//! `endian_reversed` and the flip runs at finalization, after the schema is
//! interned. Multi-byte header fields are themselves written in the
//! stream's endianness; the flag byte is read first to disambiguate.

use crate::buffer::{UsageHint, VertexBuffer};
use crate::error::{VertexDataError, VertexDataResult};
use crate::format::{VertexColumn, VertexFormat};
use crate::registry::Registry;
use bytes::{Buf, BufMut};
use std::sync::Arc;

/// Magic bytes identifying a vertex data stream.
pub const STREAM_MAGIC: [u8; 4] = *b"VTXD";

/// Current stream format major version. Other majors are unreadable.
pub const STREAM_VERSION_MAJOR: u16 = 1;

/// Current stream format minor version.
pub const STREAM_VERSION_MINOR: u16 = 2;

/// Before this minor version, the payload carried a redundant inner length
/// word left over from the generic array serializer.
const RAW_DATA_MINOR_VERSION: u16 = 2;

/// Byte order of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Least-significant byte first.
    Little,
    /// Most-significant byte first.
    Big,
}

impl Endian {
    /// The byte order of the machine we are running on.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    /// The opposite byte order.
    pub const fn swapped(self) -> Self {
        match self {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        }
    }

    fn flag(self) -> u8 {
        match self {
            Endian::Little => 0,
            Endian::Big => 1,
        }
    }

    fn from_flag(flag: u8) -> VertexDataResult<Self> {
        match flag {
            0 => Ok(Endian::Little),
            1 => Ok(Endian::Big),
            _ => Err(VertexDataError::Malformed("unknown endian flag")),
        }
    }
}

fn put_u16(out: &mut impl BufMut, value: u16, endian: Endian) {
    match endian {
        Endian::Little => out.put_u16_le(value),
        Endian::Big => out.put_u16(value),
    }
}

fn put_u32(out: &mut impl BufMut, value: u32, endian: Endian) {
    match endian {
        Endian::Little => out.put_u32_le(value),
        Endian::Big => out.put_u32(value),
    }
}

fn need(src: &impl Buf, bytes: usize) -> VertexDataResult<()> {
    if src.remaining() < bytes {
        return Err(VertexDataError::Truncated);
    }
    Ok(())
}

fn get_u8(src: &mut impl Buf) -> VertexDataResult<u8> {
    need(src, 1)?;
    Ok(src.get_u8())
}

fn get_u16(src: &mut impl Buf, endian: Endian) -> VertexDataResult<u16> {
    need(src, 2)?;
    Ok(match endian {
        Endian::Little => src.get_u16_le(),
        Endian::Big => src.get_u16(),
    })
}

fn get_u32(src: &mut impl Buf, endian: Endian) -> VertexDataResult<u32> {
    need(src, 4)?;
    Ok(match endian {
        Endian::Little => src.get_u32_le(),
        Endian::Big => src.get_u32(),
    })
}

/// Serialize a buffer into `out` with the given stream endianness.
///
/// The buffer is forced resident first. When the stream endianness differs
/// from native, the payload is converted per the buffer's format: within
/// each row, every multi-byte component's bytes are reversed.
pub fn write_buffer(
    buffer: &VertexBuffer,
    out: &mut impl BufMut,
    endian: Endian,
) -> VertexDataResult<()> {
    let handle = buffer.read_handle(0);
    let data = handle.as_slice();
    if data.len() > u32::MAX as usize {
        return Err(VertexDataError::BufferTooLarge { size: data.len() });
    }
    let format = buffer.format();
    assert!(
        format.num_columns() <= u16::MAX as usize,
        "format has too many columns for the stream header"
    );

    out.put_slice(&STREAM_MAGIC);
    out.put_u8(endian.flag());
    put_u16(out, STREAM_VERSION_MAJOR, endian);
    put_u16(out, STREAM_VERSION_MINOR, endian);
    out.put_u8(handle.usage_hint().to_u8());
    put_u32(out, data.len() as u32, endian);
    if endian == Endian::native() {
        out.put_slice(data);
    } else {
        out.put_slice(&format.reverse_endianness(data));
    }

    put_u32(out, format.stride() as u32, endian);
    put_u16(out, format.num_columns() as u16, endian);
    for column in format.columns() {
        put_u32(out, column.start() as u32, endian);
        out.put_u8(column.num_components() as u8);
        out.put_u8(column.component_bytes() as u8);
    }
    Ok(())
}

/// Deserialize a buffer from `src` into the registry.
///
/// The schema read from the stream is interned (which may substitute a
/// previously-registered canonical equivalent) and the returned buffer is
/// resident with its LRU entry sized. A foreign-endian payload is staged
/// as-is and flipped at finalization, once the schema is known.
pub fn read_buffer(
    registry: &Arc<Registry>,
    src: &mut impl Buf,
) -> VertexDataResult<Arc<VertexBuffer>> {
    need(src, STREAM_MAGIC.len())?;
    let mut magic = [0u8; 4];
    src.copy_to_slice(&mut magic);
    if magic != STREAM_MAGIC {
        return Err(VertexDataError::BadMagic);
    }

    let endian = Endian::from_flag(get_u8(src)?)?;
    let major = get_u16(src, endian)?;
    let minor = get_u16(src, endian)?;
    if major != STREAM_VERSION_MAJOR {
        return Err(VertexDataError::StaleVersion { major, minor });
    }

    let usage = UsageHint::from_u8(get_u8(src)?)
        .ok_or(VertexDataError::Malformed("unknown usage hint"))?;

    let size = get_u32(src, endian)? as usize;
    if minor < RAW_DATA_MINOR_VERSION {
        // Older streams wrapped the payload in the generic array
        // serializer, which wrote its own length word first.
        let inner = get_u32(src, endian)? as usize;
        if inner != size {
            return Err(VertexDataError::Malformed("inner length mismatch"));
        }
    }
    need(src, size)?;
    let mut data = vec![0u8; size];
    src.copy_to_slice(&mut data);

    let stride = get_u32(src, endian)? as usize;
    let num_columns = get_u16(src, endian)? as usize;
    let mut columns = Vec::with_capacity(num_columns);
    for _ in 0..num_columns {
        let start = get_u32(src, endian)? as usize;
        let num_components = get_u8(src)? as usize;
        let component_bytes = get_u8(src)? as usize;
        if num_components == 0 || component_bytes == 0 {
            return Err(VertexDataError::Malformed("empty column"));
        }
        columns.push(VertexColumn::new(start, num_components, component_bytes));
    }
    if !VertexFormat::columns_fit(&columns, stride) {
        return Err(VertexDataError::Malformed("column extends past stride"));
    }

    let format = registry.register_format(VertexFormat::new(columns, stride));
    let buffer = registry.create_buffer(format, usage);
    buffer.fill_from_stream(data, usage, endian != Endian::native());
    buffer.finalize_stream_read();
    Ok(buffer)
}
