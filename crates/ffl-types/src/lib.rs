#![forbid(unsafe_code)]
//! On-media layout for the flash slot chain.
//!
//! A region is a flat sequence of slots. Each slot is a 40-byte header
//! followed by its payload; headers are parsed field-by-field from raw
//! bytes (never by aliasing memory) so the same code runs against real
//! hardware or an in-memory simulator.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Granularity of slot starts and slot sizes.
pub const PAGE_SIZE: u32 = 256;

/// Granularity of the hardware erase operation.
pub const ERASE_BLOCK_SIZE: u32 = 4096;

/// Slot header length in bytes: 1 (kind) + 31 (name) + 4 (size) + 4 (next).
pub const SLOT_HEADER_SIZE: u32 = 40;

/// Maximum name length (NUL-padded to 31 bytes on media).
pub const SLOT_NAME_CAPACITY: usize = 31;

/// Erased `next` field. A tail slot keeps this sentinel until a
/// successor is committed; programming the real offset over it is a
/// pure bit-clearing write.
pub const NEXT_SENTINEL: u32 = 0xFFFF_FFFF;

/// Byte offset relative to the region base.
///
/// Unit-carrying wrapper to keep offsets, lengths, and indices from
/// mixing. On-media offset fields are 32-bit, so the region is
/// addressed with `u32` throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionOffset(pub u32);

impl RegionOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u32) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u32) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    #[must_use]
    pub fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[must_use]
    pub fn is_block_aligned(self) -> bool {
        self.0 % ERASE_BLOCK_SIZE == 0
    }
}

impl fmt::Display for RegionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Round `len` up to the next multiple of [`PAGE_SIZE`], `None` on overflow.
#[must_use]
pub fn align_up_page(len: u32) -> Option<u32> {
    let rem = len % PAGE_SIZE;
    if rem == 0 {
        Some(len)
    } else {
        len.checked_add(PAGE_SIZE - rem)
    }
}

/// Round `offset` down to its erase-block base.
#[must_use]
pub fn block_floor(offset: u32) -> u32 {
    offset - offset % ERASE_BLOCK_SIZE
}

/// Round `offset` up to the next erase-block boundary, `None` on overflow.
#[must_use]
pub fn block_ceil(offset: u32) -> Option<u32> {
    let rem = offset % ERASE_BLOCK_SIZE;
    if rem == 0 {
        Some(offset)
    } else {
        offset.checked_add(ERASE_BLOCK_SIZE - rem)
    }
}

/// Slot content/state tag, first byte of every header.
///
/// The numeric values are on-media and fixed for interoperability with
/// existing images. `Unwritten` (all bits one) is what virgin erased
/// flash reads as; `Empty` (all bits zero) is reachable from any tag by
/// clearing bits, which is what makes in-place delete legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SlotKind {
    Empty = 0x00,
    Mod1 = 0x01,
    Mod2 = 0x02,
    Rom = 0x03,
    WritableRom = 0x04,
    UserMemoryImage = 0x10,
    ModuleMap = 0x20,
    GlobalSettings = 0x30,
    TracerSettings = 0x40,
    Unwritten = 0xFF,
}

impl SlotKind {
    /// Decode an on-media tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, ParseError> {
        match tag {
            0x00 => Ok(Self::Empty),
            0x01 => Ok(Self::Mod1),
            0x02 => Ok(Self::Mod2),
            0x03 => Ok(Self::Rom),
            0x04 => Ok(Self::WritableRom),
            0x10 => Ok(Self::UserMemoryImage),
            0x20 => Ok(Self::ModuleMap),
            0x30 => Ok(Self::GlobalSettings),
            0x40 => Ok(Self::TracerSettings),
            0xFF => Ok(Self::Unwritten),
            _ => Err(ParseError::UnknownTag { tag }),
        }
    }

    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Deleted or virgin space, i.e. not a catalog entry.
    #[must_use]
    pub fn is_free(self) -> bool {
        matches!(self, Self::Empty | Self::Unwritten)
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Empty => "empty",
            Self::Mod1 => "mod1",
            Self::Mod2 => "mod2",
            Self::Rom => "rom",
            Self::WritableRom => "writable-rom",
            Self::UserMemoryImage => "user-memory-image",
            Self::ModuleMap => "module-map",
            Self::GlobalSettings => "global-settings",
            Self::TracerSettings => "tracer-settings",
            Self::Unwritten => "unwritten",
        };
        f.write_str(name)
    }
}

/// Parsed slot header.
///
/// `size` is the total slot length including the header; `next` is the
/// region-relative offset of the successor header, or [`NEXT_SENTINEL`]
/// when no successor has been committed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHeader {
    pub kind: SlotKind,
    pub name: String,
    pub size: u32,
    pub next: u32,
}

impl SlotHeader {
    /// Parse a header from the first [`SLOT_HEADER_SIZE`] bytes of `data`.
    ///
    /// An `Unwritten` header is virgin flash; its name bytes are all-ones
    /// and are not decoded.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let tag = ensure_slice(data, 0, 1)?[0];
        let kind = SlotKind::from_tag(tag)?;
        let name = if kind == SlotKind::Unwritten {
            String::new()
        } else {
            trim_nul_padded(ensure_slice(data, 1, SLOT_NAME_CAPACITY)?)
        };
        let size = read_le_u32(data, 32)?;
        let next = read_le_u32(data, 36)?;
        Ok(Self {
            kind,
            name,
            size,
            next,
        })
    }

    /// Encode to on-media form.
    ///
    /// Rejects names longer than [`SLOT_NAME_CAPACITY`] bytes; shorter
    /// names are NUL-padded.
    pub fn encode(&self) -> Result<[u8; SLOT_HEADER_SIZE as usize], ParseError> {
        let name = self.name.as_bytes();
        if name.len() > SLOT_NAME_CAPACITY {
            return Err(ParseError::InvalidField {
                field: "name",
                reason: "longer than 31 bytes",
            });
        }
        let mut out = [0_u8; SLOT_HEADER_SIZE as usize];
        out[0] = self.kind.tag();
        out[1..1 + name.len()].copy_from_slice(name);
        out[32..36].copy_from_slice(&self.size.to_le_bytes());
        out[36..40].copy_from_slice(&self.next.to_le_bytes());
        Ok(out)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("unknown slot kind tag {tag:#04x}")]
    UnknownTag { tag: u8 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}
