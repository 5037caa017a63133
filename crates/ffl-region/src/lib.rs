#![forbid(unsafe_code)]
//! Flash region access layer.
//!
//! Provides the [`FlashRegion`] trait over a byte-addressable,
//! page-erasable memory region, two implementations (an in-memory
//! simulator with real NOR semantics and a file-backed image region),
//! and the verified operations [`program_bytes`] and [`erase_blocks`]
//! that every mutation above this layer goes through.
//!
//! The physical constraint this layer encodes: programming can only
//! clear bits (1→0); only a block erase sets bits back to one. The raw
//! trait methods are the hardware primitives; the free functions wrap
//! them with bounds checks, bit-transition legality checks, and
//! read-back verification.

use ffl_error::{FlashError, Result};
use ffl_types::{ERASE_BLOCK_SIZE, PAGE_SIZE, block_ceil, block_floor};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressable flash region with erase/program hardware primitives.
///
/// `program_raw` has hardware AND semantics: bits already zero stay
/// zero regardless of the requested value. Callers are expected to
/// prove legality first (see [`program_bytes`]); the raw method exists
/// so illegal writes corrupt detectably in the simulator exactly as
/// they would on real parts.
pub trait FlashRegion: Send + Sync {
    /// Total region length in bytes.
    fn len_bytes(&self) -> u32;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_exact_at(&self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Hardware program primitive: clear bits per `bytes`.
    fn program_raw(&self, offset: u32, bytes: &[u8]) -> Result<()>;

    /// Hardware erase primitive: set `[offset, offset + len)` to
    /// all-ones. Both `offset` and `len` must be multiples of
    /// [`ERASE_BLOCK_SIZE`].
    fn erase_raw(&self, offset: u32, len: u32) -> Result<()>;
}

fn range_len(offset: u32, byte_len: usize, region_len: u32) -> Result<u32> {
    let len = u32::try_from(byte_len).map_err(|_| FlashError::BoundsExceeded {
        offset,
        len: u32::MAX,
        region_len,
    })?;
    let end = offset.checked_add(len).ok_or(FlashError::BoundsExceeded {
        offset,
        len,
        region_len,
    })?;
    if end > region_len {
        return Err(FlashError::BoundsExceeded {
            offset,
            len,
            region_len,
        });
    }
    Ok(len)
}

fn check_block_aligned(offset: u32, len: u32, region_len: u32) -> Result<()> {
    if offset % ERASE_BLOCK_SIZE != 0 || len % ERASE_BLOCK_SIZE != 0 {
        return Err(FlashError::BoundsExceeded {
            offset,
            len,
            region_len,
        });
    }
    Ok(())
}

/// In-memory region with true NOR flash semantics.
///
/// Starts fully erased (all-ones). Programs AND into the existing
/// bytes, so a write skipping the legality check leaves the same
/// wrong value a real part would. Substitutable for hardware in every
/// test.
#[derive(Debug)]
pub struct MemFlashRegion {
    bytes: Mutex<Vec<u8>>,
}

impl MemFlashRegion {
    /// Create a fully-erased region of `len` bytes.
    #[must_use]
    pub fn new(len: u32) -> Self {
        Self {
            bytes: Mutex::new(vec![0xFF_u8; len as usize]),
        }
    }

    /// Build a region from existing image bytes (for corruption tests
    /// and pre-populated fixtures).
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }
}

impl FlashRegion for MemFlashRegion {
    fn len_bytes(&self) -> u32 {
        let len = self.bytes.lock().len();
        u32::try_from(len).unwrap_or(u32::MAX)
    }

    fn read_exact_at(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let region_len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        let len = range_len(offset, buf.len(), region_len)?;
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + len as usize]);
        drop(bytes);
        Ok(())
    }

    fn program_raw(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut mem = self.bytes.lock();
        let region_len = u32::try_from(mem.len()).unwrap_or(u32::MAX);
        let _ = range_len(offset, bytes.len(), region_len)?;
        let start = offset as usize;
        for (cell, value) in mem[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *value;
        }
        drop(mem);
        Ok(())
    }

    fn erase_raw(&self, offset: u32, len: u32) -> Result<()> {
        let mut mem = self.bytes.lock();
        let region_len = u32::try_from(mem.len()).unwrap_or(u32::MAX);
        check_block_aligned(offset, len, region_len)?;
        let _ = range_len(offset, len as usize, region_len)?;
        let start = offset as usize;
        mem[start..start + len as usize].fill(0xFF);
        drop(mem);
        Ok(())
    }
}

/// Image-file-backed region using pread/pwrite style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared
/// seek position. Programming reads the current bytes and writes the
/// AND, preserving the hardware semantics on a plain file.
#[derive(Debug, Clone)]
pub struct FileFlashRegion {
    file: Arc<std::fs::File>,
    len: u32,
}

impl FileFlashRegion {
    /// Open an existing image file read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let len = u32::try_from(len).map_err(|_| {
            FlashError::Parse(format!("image larger than 4 GiB: {len} bytes"))
        })?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create a new image file of `len` bytes, fully erased (all-ones).
    pub fn create(path: impl AsRef<Path>, len: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let block = [0xFF_u8; 8192];
        let mut remaining = len as usize;
        while remaining > 0 {
            let chunk = remaining.min(block.len());
            file.write_all(&block[..chunk])?;
            remaining -= chunk;
        }
        file.sync_all()?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl FlashRegion for FileFlashRegion {
    fn len_bytes(&self) -> u32 {
        self.len
    }

    fn read_exact_at(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let _ = range_len(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, u64::from(offset))?;
        Ok(())
    }

    fn program_raw(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let _ = range_len(offset, bytes.len(), self.len)?;
        let mut current = vec![0_u8; bytes.len()];
        self.file.read_exact_at(&mut current, u64::from(offset))?;
        for (cell, value) in current.iter_mut().zip(bytes) {
            *cell &= *value;
        }
        self.file.write_all_at(&current, u64::from(offset))?;
        Ok(())
    }

    fn erase_raw(&self, offset: u32, len: u32) -> Result<()> {
        check_block_aligned(offset, len, self.len)?;
        let _ = range_len(offset, len as usize, self.len)?;
        let ones = vec![0xFF_u8; len as usize];
        self.file.write_all_at(&ones, u64::from(offset))?;
        Ok(())
    }
}

/// True iff `desired` is reachable from `current` by clearing bits only.
#[inline]
#[must_use]
pub fn is_programmable(current: u8, desired: u8) -> bool {
    (current & desired) ^ desired == 0
}

/// Absolute offset of the first byte in `[offset, offset + bytes.len())`
/// whose transition to the corresponding `bytes` value would require
/// setting a bit, or `None` when the whole range is program-legal.
fn first_illegal_offset(region: &dyn FlashRegion, offset: u32, bytes: &[u8]) -> Result<Option<u32>> {
    let mut current = vec![0_u8; bytes.len()];
    region.read_exact_at(offset, &mut current)?;
    for (index, (cur, want)) in current.iter().zip(bytes).enumerate() {
        if !is_programmable(*cur, *want) {
            let index = u32::try_from(index).map_err(|_| FlashError::BoundsExceeded {
                offset,
                len: u32::MAX,
                region_len: region.len_bytes(),
            })?;
            return Ok(Some(offset + index));
        }
    }
    Ok(None)
}

/// Byte-wise [`is_programmable`] across a run; false on the first violation.
pub fn is_programmable_range(region: &dyn FlashRegion, offset: u32, bytes: &[u8]) -> Result<bool> {
    Ok(first_illegal_offset(region, offset, bytes)?.is_none())
}

/// Program `bytes` at `offset` and verify every byte by read-back.
///
/// `offset` must be page-aligned and `bytes.len()` a multiple of
/// [`PAGE_SIZE`]; a misaligned request is refused as
/// [`FlashError::BoundsExceeded`] before any hardware call. A
/// transition that would set bits is refused as
/// [`FlashError::ProgramIllegal`]; a read-back mismatch after the
/// hardware program is [`FlashError::VerifyFailed`].
pub fn program_bytes(region: &dyn FlashRegion, offset: u32, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let region_len = region.len_bytes();
    let len = range_len(offset, bytes.len(), region_len)?;
    if offset % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
        return Err(FlashError::BoundsExceeded {
            offset,
            len,
            region_len,
        });
    }

    if let Some(violation) = first_illegal_offset(region, offset, bytes)? {
        return Err(FlashError::ProgramIllegal { offset: violation });
    }

    region.program_raw(offset, bytes)?;
    verify_range(region, offset, bytes)
}

/// Read back `[offset, offset + expected.len())` and compare, reporting
/// the offset of the first mismatching byte. Full-range: comparison
/// never stops early on a match prefix.
pub fn verify_range(region: &dyn FlashRegion, offset: u32, expected: &[u8]) -> Result<()> {
    let mut actual = vec![0_u8; expected.len()];
    region.read_exact_at(offset, &mut actual)?;
    for (index, (got, want)) in actual.iter().zip(expected).enumerate() {
        if got != want {
            let index = u32::try_from(index).unwrap_or(0);
            return Err(FlashError::VerifyFailed {
                offset: offset + index,
            });
        }
    }
    Ok(())
}

/// Erase `[start, end)`, preserving foreign bytes that share the
/// boundary erase blocks.
///
/// The hardware erases whole [`ERASE_BLOCK_SIZE`] blocks, so `start`
/// rounds down and `end` rounds up; bytes in the boundary blocks but
/// outside `[start, end)` are copied out first and reprogrammed after
/// the erase (always legal onto fresh all-ones flash). When both
/// bounds fall inside the same block the head and tail runs are still
/// restored exactly once each. `start == end` is a no-op: no erase is
/// issued at all.
pub fn erase_blocks(region: &dyn FlashRegion, start: u32, end: u32) -> Result<()> {
    let region_len = region.len_bytes();
    if start > end || end > region_len {
        return Err(FlashError::BoundsExceeded {
            offset: start,
            len: end.saturating_sub(start),
            region_len,
        });
    }
    if start == end {
        return Ok(());
    }

    let blk_start = block_floor(start);
    let blk_end = block_ceil(end).ok_or(FlashError::BoundsExceeded {
        offset: start,
        len: end - start,
        region_len,
    })?;
    if blk_end > region_len {
        return Err(FlashError::BoundsExceeded {
            offset: blk_start,
            len: blk_end - blk_start,
            region_len,
        });
    }

    let head = read_run(region, blk_start, start)?;
    let tail = read_run(region, end, blk_end)?;

    region.erase_raw(blk_start, blk_end - blk_start)?;

    if let Some(bytes) = &head {
        region.program_raw(blk_start, bytes)?;
        verify_range(region, blk_start, bytes)?;
    }
    if let Some(bytes) = &tail {
        region.program_raw(end, bytes)?;
        verify_range(region, end, bytes)?;
    }
    Ok(())
}

fn read_run(region: &dyn FlashRegion, from: u32, to: u32) -> Result<Option<Vec<u8>>> {
    if from == to {
        return Ok(None);
    }
    let mut bytes = vec![0_u8; (to - from) as usize];
    region.read_exact_at(from, &mut bytes)?;
    Ok(Some(bytes))
}
