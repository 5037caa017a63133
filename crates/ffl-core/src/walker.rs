//! Chain walker: read-only traversal of the slot chain.
//!
//! Everything above the region primitives is built on this walk. A
//! step reads the header at the cursor, classifies it, and advances to
//! the successor; the walk ends at the first `Unwritten` kind byte
//! (virgin space), after a tail slot whose `next` field is still the
//! erased sentinel, or exactly at the region end. Anything else that
//! does not parse as a well-placed header is surfaced as
//! [`FlashError::Corruption`] — never repaired, never skipped.

use ffl_error::{FlashError, Result};
use ffl_region::FlashRegion;
use ffl_types::{
    NEXT_SENTINEL, PAGE_SIZE, ParseError, RegionOffset, SLOT_HEADER_SIZE, SlotHeader, SlotKind,
};

/// One committed slot produced by a walk step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    /// Region-relative offset of the slot header.
    pub offset: RegionOffset,
    pub header: SlotHeader,
}

impl ChainEntry {
    /// Offset one past this slot's extent.
    #[must_use]
    pub fn end_offset(&self) -> u32 {
        self.offset.0.saturating_add(self.header.size)
    }

    /// Offset of the successor header: the programmed `next`, or the
    /// slot's own end while the `next` field is still the erased
    /// sentinel (tail slot with no committed successor).
    #[must_use]
    pub fn successor(&self) -> u32 {
        if self.header.next == NEXT_SENTINEL {
            self.end_offset()
        } else {
            self.header.next
        }
    }
}

/// Streaming walk over committed slots from a given boundary.
///
/// Read-only; holds no state beyond the cursor. The step bound is
/// `region_len / PAGE_SIZE` — more slots than minimum-size pages
/// cannot exist, so exceeding it proves a cycle.
pub struct ChainWalker<'r> {
    region: &'r dyn FlashRegion,
    region_len: u32,
    cursor: u32,
    steps: u32,
    max_steps: u32,
    terminal: Option<u32>,
}

impl<'r> ChainWalker<'r> {
    /// Start a walk at `start`, which must be a page-aligned offset
    /// inside the region (0 for a full scan).
    pub fn new(region: &'r dyn FlashRegion, start: RegionOffset) -> Result<Self> {
        let region_len = region.len_bytes();
        if !start.is_page_aligned() || start.0 > region_len {
            return Err(FlashError::Corruption {
                offset: start.0,
                detail: "walk start is not a slot boundary".to_owned(),
            });
        }
        Ok(Self {
            region,
            region_len,
            cursor: start.0,
            steps: 0,
            max_steps: region_len / PAGE_SIZE,
            terminal: None,
        })
    }

    /// Advance one slot. `Ok(None)` means end-of-chain; afterwards
    /// [`Self::terminal_offset`] reports where the virgin tail begins.
    pub fn next_slot(&mut self) -> Result<Option<ChainEntry>> {
        if self.terminal.is_some() {
            return Ok(None);
        }
        if self.cursor == self.region_len {
            // Chain fills the region exactly; no virgin tail.
            self.terminal = Some(self.cursor);
            return Ok(None);
        }

        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(FlashError::Corruption {
                offset: self.cursor,
                detail: format!("walk exceeded {} steps (chain cycle)", self.max_steps),
            });
        }

        let offset = self.cursor;
        let mut header_bytes = [0_u8; SLOT_HEADER_SIZE as usize];
        self.region.read_exact_at(offset, &mut header_bytes)?;

        if header_bytes[0] == SlotKind::Unwritten.tag() {
            self.terminal = Some(offset);
            return Ok(None);
        }

        let header =
            SlotHeader::parse(&header_bytes).map_err(|err| parse_to_corruption(offset, &err))?;

        if header.size == 0 || header.size % PAGE_SIZE != 0 {
            return Err(FlashError::Corruption {
                offset,
                detail: format!("slot size {} is not a positive page multiple", header.size),
            });
        }
        let end = offset
            .checked_add(header.size)
            .filter(|end| *end <= self.region_len)
            .ok_or_else(|| FlashError::Corruption {
                offset,
                detail: format!("slot size {} overruns the region", header.size),
            })?;

        if header.next == NEXT_SENTINEL {
            // Tail slot: no successor was ever committed. The chain
            // ends here no matter what bytes follow — an orphan from
            // an interrupted append must stay unreachable.
            self.terminal = Some(end);
            self.cursor = end;
        } else {
            let successor = header.next;
            if successor % PAGE_SIZE != 0 || successor > self.region_len {
                return Err(FlashError::Corruption {
                    offset,
                    detail: format!(
                        "next {successor:#x} is outside the region or off page alignment"
                    ),
                });
            }
            self.cursor = successor;
        }

        Ok(Some(ChainEntry {
            offset: RegionOffset(offset),
            header,
        }))
    }

    /// Where the terminal `Unwritten` region begins (equals the region
    /// length when the chain fills it). `None` until the walk has
    /// returned `Ok(None)`.
    #[must_use]
    pub fn terminal_offset(&self) -> Option<RegionOffset> {
        self.terminal.map(RegionOffset)
    }
}

/// Boundary conversion: a header that fails to parse mid-chain means
/// the chain itself is damaged at that offset.
pub(crate) fn parse_to_corruption(offset: u32, err: &ParseError) -> FlashError {
    FlashError::Corruption {
        offset,
        detail: err.to_string(),
    }
}
