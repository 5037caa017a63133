#![forbid(unsafe_code)]
//! Slot-chain allocation and free-space management.
//!
//! A [`Filer`] owns one flash region and exposes everything above the
//! programming primitives: the chain walk, the two free-space search
//! strategies, the crash-consistent committer, in-place delete, and
//! the catalog queries. Data flows one way — catalog and writer sit on
//! the allocator, the allocator on the walker, the walker on the
//! region — with no feedback edge and no state held outside the media
//! itself.
//!
//! ## Crash consistency
//!
//! A tail slot keeps its `next` field erased ([`NEXT_SENTINEL`]), so
//! appending works in strictly increasing commitment: program the new
//! header and payload into virgin space (unreachable — the
//! predecessor still ends the chain), verify the full extent, then
//! program the predecessor's `next`. That link is the last physical
//! write and the atomicity boundary: power loss anywhere earlier
//! leaves the new slot orphaned and the chain exactly as it was.
//!
//! Reusing a reclaimed (`Empty`) run cannot use the link trick — the
//! predecessor already points at the destination — so there the
//! header page is programmed last: the continuation link reappears in
//! the same page-program that makes the slot visible, and a crash in
//! between leaves a chain that is shorter but walkable.

mod walker;

pub use walker::{ChainEntry, ChainWalker};

use ffl_error::{FlashError, Result};
use ffl_region::{FlashRegion, erase_blocks, program_bytes, verify_range};
use ffl_types::{
    ERASE_BLOCK_SIZE, NEXT_SENTINEL, PAGE_SIZE, RegionOffset, SLOT_HEADER_SIZE,
    SLOT_NAME_CAPACITY, SlotHeader, SlotKind, align_up_page,
};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Free-space search strategy, selected by the caller per commit.
///
/// `FirstFit` fills reclaimed holes near the front of the chain,
/// containing fragmentation; `LastFree` targets the highest-offset
/// virgin space, avoiding the erase a reclaimed hole usually needs
/// and so spreading wear. The allocator never chooses on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocStrategy {
    FirstFit,
    #[default]
    LastFree,
}

/// Catalog view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub offset: RegionOffset,
    pub kind: SlotKind,
    pub name: String,
    /// Total extent including the 40-byte header.
    pub size: u32,
}

impl SlotInfo {
    fn from_entry(entry: &ChainEntry) -> Self {
        Self {
            offset: entry.offset,
            kind: entry.header.kind,
            name: entry.header.name.clone(),
            size: entry.header.size,
        }
    }

    /// Payload bytes available in this slot.
    #[must_use]
    pub fn payload_capacity(&self) -> u32 {
        self.size.saturating_sub(SLOT_HEADER_SIZE)
    }
}

/// Context the committer needs about a destination offset: the slot
/// linking to it, the reclaimable run starting at it, and where the
/// virgin tail begins.
struct Survey {
    prev: Option<ChainEntry>,
    run_occupied: u32,
    continuation: u32,
    terminal: u32,
}

/// The filer: allocation, commit, delete, and catalog over one region.
///
/// Single-writer by contract — the caller serializes mutations and
/// keeps read traversals out of mutation windows. The region is the
/// only state; every query is a fresh walk.
pub struct Filer<R: FlashRegion> {
    region: R,
    region_len: u32,
}

impl<R: FlashRegion> Filer<R> {
    /// Wrap a region, validating its geometry: non-empty and a whole
    /// number of erase blocks.
    pub fn new(region: R) -> Result<Self> {
        let region_len = region.len_bytes();
        if region_len == 0 || region_len % ERASE_BLOCK_SIZE != 0 {
            return Err(FlashError::Format(format!(
                "region length {region_len} is not a positive multiple of {ERASE_BLOCK_SIZE}"
            )));
        }
        Ok(Self { region, region_len })
    }

    #[must_use]
    pub fn region(&self) -> &R {
        &self.region
    }

    #[must_use]
    pub fn region_len(&self) -> u32 {
        self.region_len
    }

    /// Start a read-only chain walk at `start` (0 for a full scan).
    pub fn walker(&self, start: RegionOffset) -> Result<ChainWalker<'_>> {
        ChainWalker::new(&self.region, start)
    }

    // ── Free-space allocator ────────────────────────────────────────

    /// First-fit search from `start` for a slot holding `payload_len`
    /// payload bytes.
    ///
    /// Contiguous `Empty` slots (plus the virgin tail, when the run
    /// ends at it) count as one candidate region; the first candidate
    /// whose accumulated length fits wins. `NotFound` when the walk
    /// reaches the region end without a fit; corruption from the walk
    /// is surfaced, not swallowed.
    pub fn find_first_fit(&self, start: RegionOffset, payload_len: u32) -> Result<RegionOffset> {
        let needed = self.slot_size_for(payload_len)?;
        let mut walker = self.walker(start)?;
        let mut run: Option<(u32, u32)> = None;

        while let Some(entry) = walker.next_slot()? {
            if entry.header.kind == SlotKind::Empty {
                match &mut run {
                    Some((run_start, run_len)) if *run_start + *run_len == entry.offset.0 => {
                        *run_len += entry.header.size;
                    }
                    _ => run = Some((entry.offset.0, entry.header.size)),
                }
            } else if let Some((run_start, run_len)) = run.take() {
                if run_len >= needed {
                    trace!(offset = run_start, run_len, needed, "first-fit: reclaimed run");
                    return Ok(RegionOffset(run_start));
                }
            }
        }

        let terminal = walker.terminal_offset().map_or(self.region_len, |o| o.0);
        let tail_len = self.region_len - terminal;
        if let Some((run_start, run_len)) = run {
            let available = if run_start + run_len == terminal {
                run_len + tail_len
            } else {
                run_len
            };
            if available >= needed {
                trace!(offset = run_start, available, needed, "first-fit: terminal run");
                return Ok(RegionOffset(run_start));
            }
        }
        if tail_len >= needed {
            trace!(offset = terminal, tail_len, needed, "first-fit: virgin tail");
            return Ok(RegionOffset(terminal));
        }
        Err(FlashError::NotFound(format!(
            "no free run of {needed} bytes from {start}"
        )))
    }

    /// Offset of the highest-offset virgin space: where the terminal
    /// `Unwritten` region begins. `NotFound` when the chain fills the
    /// region exactly.
    pub fn find_last_free(&self, start: RegionOffset) -> Result<RegionOffset> {
        let mut walker = self.walker(start)?;
        while walker.next_slot()?.is_some() {}
        let terminal = walker.terminal_offset().map_or(self.region_len, |o| o.0);
        if terminal == self.region_len {
            return Err(FlashError::NotFound("no unwritten space left".to_owned()));
        }
        Ok(RegionOffset(terminal))
    }

    // ── Writer / committer ──────────────────────────────────────────

    /// Commit a new slot: allocate per `strategy`, erase exactly the
    /// claimed extent if it is not virgin, program, verify the full
    /// extent, and link. Returns the new slot's offset.
    pub fn commit(
        &self,
        kind: SlotKind,
        name: &str,
        payload: &[u8],
        strategy: AllocStrategy,
    ) -> Result<RegionOffset> {
        if kind.is_free() {
            return Err(FlashError::Format(format!(
                "cannot commit a slot of free kind {kind}"
            )));
        }
        if name.is_empty() || name.len() > SLOT_NAME_CAPACITY {
            return Err(FlashError::Format(format!(
                "slot name must be 1..={SLOT_NAME_CAPACITY} bytes, got {}",
                name.len()
            )));
        }
        let payload_len = u32::try_from(payload.len()).map_err(|_| FlashError::BoundsExceeded {
            offset: 0,
            len: u32::MAX,
            region_len: self.region_len,
        })?;
        let total = self.slot_size_for(payload_len)?;

        let dest = match strategy {
            AllocStrategy::FirstFit => self.find_first_fit(RegionOffset::ZERO, payload_len)?,
            AllocStrategy::LastFree => {
                let dest = self.find_last_free(RegionOffset::ZERO)?;
                if self.region_len - dest.0 < total {
                    return Err(FlashError::NotFound(format!(
                        "no unwritten run of {total} bytes at the chain tail"
                    )));
                }
                dest
            }
        };
        debug!(%dest, total, ?strategy, name, %kind, "committing slot");

        let survey = self.survey(dest.0)?;
        let appending = dest.0 == survey.terminal;

        // Claim extent, the new header's next field, and the residual
        // Empty header that keeps the chain tiled when a reclaimed run
        // is longer than the claim.
        let (claim_end, new_next, residual) = if appending {
            (dest.0 + total, NEXT_SENTINEL, None)
        } else {
            if survey.run_occupied == 0 {
                return Err(FlashError::Format(format!(
                    "destination {dest} is neither virgin nor a reclaimed run"
                )));
            }
            let run = survey.run_occupied;
            let tail_len = if survey.continuation == survey.terminal {
                self.region_len - survey.terminal
            } else {
                0
            };
            if total > run + tail_len {
                return Err(FlashError::NotFound(format!(
                    "reclaimed run at {dest} shrank below {total} bytes"
                )));
            }
            if total == run {
                (dest.0 + total, survey.continuation, None)
            } else if total < run {
                let residual_start = dest.0 + total;
                let header = SlotHeader {
                    kind: SlotKind::Empty,
                    name: String::new(),
                    size: run - total,
                    next: survey.continuation,
                };
                // Claim one extra page so the residual header lands on
                // erased flash.
                (residual_start + PAGE_SIZE, residual_start, Some((residual_start, header)))
            } else {
                // The run merges into the virgin tail and the new slot
                // becomes the chain tail.
                (dest.0 + total, NEXT_SENTINEL, None)
            }
        };

        if !self.extent_is_virgin(dest.0, claim_end)? {
            trace!(start = dest.0, end = claim_end, "erasing claimed extent");
            erase_blocks(&self.region, dest.0, claim_end)?;
        }

        let header = SlotHeader {
            kind,
            name: name.to_owned(),
            size: total,
            next: new_next,
        };
        let mut buffer = vec![0xFF_u8; total as usize];
        buffer[..SLOT_HEADER_SIZE as usize]
            .copy_from_slice(&header.encode().map_err(|err| FlashError::Parse(err.to_string()))?);
        buffer[SLOT_HEADER_SIZE as usize..SLOT_HEADER_SIZE as usize + payload.len()]
            .copy_from_slice(payload);

        if appending {
            // Header first, then payload; the slot stays unreachable
            // until the predecessor link below.
            program_bytes(&self.region, dest.0, &buffer)?;
        } else {
            if let Some((residual_start, residual_header)) = &residual {
                let mut page = vec![0xFF_u8; PAGE_SIZE as usize];
                page[..SLOT_HEADER_SIZE as usize].copy_from_slice(
                    &residual_header
                        .encode()
                        .map_err(|err| FlashError::Parse(err.to_string()))?,
                );
                program_bytes(&self.region, *residual_start, &page)?;
            }
            if buffer.len() > PAGE_SIZE as usize {
                program_bytes(&self.region, dest.0 + PAGE_SIZE, &buffer[PAGE_SIZE as usize..])?;
            }
            // Header page last: the continuation link and the slot's
            // visibility arrive in the same program.
            if let Err(err) = program_bytes(&self.region, dest.0, &buffer[..PAGE_SIZE as usize]) {
                if matches!(err, FlashError::VerifyFailed { .. }) {
                    self.remark_empty_best_effort(dest.0);
                }
                return Err(err);
            }
        }

        // Full-range read-back of everything written, never early-exit.
        verify_range(&self.region, dest.0, &buffer)?;

        if appending {
            if let Some(prev) = &survey.prev {
                // Commit point: the only write that makes the slot
                // reachable. On verify failure above we never get here
                // and the slot stays orphaned.
                self.link_next(prev.offset.0, dest.0)?;
            }
        }
        debug!(%dest, total, "slot committed");
        Ok(dest)
    }

    /// Delete a slot in place by reprogramming its kind tag to
    /// `Empty`. Always a pure bit-clearing transition (the tag 0x00
    /// has no set bits); anything else the header page rewrite would
    /// require is refused by the programming primitive rather than
    /// silently corrupted.
    pub fn delete(&self, name: &str) -> Result<()> {
        let info = self.find_by_name(name)?;
        let mut page = vec![0_u8; PAGE_SIZE as usize];
        self.region.read_exact_at(info.offset.0, &mut page)?;
        page[0] = SlotKind::Empty.tag();
        program_bytes(&self.region, info.offset.0, &page)?;
        debug!(offset = %info.offset, name, "slot deleted");
        Ok(())
    }

    // ── Catalog queries ─────────────────────────────────────────────

    /// First occupied slot with an exact name match.
    pub fn find_by_name(&self, name: &str) -> Result<SlotInfo> {
        let mut walker = self.walker(RegionOffset::ZERO)?;
        while let Some(entry) = walker.next_slot()? {
            if !entry.header.kind.is_free() && entry.header.name == name {
                return Ok(SlotInfo::from_entry(&entry));
            }
        }
        Err(FlashError::NotFound(name.to_owned()))
    }

    /// N-th occupied slot in chain order. `Empty` slots are holes, not
    /// catalog entries, and do not count.
    pub fn find_by_index(&self, index: usize) -> Result<SlotInfo> {
        let mut walker = self.walker(RegionOffset::ZERO)?;
        let mut seen = 0_usize;
        while let Some(entry) = walker.next_slot()? {
            if entry.header.kind.is_free() {
                continue;
            }
            if seen == index {
                return Ok(SlotInfo::from_entry(&entry));
            }
            seen += 1;
        }
        Err(FlashError::NotFound(format!("slot index {index}")))
    }

    /// Every committed slot in chain order, `Empty` ones included (the
    /// listing surface reports reclaimable space).
    pub fn list_all(&self) -> Result<Vec<SlotInfo>> {
        let mut walker = self.walker(RegionOffset::ZERO)?;
        let mut out = Vec::new();
        while let Some(entry) = walker.next_slot()? {
            out.push(SlotInfo::from_entry(&entry));
        }
        Ok(out)
    }

    /// Reclaimable plus virgin bytes: all `Empty` extents and the
    /// terminal `Unwritten` tail.
    pub fn free_bytes_total(&self) -> Result<u32> {
        let mut walker = self.walker(RegionOffset::ZERO)?;
        let mut empties = 0_u32;
        while let Some(entry) = walker.next_slot()? {
            if entry.header.kind == SlotKind::Empty {
                empties += entry.header.size;
            }
        }
        let terminal = walker.terminal_offset().map_or(self.region_len, |o| o.0);
        Ok(empties + (self.region_len - terminal))
    }

    /// Read a named slot's full payload capacity (committed payload
    /// plus the 0xFF page padding after it).
    pub fn read_payload(&self, name: &str) -> Result<Vec<u8>> {
        let info = self.find_by_name(name)?;
        let mut payload = vec![0_u8; info.payload_capacity() as usize];
        self.region
            .read_exact_at(info.offset.0 + SLOT_HEADER_SIZE, &mut payload)?;
        Ok(payload)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn slot_size_for(&self, payload_len: u32) -> Result<u32> {
        SLOT_HEADER_SIZE
            .checked_add(payload_len)
            .and_then(align_up_page)
            .filter(|total| *total <= self.region_len)
            .ok_or(FlashError::BoundsExceeded {
                offset: 0,
                len: payload_len,
                region_len: self.region_len,
            })
    }

    fn extent_is_virgin(&self, start: u32, end: u32) -> Result<bool> {
        let mut bytes = vec![0_u8; (end - start) as usize];
        self.region.read_exact_at(start, &mut bytes)?;
        Ok(bytes.iter().all(|b| *b == 0xFF))
    }

    fn survey(&self, dest: u32) -> Result<Survey> {
        let mut walker = self.walker(RegionOffset::ZERO)?;
        let mut prev = None;
        let mut run_occupied = 0_u32;
        let mut run_cursor = dest;
        while let Some(entry) = walker.next_slot()? {
            if entry.successor() == dest {
                prev = Some(entry.clone());
            }
            if entry.offset.0 == run_cursor && entry.header.kind == SlotKind::Empty {
                run_occupied += entry.header.size;
                run_cursor = entry.end_offset();
            }
        }
        let terminal = walker.terminal_offset().map_or(self.region_len, |o| o.0);
        Ok(Survey {
            prev,
            run_occupied,
            continuation: dest + run_occupied,
            terminal,
        })
    }

    /// Program `prev`'s `next` field (erased sentinel) to `dest` by
    /// rewriting its header page.
    fn link_next(&self, prev_offset: u32, dest: u32) -> Result<()> {
        let mut page = vec![0_u8; PAGE_SIZE as usize];
        self.region.read_exact_at(prev_offset, &mut page)?;
        page[36..40].copy_from_slice(&dest.to_le_bytes());
        program_bytes(&self.region, prev_offset, &page)?;
        trace!(prev = prev_offset, dest, "chain link programmed");
        Ok(())
    }

    /// After a failed header-page verify on the reuse path the slot is
    /// already reachable, so re-mark it `Empty` to keep the chain
    /// walkable. Best effort: a second failure is logged, not
    /// surfaced over the original error.
    fn remark_empty_best_effort(&self, dest: u32) {
        let attempt = (|| -> Result<()> {
            let mut page = vec![0_u8; PAGE_SIZE as usize];
            self.region.read_exact_at(dest, &mut page)?;
            page[0] = SlotKind::Empty.tag();
            program_bytes(&self.region, dest, &page)
        })();
        if let Err(err) = attempt {
            warn!(offset = dest, %err, "could not re-mark failed slot as empty");
        }
    }
}
