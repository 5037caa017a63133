#![forbid(unsafe_code)]
//! End-to-end slot-chain scenarios against the in-memory region.

use ffl_core::{AllocStrategy, Filer, SlotInfo};
use ffl_error::{FlashError, Result};
use ffl_region::{FlashRegion, MemFlashRegion};
use ffl_types::{RegionOffset, SlotKind};
use parking_lot::Mutex;

const MIB: u32 = 1024 * 1024;

fn filer(len: u32) -> Filer<MemFlashRegion> {
    Filer::new(MemFlashRegion::new(len)).expect("filer")
}

/// Walk the whole chain and assert the tiling invariant: slot extents
/// are gapless, non-overlapping, and together with the virgin tail
/// account for every region byte.
fn assert_chain_tiles<R: FlashRegion>(filer: &Filer<R>) {
    let mut walker = filer.walker(RegionOffset::ZERO).expect("walker");
    let mut cursor = 0_u32;
    let mut total = 0_u32;
    while let Some(entry) = walker.next_slot().expect("walk") {
        assert_eq!(
            entry.offset.0, cursor,
            "slot at {} leaves a gap or overlap (expected {})",
            entry.offset, cursor
        );
        cursor = entry.end_offset();
        total += entry.header.size;
    }
    let terminal = walker.terminal_offset().expect("terminal").0;
    assert_eq!(terminal, cursor, "terminal must sit at the last slot's end");
    assert_eq!(
        total + (filer.region_len() - terminal),
        filer.region_len(),
        "slot sizes plus the virgin tail must equal the region size"
    );
}

#[test]
fn first_fit_reuse_splits_a_reclaimed_hole() {
    let filer = filer(MIB);

    // "ROMA": 5120-byte payload lands at 0, size rounds to 5376.
    let roma = filer
        .commit(SlotKind::Rom, "ROMA", &vec![0xA5; 5120], AllocStrategy::LastFree)
        .expect("commit ROMA");
    assert_eq!(roma, RegionOffset::ZERO);
    assert_eq!(filer.find_by_name("ROMA").expect("ROMA").size, 5376);

    // "ROMB": 10240-byte payload, last-free strategy → offset 5376.
    let romb = filer
        .commit(SlotKind::Rom, "ROMB", &vec![0xB6; 10240], AllocStrategy::LastFree)
        .expect("commit ROMB");
    assert_eq!(romb, RegionOffset(5376));

    // Delete "ROMA", then commit "ROMC" (4000 bytes) first-fit from 0:
    // the 5376-byte hole satisfies 4000 + 40 and is reused.
    filer.delete("ROMA").expect("delete ROMA");
    let romc = filer
        .commit(SlotKind::Rom, "ROMC", &vec![0xC7; 4000], AllocStrategy::FirstFit)
        .expect("commit ROMC");
    assert_eq!(romc, RegionOffset::ZERO);
    assert_eq!(filer.find_by_name("ROMC").expect("ROMC").size, 4096);

    // The 1280 bytes left over from the hole stay chained as a
    // residual empty slot, keeping the region gapless.
    let slots = filer.list_all().expect("list");
    let residual = slots
        .iter()
        .find(|slot| slot.offset == RegionOffset(4096))
        .expect("residual slot");
    assert_eq!(residual.kind, SlotKind::Empty);
    assert_eq!(residual.size, 1280);

    assert_chain_tiles(&filer);
    assert!(filer.find_by_name("ROMB").is_ok());
}

#[test]
fn chain_tiles_across_arbitrary_commit_delete_sequences() {
    let filer = filer(256 * 1024);
    let ops: &[(&str, usize, AllocStrategy, bool)] = &[
        ("R0", 1000, AllocStrategy::LastFree, false),
        ("R1", 5000, AllocStrategy::LastFree, false),
        ("R2", 300, AllocStrategy::LastFree, false),
        ("R0", 0, AllocStrategy::LastFree, true),
        ("R3", 700, AllocStrategy::FirstFit, false),
        ("R1", 0, AllocStrategy::LastFree, true),
        ("R4", 4200, AllocStrategy::FirstFit, false),
        ("R5", 12000, AllocStrategy::LastFree, false),
        ("R2", 0, AllocStrategy::LastFree, true),
        ("R6", 100, AllocStrategy::FirstFit, false),
    ];
    for (name, payload_len, strategy, is_delete) in ops {
        if *is_delete {
            filer.delete(name).expect("delete");
        } else {
            let payload = vec![0x5A_u8; *payload_len];
            filer.commit(SlotKind::Rom, name, &payload, *strategy).expect("commit");
        }
        assert_chain_tiles(&filer);
    }
}

#[test]
fn committed_payload_round_trips_by_name() {
    let filer = filer(MIB);
    let payload: Vec<u8> = (0..3000_u32).map(|i| u8::try_from(i % 256).expect("byte")).collect();
    filer
        .commit(SlotKind::WritableRom, "IMG", &payload, AllocStrategy::LastFree)
        .expect("commit");

    let read_back = filer.read_payload("IMG").expect("read");
    assert_eq!(&read_back[..payload.len()], payload.as_slice());
    // Page padding beyond the payload is untouched erased flash.
    assert!(read_back[payload.len()..].iter().all(|b| *b == 0xFF));
}

#[test]
fn last_free_commits_never_move_backward() {
    let filer = filer(MIB);
    let mut previous_tail = 0_u32;
    for round in 0..8_u32 {
        let tail = filer.find_last_free(RegionOffset::ZERO).expect("last free").0;
        assert!(tail >= previous_tail, "virgin space went backward");
        let name = format!("SLOT{round}");
        let offset = filer
            .commit(SlotKind::Rom, &name, &vec![1; 600], AllocStrategy::LastFree)
            .expect("commit");
        assert_eq!(offset.0, tail);
        previous_tail = tail;

        // Deleting an earlier slot must not pull last-free allocations
        // back into the reclaimed hole.
        if round == 3 {
            filer.delete("SLOT1").expect("delete");
        }
    }
}

#[test]
fn reusing_a_hole_erases_it_and_preserves_the_neighbours() {
    let filer = filer(MIB);
    let left: Vec<u8> = vec![0x11; 3000];
    let right: Vec<u8> = vec![0x22; 3000];
    filer.commit(SlotKind::Rom, "LEFT", &left, AllocStrategy::LastFree).expect("commit");
    filer.commit(SlotKind::Rom, "MID", &[0x99; 5000], AllocStrategy::LastFree).expect("commit");
    filer.commit(SlotKind::Rom, "RIGHT", &right, AllocStrategy::LastFree).expect("commit");

    filer.delete("MID").expect("delete");
    // The replacement needs an erase: the hole still holds old 0x99
    // bytes, and 0x99 → arbitrary new data is not bit-clear-reachable.
    filer
        .commit(SlotKind::Rom, "NEW", &[0x66; 5000], AllocStrategy::FirstFit)
        .expect("commit into hole");

    // Neighbours sharing erase blocks with the hole survive intact.
    let left_back = filer.read_payload("LEFT").expect("left");
    assert_eq!(&left_back[..left.len()], left.as_slice());
    let right_back = filer.read_payload("RIGHT").expect("right");
    assert_eq!(&right_back[..right.len()], right.as_slice());
    let new_back = filer.read_payload("NEW").expect("new");
    assert!(new_back[..5000].iter().all(|b| *b == 0x66));
    assert_chain_tiles(&filer);
}

#[test]
fn exhausting_the_region_yields_not_found() {
    let filer = filer(16 * 4096);
    let payload = vec![0_u8; 6 * 4096];
    filer.commit(SlotKind::Rom, "A", &payload, AllocStrategy::LastFree).expect("commit A");
    filer.commit(SlotKind::Rom, "B", &payload, AllocStrategy::LastFree).expect("commit B");
    let err = filer
        .commit(SlotKind::Rom, "C", &payload, AllocStrategy::LastFree)
        .expect_err("full");
    assert!(err.is_not_found());
    // The failed commit left no trace.
    assert_eq!(filer.list_all().expect("list").len(), 2);
    assert_chain_tiles(&filer);
}

// ── Fault injection ─────────────────────────────────────────────────

/// Region wrapper that silently drops program operations once armed,
/// simulating a part whose programming fails without reporting.
struct FaultyRegion {
    inner: MemFlashRegion,
    drop_programs_after: Mutex<Option<u32>>,
}

impl FaultyRegion {
    fn new(len: u32) -> Self {
        Self {
            inner: MemFlashRegion::new(len),
            drop_programs_after: Mutex::new(None),
        }
    }

    fn arm(&self, programs_to_allow: u32) {
        *self.drop_programs_after.lock() = Some(programs_to_allow);
    }
}

impl FlashRegion for FaultyRegion {
    fn len_bytes(&self) -> u32 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn program_raw(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut armed = self.drop_programs_after.lock();
        if let Some(remaining) = armed.as_mut() {
            if *remaining == 0 {
                // Swallow the program: bits stay as they were.
                return Ok(());
            }
            *remaining -= 1;
        }
        drop(armed);
        self.inner.program_raw(offset, bytes)
    }

    fn erase_raw(&self, offset: u32, len: u32) -> Result<()> {
        self.inner.erase_raw(offset, len)
    }
}

#[test]
fn verify_failure_on_append_leaves_the_slot_orphaned() {
    let region = FaultyRegion::new(MIB);
    let filer = Filer::new(region).expect("filer");
    filer.commit(SlotKind::Rom, "GOOD", &[7; 500], AllocStrategy::LastFree).expect("commit");

    // Every program from here on silently fails; the new slot's bytes
    // never reach the media, so read-back verification must fail.
    filer.region().arm(0);
    let err = filer
        .commit(SlotKind::Rom, "LOST", &[8; 500], AllocStrategy::LastFree)
        .expect_err("verify must fail");
    assert!(matches!(err, FlashError::VerifyFailed { .. }));

    // The predecessor link was never programmed: the chain still ends
    // after GOOD and the failed slot is unreachable.
    filer.region().arm(u32::MAX);
    let slots: Vec<SlotInfo> = filer.list_all().expect("list");
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].name, "GOOD");
    assert_chain_tiles(&filer);
}

#[test]
fn interrupted_append_before_the_link_is_invisible() {
    // Simulate power loss between the slot programs and the commit
    // link: allow the header+payload program, drop the link program.
    let region = FaultyRegion::new(MIB);
    let filer = Filer::new(region).expect("filer");
    filer.commit(SlotKind::Rom, "GOOD", &[7; 500], AllocStrategy::LastFree).expect("commit");

    filer.region().arm(1);
    let result = filer.commit(SlotKind::Rom, "HALF", &[8; 500], AllocStrategy::LastFree);
    // The dropped link program fails its own verification.
    assert!(matches!(result, Err(FlashError::VerifyFailed { .. })));

    filer.region().arm(u32::MAX);
    let names: Vec<String> = filer
        .list_all()
        .expect("list")
        .into_iter()
        .map(|slot| slot.name)
        .collect();
    assert_eq!(names, ["GOOD"]);
    assert_chain_tiles(&filer);

    // The orphaned bytes sit in the virgin tail's former space; a
    // fresh commit reclaims them with an erase and succeeds.
    filer
        .commit(SlotKind::Rom, "RETRY", &[9; 500], AllocStrategy::LastFree)
        .expect("retry commit");
    assert_eq!(filer.read_payload("RETRY").expect("read")[..500], [9; 500]);
    assert_chain_tiles(&filer);
}

#[test]
fn delete_is_a_pure_bit_clear_even_on_every_kind() {
    let filer = filer(MIB);
    let kinds = [
        SlotKind::Mod1,
        SlotKind::Mod2,
        SlotKind::Rom,
        SlotKind::WritableRom,
        SlotKind::UserMemoryImage,
        SlotKind::ModuleMap,
        SlotKind::GlobalSettings,
        SlotKind::TracerSettings,
    ];
    for (index, kind) in kinds.iter().enumerate() {
        let name = format!("K{index}");
        filer.commit(*kind, &name, &[1; 64], AllocStrategy::LastFree).expect("commit");
    }
    for index in 0..kinds.len() {
        filer.delete(&format!("K{index}")).expect("delete");
    }
    assert_eq!(filer.list_all().expect("list").iter().filter(|s| s.kind == SlotKind::Empty).count(), kinds.len());
    assert_eq!(filer.free_bytes_total().expect("free"), MIB);
    assert_chain_tiles(&filer);
}

#[test]
fn free_bytes_totals_empties_and_the_virgin_tail() {
    let filer = filer(MIB);
    filer.commit(SlotKind::Rom, "A", &[0; 1000], AllocStrategy::LastFree).expect("commit");
    filer.commit(SlotKind::Rom, "B", &[0; 2000], AllocStrategy::LastFree).expect("commit");
    // A: align(1040) = 1280; B: align(2040) = 2048.
    assert_eq!(filer.free_bytes_total().expect("free"), MIB - 1280 - 2048);
    filer.delete("A").expect("delete");
    assert_eq!(filer.free_bytes_total().expect("free"), MIB - 2048);
}
