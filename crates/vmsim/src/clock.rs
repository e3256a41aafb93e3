//! Frame-to-PTE owner index and CLOCK victim selection.
//!
//! The index is a dense array with one slot per frame in the frame region.
//! Slot `i` holds the real address of the lower PTE that currently owns
//! frame `PT_AREA_SIZE + i * PAGESIZE`, or zero while the frame has never
//! been handed out. Eviction reassigns owners but never structurally frees
//! a frame, so once the region has filled every slot stays valid and the
//! circular scan always terminates.
//!
//! The hand is only ever consulted once the region is full; it stays on the
//! selected victim, so the frame that just received a fetched page is the
//! first one re-inspected on the next sweep.

use tracing::trace;

use crate::addr::{is_page_aligned, RealAddr, PAGESIZE};
use crate::arena::{RealMemory, PT_AREA_SIZE};

#[derive(Debug)]
pub struct Clock {
    /// Real address of the owning lower PTE, per frame. Zero means the
    /// frame has no owner yet.
    owners: Box<[RealAddr]>,
    hand: usize,
}

impl Clock {
    pub fn new(frame_count: usize) -> Self {
        Self {
            owners: vec![0; frame_count].into_boxed_slice(),
            hand: 0,
        }
    }

    /// Index of `frame` within the frame region.
    pub fn frame_no(frame: RealAddr) -> usize {
        debug_assert!(frame >= PT_AREA_SIZE && is_page_aligned(frame));
        ((frame - PT_AREA_SIZE) / PAGESIZE) as usize
    }

    /// Base real address of frame number `no`.
    pub fn frame_addr(no: usize) -> RealAddr {
        PT_AREA_SIZE + no as u32 * PAGESIZE
    }

    /// Record that the lower PTE at `pte_slot` now owns `frame`.
    pub fn record_owner(&mut self, frame: RealAddr, pte_slot: RealAddr) {
        self.owners[Self::frame_no(frame)] = pte_slot;
    }

    /// The owner slots, indexed by frame number. Zero entries are vacant.
    pub fn owner_slots(&self) -> &[RealAddr] {
        &self.owners
    }

    /// Scan from the hand, clearing referenced bits, until a PTE with the
    /// referenced bit clear turns up. Leaves the hand on the victim and
    /// returns the real address of its PTE slot.
    ///
    /// Must only run once every frame has an owner; landing on a vacant
    /// slot is an index-corruption breach.
    pub fn select_victim(&mut self, real: &mut RealMemory) -> RealAddr {
        loop {
            let slot = self.owners[self.hand];
            assert_ne!(
                slot, 0,
                "clock hand landed on frame {} with no recorded owner",
                self.hand
            );
            let mut pte = real.load_pte(slot);
            if !pte.is_referenced() {
                trace!(hand = self.hand, slot, "clock selected victim");
                return slot;
            }
            pte.clear_referenced();
            real.store_pte(slot, pte);
            trace!(hand = self.hand, slot, "clock cleared referenced bit");
            self.hand = (self.hand + 1) % self.owners.len();
        }
    }
}
