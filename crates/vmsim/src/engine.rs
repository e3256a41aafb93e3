//! The paging engine.
//!
//! One owning [`VmSim`] value bundles the real-memory arena, the backing
//! store, the frame-owner clock, the upper-table base, the simulated-heap
//! bump pointer, and the block counter. Every operation goes through it.
//!
//! The fault path mirrors the translation conditions one to one: a zero
//! upper entry grows a lower table, a zero lower entry maps a fresh frame,
//! and a non-resident lower entry swaps the page back in at the expense of
//! a CLOCK victim. Construction failures are typed errors; everything that
//! can go wrong after construction is an invariant breach and aborts.

use thiserror::Error;
use tracing::{debug, trace};

use crate::addr::{lower_index, page_offset, upper_index, RealAddr, SimAddr, PAGESIZE};
use crate::arena::{ArenaError, RealMemory};
use crate::backing::{BackingStore, StoreError};
use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::mmu;
use crate::pte::{BlockNo, Pte, MAX_BLOCK_NO, PTE_SIZE};

/// Error type for bringing the engine up.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create real-memory arena: {0}")]
    Arena(#[from] ArenaError),
    #[error("failed to create backing store: {0}")]
    Store(#[from] StoreError),
}

/// Running totals over the engine's lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Translation failures that entered the fault handler.
    pub faults: u64,
    /// Lower page tables allocated.
    pub lower_tables: u64,
    /// Frames handed out from the never-used part of the frame region.
    pub frames_bumped: u64,
    /// Pages written out to the backing store.
    pub evictions: u64,
    /// Pages read back from the backing store.
    pub fetches: u64,
}

/// The demand-paged virtual memory engine.
#[derive(Debug)]
pub struct VmSim {
    real: RealMemory,
    store: BackingStore,
    clock: Clock,
    upper_pt: RealAddr,
    /// Next free simulated address for `alloc`.
    sim_free: SimAddr,
    /// Next backing-store block to consume. Monotonic; block 0 reserved.
    next_block: BlockNo,
    stats: Stats,
}

impl VmSim {
    /// Bring up an engine: map the arena, open the store, allocate the
    /// upper table, size the frame-owner index.
    pub fn new(config: Config) -> Result<Self, VmError> {
        let mut real = RealMemory::map(config.real_size)?;
        let store = match &config.store_path {
            Some(path) => BackingStore::open(path)?,
            None => BackingStore::new_anonymous()?,
        };
        let upper_pt = real.alloc_page_table();
        let clock = Clock::new(real.frame_count());
        debug!(
            real_size = config.real_size,
            frames = real.frame_count(),
            "engine up"
        );
        Ok(Self {
            real,
            store,
            clock,
            upper_pt,
            // Leave simulated page 0 unused, start at page 1.
            sim_free: PAGESIZE,
            next_block: 1,
            stats: Stats::default(),
        })
    }

    /// An engine configured from the environment.
    pub fn from_env() -> Result<Self, VmError> {
        Self::new(Config::from_env()?)
    }

    /// Real address of the upper page table.
    #[inline]
    pub fn upper_table(&self) -> RealAddr {
        self.upper_pt
    }

    #[inline]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Bump-allocate `size` bytes of simulated space. No reclamation.
    pub fn alloc(&mut self, size: u32) -> SimAddr {
        let addr = self.sim_free;
        self.sim_free = self
            .sim_free
            .checked_add(size)
            .unwrap_or_else(|| panic!("simulated address space exhausted at {addr:#010x}"));
        addr
    }

    /// Release a simulated allocation. Nothing to do.
    pub fn free(&mut self, _addr: SimAddr) {}

    /// Translate a simulated address, faulting until the walk succeeds,
    /// and mark the page referenced (and dirty on a write access).
    pub fn map(&mut self, sim: SimAddr, write: bool) -> RealAddr {
        loop {
            match mmu::walk(&self.real, self.upper_pt, sim) {
                Ok(hit) => {
                    let mut pte = self.real.load_pte(hit.pte_slot);
                    pte.set_referenced();
                    if write {
                        pte.set_dirty();
                    }
                    self.real.store_pte(hit.pte_slot, pte);
                    return hit.real;
                }
                Err(miss) => {
                    trace!(sim = format_args!("{sim:#010x}"), ?miss, "translation fault");
                    self.handle_fault(sim);
                }
            }
        }
    }

    /// Copy simulated memory into `buf`. The access must not cross a page
    /// boundary; callers split larger transfers.
    pub fn read(&mut self, sim: SimAddr, buf: &mut [u8]) {
        self.check_single_page(sim, buf.len());
        let real = self.map(sim, false);
        self.real.read(real, buf);
    }

    /// Copy `buf` into simulated memory. Same page-boundary constraint as
    /// [`Self::read`].
    pub fn write(&mut self, sim: SimAddr, buf: &[u8]) {
        self.check_single_page(sim, buf.len());
        let real = self.map(sim, true);
        self.real.write(real, buf);
    }

    fn check_single_page(&self, sim: SimAddr, len: usize) {
        assert!(
            page_offset(sim) as usize + len <= PAGESIZE as usize,
            "access of {len} bytes at {sim:#010x} crosses a page boundary"
        );
    }

    /// Satisfy the access at `sim`: grow the tables, map a frame, or swap
    /// the page back in.
    fn handle_fault(&mut self, sim: SimAddr) {
        self.stats.faults += 1;

        let upper_slot = self.upper_pt + upper_index(sim) * PTE_SIZE;
        let mut upper = self.real.load_pte(upper_slot);
        if upper.is_null() {
            let table = self.real.alloc_page_table();
            upper = Pte::table(table);
            self.real.store_pte(upper_slot, upper);
            self.stats.lower_tables += 1;
            debug!(
                sim = format_args!("{sim:#010x}"),
                table = format_args!("{table:#010x}"),
                "allocated lower page table"
            );
        }

        let lower_slot = upper.table_base() + lower_index(sim) * PTE_SIZE;
        let lower = self.real.load_pte(lower_slot);
        if lower.is_null() {
            let frame = self.allocate_frame();
            self.real.store_pte(lower_slot, Pte::map_frame(frame));
            self.clock.record_owner(frame, lower_slot);
            debug!(
                sim = format_args!("{sim:#010x}"),
                frame = format_args!("{frame:#010x}"),
                "mapped fresh frame"
            );
        } else if !lower.is_resident() {
            let victim = self.clock.select_victim(&mut self.real);
            self.swap(lower_slot, victim);
        }
    }

    /// A usable frame: from the never-used pool while it lasts, then by
    /// evicting a CLOCK victim. Returned frames are zeroed and ownerless;
    /// the caller installs the new owner.
    fn allocate_frame(&mut self) -> RealAddr {
        if let Some(frame) = self.real.bump_frame() {
            self.stats.frames_bumped += 1;
            return frame;
        }
        let victim = self.clock.select_victim(&mut self.real);
        self.evict(victim)
    }

    /// Write the frame owned by the PTE at `victim_slot` out to a fresh
    /// block, re-encode the PTE, zero the frame, and return it. The owner
    /// index still names the old owner; the caller overwrites it.
    fn evict(&mut self, victim_slot: RealAddr) -> RealAddr {
        let pte = self.real.load_pte(victim_slot);
        let frame = pte.frame();
        let block = self.fresh_block();
        self.store.write_block(block, self.real.page(frame));
        self.real.store_pte(victim_slot, pte.evicted_to(block));
        self.real.zero_page(frame);
        self.stats.evictions += 1;
        debug!(
            block,
            frame = format_args!("{frame:#010x}"),
            "evicted page to backing store"
        );
        frame
    }

    /// Read the block encoded by the PTE at `dest_slot` into `frame`,
    /// re-encode the PTE, and install the new owner.
    fn fetch(&mut self, dest_slot: RealAddr, frame: RealAddr) {
        let pte = self.real.load_pte(dest_slot);
        let block = pte.block();
        self.store.read_block(block, self.real.page_mut(frame));
        self.real.store_pte(dest_slot, pte.fetched_into(frame));
        self.clock.record_owner(frame, dest_slot);
        self.stats.fetches += 1;
        debug!(
            block,
            frame = format_args!("{frame:#010x}"),
            "fetched page from backing store"
        );
    }

    /// Evict the victim, then fetch the page named by `in_slot` into the
    /// freed frame.
    fn swap(&mut self, in_slot: RealAddr, victim_slot: RealAddr) {
        let frame = self.evict(victim_slot);
        self.fetch(in_slot, frame);
    }

    fn fresh_block(&mut self) -> BlockNo {
        let block = self.next_block;
        assert!(
            block <= MAX_BLOCK_NO,
            "backing-store block numbers exhausted"
        );
        self.next_block += 1;
        block
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use proptest::prelude::*;

    use super::*;
    use crate::addr::page_base;
    use crate::arena::PT_AREA_SIZE;

    fn make_test_sim(frames: u32) -> VmSim {
        let config = Config::with_real_size(PT_AREA_SIZE + frames * PAGESIZE)
            .expect("test arena size is above the minimum");
        VmSim::new(config).expect("failed to create test sim")
    }

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGESIZE as usize]
    }

    fn write_page(vm: &mut VmSim, sim: SimAddr, byte: u8) {
        vm.write(sim, &page_of(byte));
    }

    fn read_page(vm: &mut VmSim, sim: SimAddr) -> Vec<u8> {
        let mut buf = vec![0u8; PAGESIZE as usize];
        vm.read(sim, &mut buf);
        buf
    }

    /// Real address of the lower PTE mapping `sim`. The lower table must
    /// already exist.
    fn lower_slot_of(vm: &VmSim, sim: SimAddr) -> RealAddr {
        let upper = vm.real.load_pte(vm.upper_pt + upper_index(sim) * PTE_SIZE);
        upper.table_base() + lower_index(sim) * PTE_SIZE
    }

    fn owned_frames(vm: &VmSim) -> usize {
        vm.clock.owner_slots().iter().filter(|&&s| s != 0).count()
    }

    /// Every owned frame's PTE must be resident and point back at the
    /// frame the owner index says it owns.
    fn check_owner_index(vm: &VmSim) {
        for (no, &slot) in vm.clock.owner_slots().iter().enumerate() {
            if slot == 0 {
                continue;
            }
            let pte = vm.real.load_pte(slot);
            assert!(pte.is_resident(), "owned frame {no} has a non-resident PTE");
            assert_eq!(pte.frame(), Clock::frame_addr(no));
        }
    }

    /// Table bases must stay in the page-table region and frames in the
    /// frame region.
    fn check_layout(vm: &VmSim) {
        for upper_no in 0..1024u32 {
            let upper = vm.real.load_pte(vm.upper_pt + upper_no * PTE_SIZE);
            if upper.is_null() {
                continue;
            }
            let table = upper.table_base();
            assert!((PAGESIZE..PT_AREA_SIZE).contains(&table));
            for lower_no in 0..1024u32 {
                let pte = vm.real.load_pte(table + lower_no * PTE_SIZE);
                if pte.is_resident() {
                    assert!((PT_AREA_SIZE..vm.real.size()).contains(&pte.frame()));
                }
            }
        }
    }

    #[test]
    fn s1_fault_in_basic() {
        let mut vm = make_test_sim(4);
        write_page(&mut vm, 0x0000_1000, b'A');
        assert_eq!(read_page(&mut vm, 0x0000_1000), page_of(b'A'));

        assert_eq!(owned_frames(&vm), 1);
        assert_eq!(vm.stats.lower_tables, 1);
        assert_eq!(vm.stats.evictions, 0);
        check_owner_index(&vm);
    }

    #[test]
    fn s2_second_lower_table() {
        let mut vm = make_test_sim(4);
        write_page(&mut vm, 0x0000_1000, b'A');
        let pt_free_before = vm.real.pt_free();

        write_page(&mut vm, 0x0040_1000, b'B');
        assert_eq!(vm.real.pt_free(), pt_free_before + PAGESIZE);
        assert_eq!(vm.stats.lower_tables, 2);
        assert_eq!(read_page(&mut vm, 0x0040_1000), page_of(b'B'));
    }

    #[test]
    fn s3_eviction_trigger() {
        let mut vm = make_test_sim(4);
        for page in 1..=4u32 {
            write_page(&mut vm, page * PAGESIZE, page as u8);
        }
        assert_eq!(vm.stats.frames_bumped, 4);

        write_page(&mut vm, 5 * PAGESIZE, 5);
        assert_eq!(vm.stats.evictions, 1);

        // All four victims were referenced, so the sweep wraps and takes
        // the frame under the starting hand position: P1.
        let p1 = vm.real.load_pte(lower_slot_of(&vm, PAGESIZE));
        assert!(!p1.is_resident());
        assert_ne!(p1.block(), 0);

        // P5 now owns P1's old frame.
        assert_eq!(
            vm.clock.owner_slots()[0],
            lower_slot_of(&vm, 5 * PAGESIZE)
        );
        assert_eq!(read_page(&mut vm, 5 * PAGESIZE), page_of(5));
        for page in 2..=4u32 {
            assert!(vm
                .real
                .load_pte(lower_slot_of(&vm, page * PAGESIZE))
                .is_resident());
        }
        check_owner_index(&vm);
    }

    #[test]
    fn s4_swap_back() {
        let mut vm = make_test_sim(4);
        for page in 1..=5u32 {
            write_page(&mut vm, page * PAGESIZE, page as u8);
        }
        // P1 is out after the fifth write.
        assert!(!vm.real.load_pte(lower_slot_of(&vm, PAGESIZE)).is_resident());

        // Reading it faults, evicts a new victim, and fetches the old
        // contents back unchanged.
        assert_eq!(read_page(&mut vm, PAGESIZE), page_of(1));
        assert_eq!(vm.stats.fetches, 1);
        assert_eq!(vm.stats.evictions, 2);

        // The sweep stepped over P5 (referenced by its write) and took
        // P2, whose referenced bit fell in the first sweep.
        assert!(!vm
            .real
            .load_pte(lower_slot_of(&vm, 2 * PAGESIZE))
            .is_resident());
        check_owner_index(&vm);
        check_layout(&vm);
    }

    #[test]
    fn s5_reference_bit_sweep() {
        let mut vm = make_test_sim(4);
        for page in 1..=4u32 {
            write_page(&mut vm, page * PAGESIZE, page as u8);
        }
        // Every resident page is referenced; the sweep clears all four
        // bits and selects the first-inspected frame on its second visit.
        write_page(&mut vm, 5 * PAGESIZE, 5);

        assert!(!vm.real.load_pte(lower_slot_of(&vm, PAGESIZE)).is_resident());
        for page in 2..=4u32 {
            let pte = vm.real.load_pte(lower_slot_of(&vm, page * PAGESIZE));
            assert!(pte.is_resident());
            assert!(!pte.is_referenced());
        }
        // The retried translation re-marked the incoming page.
        assert!(vm
            .real
            .load_pte(lower_slot_of(&vm, 5 * PAGESIZE))
            .is_referenced());
    }

    #[test]
    fn s6_free_is_a_no_op() {
        let mut vm = make_test_sim(4);
        let a = vm.alloc(PAGESIZE);
        let b = vm.alloc(PAGESIZE);
        write_page(&mut vm, a, 0x11);
        write_page(&mut vm, b, 0x22);

        vm.free(a);
        vm.free(0xdead_b000);

        assert_eq!(read_page(&mut vm, a), page_of(0x11));
        assert_eq!(read_page(&mut vm, b), page_of(0x22));
        // The heap pointer does not move backwards.
        assert_eq!(vm.alloc(16), b + PAGESIZE);
    }

    #[test]
    fn b1_one_lower_table_per_4mib_range() {
        let mut vm = make_test_sim(4);
        write_page(&mut vm, 0x0000_1000, 1);
        assert_eq!(vm.stats.lower_tables, 1);

        // A second access anywhere in the same 4 MiB range allocates no
        // further tables.
        write_page(&mut vm, 0x003f_f000, 2);
        vm.map(0x0000_2000, false);
        assert_eq!(vm.stats.lower_tables, 1);
    }

    #[test]
    fn b2_eviction_keeps_the_resident_count() {
        let mut vm = make_test_sim(4);
        for page in 1..=4u32 {
            write_page(&mut vm, page * PAGESIZE, page as u8);
        }
        assert_eq!(owned_frames(&vm), 4);

        write_page(&mut vm, 5 * PAGESIZE, 5);
        assert_eq!(owned_frames(&vm), 4);
        assert_eq!(vm.stats.evictions, 1);
        check_owner_index(&vm);
    }

    #[test]
    fn map_sets_referenced_and_dirty() {
        let mut vm = make_test_sim(4);
        vm.map(0x0000_1000, false);
        let pte = vm.real.load_pte(lower_slot_of(&vm, 0x0000_1000));
        assert!(pte.is_referenced());
        assert!(!pte.is_dirty());

        vm.map(0x0000_1000, true);
        let pte = vm.real.load_pte(lower_slot_of(&vm, 0x0000_1000));
        assert!(pte.is_dirty());
    }

    #[test]
    fn map_translates_the_offset() {
        let mut vm = make_test_sim(4);
        let real = vm.map(0x0000_1234, false);
        assert_eq!(page_offset(real), 0x234);
        assert_eq!(page_base(real), PT_AREA_SIZE);
    }

    #[test]
    fn alloc_bumps_from_the_second_page() {
        let mut vm = make_test_sim(4);
        assert_eq!(vm.alloc(100), PAGESIZE);
        assert_eq!(vm.alloc(100), PAGESIZE + 100);
    }

    #[test]
    fn fresh_pages_read_zero() {
        let mut vm = make_test_sim(4);
        assert_eq!(read_page(&mut vm, 0x0000_7000), page_of(0));
    }

    #[test]
    fn r1_contents_survive_repeated_churn() {
        let mut vm = make_test_sim(4);
        write_page(&mut vm, PAGESIZE, 0xaa);
        // Push P1 out and back in several times.
        for round in 0..3u32 {
            for page in 2..=6u32 {
                write_page(&mut vm, page * PAGESIZE, (round * 10 + page) as u8);
            }
            assert_eq!(read_page(&mut vm, PAGESIZE), page_of(0xaa));
        }
        assert!(vm.stats.fetches >= 1);
        assert!(vm.stats.evictions >= vm.stats.fetches);
    }

    #[test]
    fn r2_rereads_are_identical() {
        let mut vm = make_test_sim(4);
        write_page(&mut vm, PAGESIZE, 0x3c);
        let first = read_page(&mut vm, PAGESIZE);
        let second = read_page(&mut vm, PAGESIZE);
        assert_eq!(first, second);
    }

    #[test]
    fn i5_partial_writes_survive_interleaved_traffic() {
        let mut vm = make_test_sim(4);
        let pattern: Vec<u8> = (0..64u8).collect();
        vm.write(PAGESIZE + 16, &pattern);

        for page in 2..=7u32 {
            write_page(&mut vm, page * PAGESIZE, page as u8);
        }

        let mut back = vec![0u8; 64];
        vm.read(PAGESIZE + 16, &mut back);
        assert_eq!(back, pattern);
        // The rest of the page is still zero.
        let full = read_page(&mut vm, PAGESIZE);
        assert!(full[..16].iter().all(|&b| b == 0));
        assert!(full[16 + 64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn block_numbers_are_fresh_per_eviction() {
        let mut vm = make_test_sim(2);
        write_page(&mut vm, PAGESIZE, 1);
        write_page(&mut vm, 2 * PAGESIZE, 2);
        write_page(&mut vm, 3 * PAGESIZE, 3);
        assert_eq!(vm.stats.evictions, 1);
        assert_eq!(vm.next_block, 2);

        // Re-evicting the same page consumes a new block even though it
        // was never re-written.
        assert_eq!(read_page(&mut vm, PAGESIZE), page_of(1));
        write_page(&mut vm, 2 * PAGESIZE, 2);
        assert!(vm.next_block > 2);
    }

    #[test]
    fn page_crossing_access_is_fatal() {
        let mut vm = make_test_sim(4);
        let buf = [0u8; 32];
        let res = catch_unwind(AssertUnwindSafe(|| vm.write(2 * PAGESIZE - 16, &buf)));
        assert!(res.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Random single-page traffic over a working set three times the
        /// frame count never loses a byte.
        #[test]
        fn contents_survive_arbitrary_churn(
            ops in proptest::collection::vec((1u32..=12, any::<u8>()), 1..48)
        ) {
            let mut vm = make_test_sim(4);
            let mut expected = [None::<u8>; 13];
            for &(page, byte) in &ops {
                write_page(&mut vm, page * PAGESIZE, byte);
                expected[page as usize] = Some(byte);
            }
            for (page, byte) in expected.iter().enumerate() {
                if let Some(byte) = byte {
                    prop_assert_eq!(read_page(&mut vm, page as u32 * PAGESIZE), page_of(*byte));
                }
            }
            check_owner_index(&vm);
            check_layout(&vm);
        }
    }
}
