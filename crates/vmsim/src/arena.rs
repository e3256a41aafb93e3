//! The real-memory arena and its two sub-allocators.
//!
//! Real memory is a single anonymous memory-mapped buffer. Real addresses
//! are byte offsets into it. The buffer is split into three regions:
//!
//! - `[0, PAGESIZE)` is never handed out, so real address 0 stays invalid;
//! - `[PAGESIZE, PT_AREA_SIZE)` is the page-table region, bump-allocated
//!   one page at a time and never reclaimed;
//! - `[PT_AREA_SIZE, size)` is the frame region backing simulated pages.
//!
//! The frame bump reports exhaustion instead of failing; the engine then
//! frees a frame by eviction. The page-table bump has no such escape hatch:
//! running out of table space is fatal.

use std::fs::File;
use std::io;

use memmap2::MmapMut;
use rustix::cstr;
use rustix::fs::{self, MemfdFlags};
use thiserror::Error;

use crate::addr::{is_page_aligned, RealAddr, PAGESIZE};
use crate::pte::{Pte, PTE_SIZE};

/// Size of the page-table region: room for the upper table and every lower
/// table the 32-bit simulated space can demand.
pub const PT_AREA_SIZE: u32 = (4 << 20) + (4 << 10);

/// Error type for mapping the arena.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("failed to create memfd for real memory: {0}")]
    MemfdFailed(io::Error),
    #[error("failed to size real memory: {0}")]
    FtruncateFailed(io::Error),
    #[error("failed to map real memory: {0}")]
    MmapFailed(io::Error),
}

/// The real-memory arena.
#[derive(Debug)]
pub struct RealMemory {
    map: MmapMut,
    /// Keeps the backing memfd open for the life of the mapping.
    #[allow(dead_code)]
    fd: File,
    size: u32,
    /// Next free page in the page-table region.
    pt_free: RealAddr,
    /// Next never-used page in the frame region.
    frame_free: RealAddr,
}

impl RealMemory {
    /// Map `size` bytes of zeroed anonymous memory.
    pub fn map(size: u32) -> Result<Self, ArenaError> {
        debug_assert!(size >= PT_AREA_SIZE + PAGESIZE);
        let fd = fs::memfd_create(cstr!("vmsim-real"), MemfdFlags::CLOEXEC)
            .map_err(|err| ArenaError::MemfdFailed(err.into()))?;
        fs::ftruncate(&fd, size as u64).map_err(|err| ArenaError::FtruncateFailed(err.into()))?;
        let file = File::from(fd);
        let map = unsafe { MmapMut::map_mut(&file).map_err(ArenaError::MmapFailed)? };
        Ok(Self {
            map,
            fd: file,
            size,
            pt_free: PAGESIZE,
            frame_free: PT_AREA_SIZE,
        })
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of whole frames in the frame region.
    #[inline]
    pub fn frame_count(&self) -> usize {
        ((self.size - PT_AREA_SIZE) / PAGESIZE) as usize
    }

    /// Next free page-table page; exposed for inspection only.
    #[inline]
    pub fn pt_free(&self) -> RealAddr {
        self.pt_free
    }

    fn checked_range(&self, at: RealAddr, len: usize) -> std::ops::Range<usize> {
        let end = at as u64 + len as u64;
        assert!(
            end <= self.size as u64,
            "real access [{at:#x}, {end:#x}) exceeds the arena size {:#x}",
            self.size
        );
        at as usize..end as usize
    }

    /// Copy bytes out of the arena. Out-of-bounds is fatal.
    pub fn read(&self, at: RealAddr, buf: &mut [u8]) {
        let range = self.checked_range(at, buf.len());
        buf.copy_from_slice(&self.map[range]);
    }

    /// Copy bytes into the arena. Out-of-bounds is fatal.
    pub fn write(&mut self, at: RealAddr, buf: &[u8]) {
        let range = self.checked_range(at, buf.len());
        self.map[range].copy_from_slice(buf);
    }

    /// Load the PTE word stored at `slot`.
    pub fn load_pte(&self, slot: RealAddr) -> Pte {
        let range = self.checked_range(slot, PTE_SIZE as usize);
        let word = self.map[range]
            .try_into()
            .expect("checked_range returned a 4-byte slice");
        Pte::from_raw(u32::from_ne_bytes(word))
    }

    /// Store a PTE word at `slot`.
    pub fn store_pte(&mut self, slot: RealAddr, pte: Pte) {
        let range = self.checked_range(slot, PTE_SIZE as usize);
        self.map[range].copy_from_slice(&pte.raw().to_ne_bytes());
    }

    /// The page starting at `base`, read-only.
    pub fn page(&self, base: RealAddr) -> &[u8] {
        debug_assert!(is_page_aligned(base));
        let range = self.checked_range(base, PAGESIZE as usize);
        &self.map[range]
    }

    /// The page starting at `base`, writable.
    pub fn page_mut(&mut self, base: RealAddr) -> &mut [u8] {
        debug_assert!(is_page_aligned(base));
        let range = self.checked_range(base, PAGESIZE as usize);
        &mut self.map[range]
    }

    pub fn zero_page(&mut self, base: RealAddr) {
        self.page_mut(base).fill(0);
    }

    /// Hand out a zeroed, page-aligned block for a page table. Exhausting
    /// the page-table region is fatal.
    pub fn alloc_page_table(&mut self) -> RealAddr {
        let table = self.pt_free;
        assert!(
            table + PAGESIZE <= PT_AREA_SIZE,
            "page-table region exhausted at {table:#x}"
        );
        debug_assert!(is_page_aligned(table));
        self.pt_free += PAGESIZE;
        self.zero_page(table);
        table
    }

    /// Hand out a zeroed, never-used frame, or report that the frame
    /// region is full.
    pub fn bump_frame(&mut self) -> Option<RealAddr> {
        if self.frame_free as u64 + PAGESIZE as u64 > self.size as u64 {
            return None;
        }
        let frame = self.frame_free;
        debug_assert!(is_page_aligned(frame));
        self.frame_free += PAGESIZE;
        self.zero_page(frame);
        Some(frame)
    }
}
