//! The two-level page-table walk.
//!
//! The walk is pure: it reads the tables and either yields the translated
//! real address together with the lower-PTE slot that maps it, or reports
//! which condition stops translation. The engine owns the fault handling
//! and the referenced/dirty updates, and retries the walk after a fault.

use crate::addr::{lower_index, page_offset, upper_index, RealAddr, SimAddr};
use crate::arena::RealMemory;
use crate::pte::PTE_SIZE;

/// A successful translation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hit {
    /// The translated real address.
    pub real: RealAddr,
    /// Real address of the lower PTE that maps the page.
    pub pte_slot: RealAddr,
}

/// Why a translation cannot proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Miss {
    /// The upper entry is zero: no lower table exists.
    NoLowerTable,
    /// The lower entry is zero: the page has never been mapped.
    Unmapped,
    /// The lower entry encodes a backing-store block.
    NotResident,
}

pub(crate) fn walk(real: &RealMemory, upper_pt: RealAddr, sim: SimAddr) -> Result<Hit, Miss> {
    let upper_slot = upper_pt + upper_index(sim) * PTE_SIZE;
    let upper = real.load_pte(upper_slot);
    if upper.is_null() {
        return Err(Miss::NoLowerTable);
    }

    let lower_slot = upper.table_base() + lower_index(sim) * PTE_SIZE;
    let lower = real.load_pte(lower_slot);
    if lower.is_null() {
        return Err(Miss::Unmapped);
    }
    if !lower.is_resident() {
        return Err(Miss::NotResident);
    }

    Ok(Hit {
        real: lower.frame() | page_offset(sim),
        pte_slot: lower_slot,
    })
}
