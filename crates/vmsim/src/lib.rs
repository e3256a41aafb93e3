//! # vmsim
//!
//! A two-level demand-paged virtual memory simulator. Clients see a 32-bit
//! simulated address space; the engine translates simulated addresses into
//! offsets within a memory-mapped "real" arena, materializing pages on
//! first touch, evicting them under memory pressure with a CLOCK sweep,
//! and restoring them from a page-sized backing store on later faults.
//!
//! ## Modules
//!
//! - `addr`: simulated/real address arithmetic and page constants.
//! - `pte`: the tagged page-table entry word.
//! - `arena`: the real-memory arena and its bump allocators.
//! - `backing`: the persistent block store.
//! - `clock`: the frame-owner index and CLOCK replacement.
//! - `mmu`: the two-level table walk.
//! - `engine`: faults, swapping, and the client-facing operations.
//! - `config`: sizing from the environment.

pub mod addr;
pub mod arena;
pub mod backing;
pub mod clock;
pub mod config;
pub mod engine;
mod mmu;
pub mod pte;

pub use addr::{RealAddr, SimAddr, PAGESIZE};
pub use arena::PT_AREA_SIZE;
pub use config::{Config, ConfigError, DEFAULT_REAL_MEMORY_SIZE, REAL_MEM_SIZE_ENV};
pub use engine::{Stats, VmError, VmSim};
pub use pte::{BlockNo, Pte};
