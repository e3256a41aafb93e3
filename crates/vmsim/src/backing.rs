//! The backing store: persistent page-sized blocks addressed by number.
//!
//! Blocks are opaque 4 KiB units over a file descriptor, anonymous by
//! default or created at a caller-supplied path. The engine chooses block
//! numbers; block 0 is reserved and never used. Blocks are written once
//! and never reclaimed. I/O failures are fatal: the store models the disk
//! under a kernel paging path, and a swap that cannot complete is terminal.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use rustix::cstr;
use rustix::fs::{self, MemfdFlags};
use thiserror::Error;

use crate::addr::PAGESIZE;
use crate::pte::BlockNo;

/// Error type for creating the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create anonymous backing store: {0}")]
    MemfdFailed(io::Error),
    #[error("failed to open backing store at {path}: {err}")]
    OpenFailed { path: PathBuf, err: io::Error },
}

/// A page-granular block store.
#[derive(Debug)]
pub struct BackingStore {
    file: File,
    path: PathBuf,
}

impl BackingStore {
    /// A store backed by an anonymous memfd. Blocks live only as long as
    /// the process.
    pub fn new_anonymous() -> Result<Self, StoreError> {
        let fd = fs::memfd_create(cstr!("vmsim-store"), MemfdFlags::CLOEXEC)
            .map_err(|err| StoreError::MemfdFailed(err.into()))?;
        Ok(Self {
            file: File::from(fd),
            path: PathBuf::from("<anonymous>"),
        })
    }

    /// A store backed by a file at `path`, created if absent. Existing
    /// contents are preserved.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| StoreError::OpenFailed {
                path: path.clone(),
                err,
            })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist one page as block `block`.
    pub fn write_block(&self, block: BlockNo, page: &[u8]) {
        assert_ne!(block, 0, "block 0 is reserved");
        assert_eq!(page.len(), PAGESIZE as usize);
        self.file
            .write_all_at(page, block as u64 * PAGESIZE as u64)
            .unwrap_or_else(|err| panic!("backing store write of block {block} failed: {err}"));
    }

    /// Load block `block` into one page.
    pub fn read_block(&self, block: BlockNo, page: &mut [u8]) {
        assert_ne!(block, 0, "block 0 is reserved");
        assert_eq!(page.len(), PAGESIZE as usize);
        self.file
            .read_exact_at(page, block as u64 * PAGESIZE as u64)
            .unwrap_or_else(|err| panic!("backing store read of block {block} failed: {err}"));
    }
}
