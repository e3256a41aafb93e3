//! Engine configuration.
//!
//! The real-memory size comes from `VMSIM_REAL_MEM_SIZE` (decimal bytes)
//! when set, otherwise from the default. The backing store is anonymous
//! unless a path is supplied.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::addr::PAGESIZE;
use crate::arena::PT_AREA_SIZE;

/// Environment variable overriding the real-memory size.
pub const REAL_MEM_SIZE_ENV: &str = "VMSIM_REAL_MEM_SIZE";

/// Default total real-memory size (4 MiB + 16 KiB).
pub const DEFAULT_REAL_MEMORY_SIZE: u32 = (4 << 20) + (16 << 10);

/// Smallest workable arena: the page-table region plus one frame.
pub const MIN_REAL_MEMORY_SIZE: u32 = PT_AREA_SIZE + PAGESIZE;

/// Error type for configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{REAL_MEM_SIZE_ENV} is not an unsigned 32-bit decimal byte count: {0:?}")]
    BadMemSize(String),
    #[error("real memory size {got:#x} is below the minimum {min:#x}")]
    MemSizeTooSmall { got: u32, min: u32 },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Total size of the real-memory arena in bytes.
    pub real_size: u32,
    /// Where to keep the backing store; anonymous when `None`.
    pub store_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            real_size: DEFAULT_REAL_MEMORY_SIZE,
            store_path: None,
        }
    }
}

impl Config {
    /// A configuration with an explicit arena size.
    pub fn with_real_size(real_size: u32) -> Result<Self, ConfigError> {
        if real_size < MIN_REAL_MEMORY_SIZE {
            return Err(ConfigError::MemSizeTooSmall {
                got: real_size,
                min: MIN_REAL_MEMORY_SIZE,
            });
        }
        Ok(Self {
            real_size,
            store_path: None,
        })
    }

    /// The configuration the environment asks for.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var(REAL_MEM_SIZE_ENV) {
            Ok(raw) => Self::parse_size(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    fn parse_size(raw: &str) -> Result<Self, ConfigError> {
        let size = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::BadMemSize(raw.to_owned()))?;
        Self::with_real_size(size)
    }

    pub fn store_at(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }
}
