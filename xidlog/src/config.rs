//! Store configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::address::Geometry;
use crate::error::{Result, XidLogError};

pub const DEFAULT_BLOCK_SIZE: usize = 8192;
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;
/// 32 blocks of 32768 statuses: about a million transactions per segment.
pub const DEFAULT_BLOCKS_PER_SEGMENT: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub block_size: usize,
    pub buffer_capacity: usize,
    pub blocks_per_segment: u32,
    /// How long a relation lock request may wait. `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("xidlog_data"),
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            blocks_per_segment: DEFAULT_BLOCKS_PER_SEGMENT,
            lock_timeout: None,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| XidLogError::Configuration(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

impl StoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `XIDLOG_DATA_DIR`, `XIDLOG_BLOCK_SIZE`,
    /// `XIDLOG_BUFFERS`, `XIDLOG_BLOCKS_PER_SEGMENT` and
    /// `XIDLOG_LOCK_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(dir) = env_parse::<PathBuf>("XIDLOG_DATA_DIR")? {
            config.data_dir = dir;
        }
        if let Some(size) = env_parse("XIDLOG_BLOCK_SIZE")? {
            config.block_size = size;
        }
        if let Some(capacity) = env_parse("XIDLOG_BUFFERS")? {
            config.buffer_capacity = capacity;
        }
        if let Some(blocks) = env_parse("XIDLOG_BLOCKS_PER_SEGMENT")? {
            config.blocks_per_segment = blocks;
        }
        if let Some(ms) = env_parse::<u64>("XIDLOG_LOCK_TIMEOUT_MS")? {
            config.lock_timeout = Some(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_blocks_per_segment(mut self, blocks: u32) -> Self {
        self.blocks_per_segment = blocks;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.block_size)
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry()?;
        if self.buffer_capacity == 0 {
            return Err(XidLogError::Configuration(
                "buffer capacity must be at least one block".to_string(),
            ));
        }
        if self.blocks_per_segment == 0 {
            return Err(XidLogError::Configuration(
                "a segment must hold at least one block".to_string(),
            ));
        }
        Ok(())
    }
}
