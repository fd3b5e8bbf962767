//! Translates transaction ids into block addresses.

use crate::error::{Result, XidLogError};
use crate::xid::TransactionId;
use crate::BlockNumber;

/// Bits of status recorded per transaction.
pub const STATUS_BITS_PER_XACT: u32 = 2;
/// Transactions whose status fits in one byte.
pub const STATUS_XACTS_PER_BYTE: u32 = 8 / STATUS_BITS_PER_XACT;
/// Width of one commit-time slot in bytes.
pub const COMMIT_TIME_WIDTH: u32 = 8;

pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 65536;

/// The two sub-stores. Each lives in its own relation and packs a different
/// number of entries into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Status,
    Time,
}

impl StoreKind {
    pub fn relation_name(self) -> &'static str {
        match self {
            StoreKind::Status => "xact_status",
            StoreKind::Time => "commit_time",
        }
    }
}

/// Where a transaction's entry lives: which block, and which entry inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddress {
    pub block: BlockNumber,
    pub index: u32,
}

/// Block geometry of a store. Fixed when the store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
}

impl Geometry {
    pub fn new(block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(XidLogError::Configuration(format!(
                "block size {} must be a power of two between {} and {}",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        Ok(Self { block_size })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn items_per_block(&self, kind: StoreKind) -> u32 {
        let block_size = self.block_size as u32;
        match kind {
            StoreKind::Status => block_size * STATUS_XACTS_PER_BYTE,
            StoreKind::Time => block_size / COMMIT_TIME_WIDTH,
        }
    }

    pub fn block_number(&self, kind: StoreKind, xid: TransactionId) -> BlockNumber {
        xid.raw() / self.items_per_block(kind)
    }

    pub fn locate(&self, kind: StoreKind, xid: TransactionId) -> BlockAddress {
        let per_block = self.items_per_block(kind);
        BlockAddress {
            block: xid.raw() / per_block,
            index: xid.raw() % per_block,
        }
    }

    /// First transaction id stored in `block`, saturating at the top of the
    /// id space.
    pub fn first_xid_of(&self, kind: StoreKind, block: BlockNumber) -> TransactionId {
        TransactionId(block.saturating_mul(self.items_per_block(kind)))
    }
}
