//! Error type shared by every layer of the store.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::xid::TransactionId;
use crate::BlockNumber;

pub type Result<T> = std::result::Result<T, XidLogError>;

#[derive(Error, Debug)]
pub enum XidLogError {
    /// Malformed constants, or a store opened with a geometry other than the
    /// one it was created with. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The underlying segment files could not be read or written.
    #[error("I/O error on relation '{relation}' block {block}: {source}")]
    Io {
        relation: String,
        block: BlockNumber,
        #[source]
        source: io::Error,
    },

    /// An on-disk bit pattern that no writer produces.
    #[error("corrupt status bits {pattern:#04b} for transaction {xid} in block {block}")]
    CorruptData {
        xid: TransactionId,
        block: BlockNumber,
        pattern: u8,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out after {waited:?} waiting for lock on relation '{relation}'")]
    LockTimeout { relation: String, waited: Duration },

    /// Every buffer frame is pinned; nothing can be evicted.
    #[error("no unpinned buffer available ({capacity} frames, all pinned)")]
    NoFreeBuffer { capacity: usize },
}

impl XidLogError {
    pub(crate) fn io(relation: &str, block: BlockNumber, source: io::Error) -> Self {
        XidLogError::Io {
            relation: relation.to_string(),
            block,
            source,
        }
    }

    /// True for errors that indicate damaged or unreadable storage rather
    /// than a caller mistake.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, XidLogError::Io { .. } | XidLogError::CorruptData { .. })
    }
}
