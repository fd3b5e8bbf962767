pub mod address;

pub mod block;

pub mod buffer_cache;

pub mod codec;

pub mod config;

pub mod control;

pub mod error;

pub mod failpoint;

pub mod lock_manager;

pub mod relation;

pub mod status;

pub mod status_store;

pub mod storage;

pub mod xid;

pub type BlockNumber = u32;

pub use address::{BlockAddress, Geometry, StoreKind};
pub use block::Block;
pub use buffer_cache::{BufferCache, BufferCacheStats, BufferHandle, BufferTag};
pub use config::StoreConfig;
pub use error::{Result, XidLogError};
pub use lock_manager::{LockManager, LockMode, RelationLockGuard};
pub use relation::{Relation, RelationId};
pub use status::{CommitTime, RecordedStatus, XidStatus};
pub use status_store::{TransactionLog, TruncateSummary};
pub use xid::TransactionId;
