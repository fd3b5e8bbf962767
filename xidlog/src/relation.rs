//! Relations: named, block-addressable linear stores.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, XidLogError};
use crate::storage::SegmentedFile;
use crate::BlockNumber;

static NEXT_RELATION_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of an open relation. Keys the buffer cache and
/// the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(u32);

impl RelationId {
    fn allocate() -> Self {
        RelationId(NEXT_RELATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel#{}", self.0)
    }
}

/// An open relation. Its storage is only touched by the buffer cache.
pub struct Relation {
    id: RelationId,
    name: String,
    pub(crate) storage: Mutex<SegmentedFile>,
}

impl Relation {
    pub fn open<P: AsRef<Path>>(
        name: &str,
        dir: P,
        block_size: usize,
        blocks_per_segment: u32,
    ) -> Result<Arc<Self>> {
        let storage = SegmentedFile::open(dir, block_size, blocks_per_segment)
            .map_err(|e| XidLogError::io(name, 0, e))?;
        Ok(Arc::new(Self {
            id: RelationId::allocate(),
            name: name.to_string(),
            storage: Mutex::new(storage),
        }))
    }

    pub fn id(&self) -> RelationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> usize {
        self.storage.lock().block_size()
    }

    pub fn nblocks(&self) -> BlockNumber {
        self.storage.lock().nblocks()
    }

    pub fn first_block(&self) -> BlockNumber {
        self.storage.lock().first_block()
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
