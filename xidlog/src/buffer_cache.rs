//! The buffer cache: a fixed set of in-memory frames caching relation
//! blocks, with at most one resident image per (relation, block).
//!
//! Frames are handed out as pinned [`BufferHandle`]s. A pinned frame is
//! never evicted; unpinned frames are recycled with a clock sweep. The pool
//! table is behind a single mutex, pin counts are atomics, and each frame's
//! image has its own reader/writer lock.
//!
//! Lock order is pool table, then frame image, then relation storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::block::Block;
use crate::error::{Result, XidLogError};
use crate::relation::{Relation, RelationId};
use crate::BlockNumber;

/// Identity of a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub relation: RelationId,
    pub block: BlockNumber,
}

#[derive(Debug)]
struct Frame {
    image: RwLock<Block>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    recently_used: AtomicBool,
}

struct Resident {
    tag: BufferTag,
    relation: Arc<Relation>,
}

struct PoolState {
    page_table: HashMap<BufferTag, usize>,
    residents: Vec<Option<Resident>>,
    free_list: Vec<usize>,
    clock_hand: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
}

pub struct BufferCache {
    block_size: usize,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    counters: Counters,
}

/// A pinned block. Unpins on drop.
pub struct BufferHandle<'a> {
    cache: &'a BufferCache,
    frame_index: usize,
    tag: BufferTag,
    relation: Arc<Relation>,
}

impl BufferHandle<'_> {
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    pub fn block_number(&self) -> BlockNumber {
        self.tag.block
    }

    pub fn relation(&self) -> &Arc<Relation> {
        &self.relation
    }

    fn frame(&self) -> &Frame {
        &self.cache.frames[self.frame_index]
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Block> {
        self.frame().image.read()
    }

    /// Exclusive access to the image. The frame is marked dirty once the
    /// lock is held.
    pub fn write(&self) -> RwLockWriteGuard<'_, Block> {
        let guard = self.frame().image.write();
        self.frame().dirty.store(true, Ordering::Release);
        guard
    }

    pub fn mark_dirty(&self) {
        self.frame().dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.frame().dirty.load(Ordering::Acquire)
    }

    /// Unpins without writing anything.
    pub fn release(self) {}

    /// Marks the block dirty and writes it through to disk, returning only
    /// once the write has been synced. On failure the block stays dirty and
    /// pinned, so the caller can still repair the image.
    pub fn flush(&self) -> Result<()> {
        self.mark_dirty();
        self.cache.flush_frame(self.frame_index, &self.relation, self.tag)
    }

    /// [`flush`](Self::flush), then unpin.
    pub fn write_back(self) -> Result<()> {
        self.flush()
    }
}

impl Drop for BufferHandle<'_> {
    fn drop(&mut self) {
        self.cache.unpin_frame(self.frame_index);
    }
}

impl BufferCache {
    pub fn new(capacity: usize, block_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(XidLogError::Configuration(
                "buffer cache needs at least one frame".to_string(),
            ));
        }
        let mut frames = Vec::with_capacity(capacity);
        let mut residents = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            frames.push(Frame {
                image: RwLock::new(Block::zeroed(block_size)),
                pin_count: AtomicU32::new(0),
                dirty: AtomicBool::new(false),
                recently_used: AtomicBool::new(false),
            });
            residents.push(None);
        }
        // Pop from the back hands out frame 0 first.
        let free_list = (0..capacity).rev().collect();
        Ok(Self {
            block_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                residents,
                free_list,
                clock_hand: 0,
            }),
            counters: Counters::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stats(&self) -> BufferCacheStats {
        BufferCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
        }
    }

    pub fn is_resident(&self, relation: RelationId, block: BlockNumber) -> bool {
        self.state
            .lock()
            .page_table
            .contains_key(&BufferTag { relation, block })
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Pins `block` of `relation` for writing, reading it in on a miss. A
    /// block past the end of the relation is created on disk as zeros first.
    pub fn pin(&self, relation: &Arc<Relation>, block: BlockNumber) -> Result<BufferHandle<'_>> {
        self.pin_block(relation, block, true)
    }

    /// Pins `block` for reading. A block past the end of the relation is
    /// served as a zero image and nothing is written to disk.
    pub fn pin_for_read(&self, relation: &Arc<Relation>, block: BlockNumber) -> Result<BufferHandle<'_>> {
        self.pin_block(relation, block, false)
    }

    fn pin_block(&self, relation: &Arc<Relation>, block: BlockNumber, extend: bool) -> Result<BufferHandle<'_>> {
        let tag = BufferTag {
            relation: relation.id(),
            block,
        };
        let mut state = self.state.lock();

        // 1. Already resident: share the image. It may have been read in
        // past the end, in which case a writer creates it on disk now.
        if let Some(&frame_index) = state.page_table.get(&tag) {
            if extend {
                let mut storage = relation.storage.lock();
                if block >= storage.nblocks() {
                    debug!(relation = relation.name(), block, "extending relation under cached block");
                    storage
                        .extend_to(block)
                        .map_err(|e| XidLogError::io(relation.name(), block, e))?;
                }
            }
            self.pin_frame(frame_index);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(self.handle(frame_index, tag, relation));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // 2. Find a free frame or a victim.
        let frame_index = self
            .find_victim_frame(&mut state)
            .ok_or(XidLogError::NoFreeBuffer {
                capacity: self.capacity(),
            })?;

        // 3. Write the victim out if needed and forget it.
        self.evict(&mut state, frame_index)?;

        // 4. Read the block into the frame.
        if let Err(e) = self.load_frame(frame_index, relation, block, extend) {
            state.free_list.push(frame_index);
            return Err(e);
        }

        // 5. Publish it.
        self.pin_frame(frame_index);
        state.residents[frame_index] = Some(Resident {
            tag,
            relation: Arc::clone(relation),
        });
        state.page_table.insert(tag, frame_index);
        Ok(self.handle(frame_index, tag, relation))
    }

    fn handle(&self, frame_index: usize, tag: BufferTag, relation: &Arc<Relation>) -> BufferHandle<'_> {
        BufferHandle {
            cache: self,
            frame_index,
            tag,
            relation: Arc::clone(relation),
        }
    }

    fn load_frame(&self, frame_index: usize, relation: &Relation, block: BlockNumber, extend: bool) -> Result<()> {
        let frame = &self.frames[frame_index];
        let mut image = frame.image.write();
        let mut storage = relation.storage.lock();
        let loaded = if extend && block >= storage.nblocks() {
            debug!(relation = relation.name(), block, "extending relation for new block");
            image.zero();
            storage.extend_to(block)
        } else {
            debug!(relation = relation.name(), block, frame_index, "reading block");
            storage.read_block(block, image.as_bytes_mut())
        };
        frame.dirty.store(false, Ordering::Release);
        loaded.map_err(|e| XidLogError::io(relation.name(), block, e))
    }

    fn pin_frame(&self, frame_index: usize) {
        let frame = &self.frames[frame_index];
        frame.pin_count.fetch_add(1, Ordering::AcqRel);
        frame.recently_used.store(true, Ordering::Relaxed);
    }

    fn unpin_frame(&self, frame_index: usize) {
        let previous = self.frames[frame_index].pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unpinned frame {} below zero", frame_index);
    }

    fn evict(&self, state: &mut PoolState, frame_index: usize) -> Result<()> {
        let Some(resident) = state.residents[frame_index].as_ref() else {
            return Ok(());
        };
        let frame = &self.frames[frame_index];
        if frame.dirty.load(Ordering::Acquire) {
            let image = frame.image.read();
            resident
                .relation
                .storage
                .lock()
                .write_block(resident.tag.block, image.as_bytes())
                .map_err(|e| XidLogError::io(resident.relation.name(), resident.tag.block, e))?;
            frame.dirty.store(false, Ordering::Release);
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            relation = resident.relation.name(),
            block = resident.tag.block,
            frame_index,
            "evicting block"
        );
        let tag = resident.tag;
        state.page_table.remove(&tag);
        state.residents[frame_index] = None;
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn find_victim_frame(&self, state: &mut PoolState) -> Option<usize> {
        if let Some(frame_index) = state.free_list.pop() {
            return Some(frame_index);
        }

        let frame_count = self.frames.len();
        // Two full passes: the first can clear reference bits, the second
        // can pick a victim.
        for _ in 0..(frame_count * 2) {
            let frame_index = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % frame_count;

            let frame = &self.frames[frame_index];
            if frame.pin_count.load(Ordering::Acquire) == 0 {
                if frame.recently_used.swap(false, Ordering::Relaxed) {
                    continue;
                }
                return Some(frame_index);
            }
        }

        // All frames are pinned.
        None
    }

    fn flush_frame(&self, frame_index: usize, relation: &Relation, tag: BufferTag) -> Result<()> {
        let frame = &self.frames[frame_index];
        let image = frame.image.read();
        if !frame.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        relation
            .storage
            .lock()
            .write_block(tag.block, image.as_bytes())
            .map_err(|e| XidLogError::io(relation.name(), tag.block, e))?;
        frame.dirty.store(false, Ordering::Release);
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pins every dirty resident frame accepted by `filter`. The pins keep
    /// the frames in place once the pool lock is dropped.
    fn pin_dirty<F>(&self, filter: F) -> Vec<BufferHandle<'_>>
    where
        F: Fn(&BufferTag) -> bool,
    {
        let state = self.state.lock();
        let mut handles = Vec::new();
        for (frame_index, resident) in state.residents.iter().enumerate() {
            let Some(resident) = resident else { continue };
            if !filter(&resident.tag) || !self.frames[frame_index].dirty.load(Ordering::Acquire) {
                continue;
            }
            self.pin_frame(frame_index);
            handles.push(self.handle(frame_index, resident.tag, &resident.relation));
        }
        handles
    }

    fn flush_handles(&self, handles: Vec<BufferHandle<'_>>) -> Result<usize> {
        let mut written = 0;
        for handle in handles {
            self.flush_frame(handle.frame_index, &handle.relation, handle.tag)?;
            written += 1;
        }
        Ok(written)
    }

    /// Writes every dirty block to disk. Returns the number written.
    pub fn flush_all(&self) -> Result<usize> {
        let handles = self.pin_dirty(|_| true);
        self.flush_handles(handles)
    }

    /// Writes every dirty block of one relation to disk.
    pub fn flush_relation(&self, relation: RelationId) -> Result<usize> {
        let handles = self.pin_dirty(|tag| tag.relation == relation);
        self.flush_handles(handles)
    }

    /// Forgets every clean, unpinned block of `relation`, letting go of its
    /// storage. Dirty or pinned blocks stay cached. Returns the number
    /// dropped.
    pub fn drop_relation(&self, relation: RelationId) -> usize {
        let mut state = self.state.lock();
        let idle: Vec<(BufferTag, usize)> = state
            .page_table
            .iter()
            .filter(|(tag, frame_index)| {
                let frame = &self.frames[**frame_index];
                tag.relation == relation
                    && frame.pin_count.load(Ordering::Acquire) == 0
                    && !frame.dirty.load(Ordering::Acquire)
            })
            .map(|(tag, &frame_index)| (*tag, frame_index))
            .collect();
        for (tag, frame_index) in &idle {
            state.page_table.remove(tag);
            state.residents[*frame_index] = None;
            state.free_list.push(*frame_index);
        }
        if !idle.is_empty() {
            debug!(%relation, dropped = idle.len(), "dropped cached blocks");
        }
        idle.len()
    }

    /// Drops the cached images of `relation`'s blocks below `cutoff` without
    /// writing them. Fails if any of them is pinned.
    pub fn discard_before(&self, relation: RelationId, cutoff: BlockNumber) -> Result<usize> {
        let mut state = self.state.lock();
        let doomed: Vec<(BufferTag, usize)> = state
            .page_table
            .iter()
            .filter(|(tag, _)| tag.relation == relation && tag.block < cutoff)
            .map(|(tag, &frame_index)| (*tag, frame_index))
            .collect();

        if let Some((tag, _)) = doomed
            .iter()
            .find(|(_, frame_index)| self.frames[*frame_index].pin_count.load(Ordering::Acquire) > 0)
        {
            return Err(XidLogError::InvalidArgument(format!(
                "block {} of {} is pinned and cannot be discarded",
                tag.block, tag.relation
            )));
        }

        for (tag, frame_index) in &doomed {
            state.page_table.remove(tag);
            state.residents[*frame_index] = None;
            self.frames[*frame_index].dirty.store(false, Ordering::Release);
            state.free_list.push(*frame_index);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failpoint;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    const BLOCK: usize = 512;

    fn setup(capacity: usize) -> (TempDir, BufferCache, Arc<Relation>) {
        let temp_dir = tempdir().unwrap();
        let relation = Relation::open("test_rel", temp_dir.path().join("rel"), BLOCK, 4).unwrap();
        let cache = BufferCache::new(capacity, BLOCK).unwrap();
        (temp_dir, cache, relation)
    }

    #[test]
    fn test_pin_extends_relation() {
        let (_dir, cache, rel) = setup(4);
        let handle = cache.pin(&rel, 2).unwrap();
        assert!(handle.read().is_zeroed());
        assert_eq!(rel.nblocks(), 3);
        handle.release();
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_same_block_shares_one_image() {
        let (_dir, cache, rel) = setup(4);
        let first = cache.pin(&rel, 0).unwrap();
        let second = cache.pin(&rel, 0).unwrap();
        assert_eq!(first.frame_index, second.frame_index);

        first.write().as_bytes_mut()[10] = 0x42;
        assert_eq!(second.read().as_bytes()[10], 0x42);
        assert_eq!(cache.resident_count(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_concurrent_pins_share_one_image() {
        let (_dir, cache, rel) = setup(8);
        let frames: Vec<usize> = thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let handle = cache.pin(&rel, 3).unwrap();
                        handle.frame_index
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(frames.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.resident_count(), 1);
    }

    #[test]
    fn test_write_back_persists() {
        let (dir, cache, rel) = setup(2);
        let handle = cache.pin(&rel, 1).unwrap();
        handle.write().as_bytes_mut()[0] = 7;
        handle.write_back().unwrap();
        assert_eq!(cache.stats().writes, 1);

        let reopened = Relation::open("test_rel", dir.path().join("rel"), BLOCK, 4).unwrap();
        let fresh = BufferCache::new(2, BLOCK).unwrap();
        let handle = fresh.pin(&reopened, 1).unwrap();
        assert_eq!(handle.read().as_bytes()[0], 7);
    }

    #[test]
    fn test_dirty_victim_written_on_eviction() {
        let (dir, cache, rel) = setup(1);
        {
            let handle = cache.pin(&rel, 0).unwrap();
            handle.write().as_bytes_mut()[5] = 9;
        }
        // Evicts block 0, writing it first.
        cache.pin(&rel, 1).unwrap().release();
        assert!(!cache.is_resident(rel.id(), 0));
        assert_eq!(cache.stats().evictions, 1);

        let reopened = Relation::open("test_rel", dir.path().join("rel"), BLOCK, 4).unwrap();
        let fresh = BufferCache::new(1, BLOCK).unwrap();
        assert_eq!(fresh.pin(&reopened, 0).unwrap().read().as_bytes()[5], 9);
    }

    #[test]
    fn test_all_pinned_is_an_error() {
        let (_dir, cache, rel) = setup(2);
        let _a = cache.pin(&rel, 0).unwrap();
        let _b = cache.pin(&rel, 1).unwrap();
        match cache.pin(&rel, 2) {
            Err(XidLogError::NoFreeBuffer { capacity }) => assert_eq!(capacity, 2),
            other => panic!("expected NoFreeBuffer, got {:?}", other.map(|h| h.tag())),
        };
    }

    #[test]
    fn test_clock_gives_second_chance() {
        let (_dir, cache, rel) = setup(2);
        cache.pin(&rel, 0).unwrap().release();
        cache.pin(&rel, 1).unwrap().release();
        // Both have their reference bit set; the sweep clears them and then
        // takes frame 0.
        cache.pin(&rel, 2).unwrap().release();
        assert!(!cache.is_resident(rel.id(), 0));
        assert!(cache.is_resident(rel.id(), 1));
        assert!(cache.is_resident(rel.id(), 2));
    }

    #[test]
    fn test_read_error_frees_frame() {
        let (_dir, cache, rel) = setup(1);
        cache.pin(&rel, 0).unwrap().release();
        cache.pin(&rel, 1).unwrap().release();

        failpoint::enable(failpoint::STORAGE_READ);
        let err = cache.pin(&rel, 0);
        failpoint::clear();
        assert!(matches!(err, Err(XidLogError::Io { block: 0, .. })));
        assert_eq!(cache.resident_count(), 0);

        // The frame is usable again.
        cache.pin(&rel, 0).unwrap().release();
    }

    #[test]
    fn test_write_back_failure_keeps_block_dirty() {
        let (_dir, cache, rel) = setup(2);
        let handle = cache.pin(&rel, 0).unwrap();
        handle.write().as_bytes_mut()[0] = 1;

        failpoint::enable(failpoint::STORAGE_WRITE);
        assert!(handle.write_back().is_err());
        failpoint::clear();

        let handle = cache.pin(&rel, 0).unwrap();
        assert!(handle.is_dirty());
        drop(handle);
        assert_eq!(cache.flush_all().unwrap(), 1);
        assert_eq!(cache.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_flush_relation_only_touches_that_relation() {
        let (dir, cache, rel) = setup(4);
        let other = Relation::open("other", dir.path().join("other"), BLOCK, 4).unwrap();
        cache.pin(&rel, 0).unwrap().mark_dirty();
        cache.pin(&other, 0).unwrap().mark_dirty();

        assert_eq!(cache.flush_relation(rel.id()).unwrap(), 1);
        assert_eq!(cache.flush_all().unwrap(), 1);
    }

    #[test]
    fn test_discard_before() {
        let (_dir, cache, rel) = setup(4);
        for block in 0..3 {
            cache.pin(&rel, block).unwrap().mark_dirty();
        }
        let pinned = cache.pin(&rel, 1).unwrap();
        assert!(cache.discard_before(rel.id(), 2).is_err());
        drop(pinned);

        assert_eq!(cache.discard_before(rel.id(), 2).unwrap(), 2);
        assert_eq!(cache.resident_count(), 1);
        assert!(cache.is_resident(rel.id(), 2));
    }

    #[test]
    fn test_read_pin_past_end_does_not_extend() {
        let (_dir, cache, rel) = setup(4);
        let handle = cache.pin_for_read(&rel, 900).unwrap();
        assert!(handle.read().is_zeroed());
        handle.release();
        assert_eq!(rel.nblocks(), 0);
        assert!(cache.is_resident(rel.id(), 900));

        // Pinning the same cached block for writing creates it on disk.
        let handle = cache.pin(&rel, 3).unwrap();
        handle.release();
        cache.pin_for_read(&rel, 5).unwrap().release();
        assert_eq!(rel.nblocks(), 4);
        cache.pin(&rel, 5).unwrap().release();
        assert_eq!(rel.nblocks(), 6);
    }

    #[test]
    fn test_failed_flush_keeps_pin() {
        let (_dir, cache, rel) = setup(1);
        let handle = cache.pin(&rel, 0).unwrap();
        handle.write().as_bytes_mut()[0] = 7;

        failpoint::enable(failpoint::STORAGE_WRITE);
        assert!(handle.flush().is_err());
        failpoint::clear();

        // Still pinned: the only frame cannot be taken by another block.
        assert!(matches!(cache.pin(&rel, 1), Err(XidLogError::NoFreeBuffer { .. })));
        handle.write().as_bytes_mut()[0] = 0;
        handle.flush().unwrap();
        assert!(!handle.is_dirty());
    }

    #[test]
    fn test_drop_relation_keeps_dirty_and_pinned_blocks() {
        let (_dir, cache, rel) = setup(4);
        cache.pin(&rel, 0).unwrap().release();
        cache.pin(&rel, 1).unwrap().mark_dirty();
        let pinned = cache.pin(&rel, 2).unwrap();

        assert_eq!(cache.drop_relation(rel.id()), 1);
        assert!(!cache.is_resident(rel.id(), 0));
        assert!(cache.is_resident(rel.id(), 1));
        assert!(cache.is_resident(rel.id(), 2));

        drop(pinned);
        cache.flush_relation(rel.id()).unwrap();
        assert_eq!(cache.drop_relation(rel.id()), 2);
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            BufferCache::new(0, BLOCK),
            Err(XidLogError::Configuration(_))
        ));
    }
}
