//! The transaction log: commit status and commit time per transaction id.
//!
//! Every access takes the relation lock first (shared to read, exclusive to
//! write), pins the block through the buffer cache, decodes or encodes the
//! entry, writes the block through if it changed, and releases the pin and
//! the lock in reverse order.
//!
//! A status moves from in progress to committed or aborted exactly once.
//! Statuses and commit times live in separate relations with separate
//! locks; nothing here makes the two change together.

use std::fs;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::address::{BlockAddress, Geometry, StoreKind};
use crate::buffer_cache::BufferCache;
use crate::codec;
use crate::config::StoreConfig;
use crate::control::{self, ControlData};
use crate::error::{Result, XidLogError};
use crate::lock_manager::LockManager;
use crate::relation::Relation;
use crate::status::{CommitTime, RecordedStatus, XidStatus};
use crate::xid::TransactionId;
use crate::BlockNumber;

/// What a call to [`TransactionLog::truncate`] removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TruncateSummary {
    pub horizon: TransactionId,
    pub status_segments: Vec<u32>,
    pub time_segments: Vec<u32>,
}

pub struct TransactionLog {
    config: StoreConfig,
    geometry: Geometry,
    buffers: Arc<BufferCache>,
    locks: Arc<LockManager>,
    status_rel: Arc<Relation>,
    time_rel: Arc<Relation>,
}

impl TransactionLog {
    /// Opens (or creates) a store with its own buffer cache and lock
    /// manager.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let buffers = Arc::new(BufferCache::new(config.buffer_capacity, config.block_size)?);
        let locks = Arc::new(match config.lock_timeout {
            Some(timeout) => LockManager::with_timeout(timeout),
            None => LockManager::new(),
        });
        Self::open_with(config, buffers, locks)
    }

    /// Opens (or creates) a store on a buffer cache and lock manager owned
    /// by the caller.
    pub fn open_with(config: StoreConfig, buffers: Arc<BufferCache>, locks: Arc<LockManager>) -> Result<Self> {
        config.validate()?;
        let geometry = config.geometry()?;
        if buffers.block_size() != config.block_size {
            return Err(XidLogError::Configuration(format!(
                "buffer cache holds {}-byte blocks but the store uses {}-byte blocks",
                buffers.block_size(),
                config.block_size
            )));
        }

        fs::create_dir_all(&config.data_dir).map_err(|e| XidLogError::io(control::CONTROL_FILE_NAME, 0, e))?;
        control::ensure(
            &config.data_dir,
            &ControlData::new(config.block_size, config.blocks_per_segment),
        )?;

        let open_relation = |kind: StoreKind| {
            let name = kind.relation_name();
            Relation::open(
                name,
                config.data_dir.join(name),
                config.block_size,
                config.blocks_per_segment,
            )
        };
        let status_rel = open_relation(StoreKind::Status)?;
        let time_rel = open_relation(StoreKind::Time)?;

        info!(
            dir = %config.data_dir.display(),
            block_size = config.block_size,
            status_blocks = status_rel.nblocks(),
            time_blocks = time_rel.nblocks(),
            "opened transaction log"
        );

        Ok(Self {
            config,
            geometry,
            buffers,
            locks,
            status_rel,
            time_rel,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn buffers(&self) -> &Arc<BufferCache> {
        &self.buffers
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn relation(&self, kind: StoreKind) -> &Arc<Relation> {
        match kind {
            StoreKind::Status => &self.status_rel,
            StoreKind::Time => &self.time_rel,
        }
    }

    /// Lowest transaction id still addressable after truncation.
    pub fn horizon(&self) -> TransactionId {
        let status = self
            .geometry
            .first_xid_of(StoreKind::Status, self.status_rel.first_block());
        let time = self.geometry.first_xid_of(StoreKind::Time, self.time_rel.first_block());
        status.max(time)
    }

    /// Validates `xid` and works out where its entry lives. Must be called
    /// with the relation lock held so truncation cannot race it.
    fn address(&self, kind: StoreKind, xid: TransactionId) -> Result<BlockAddress> {
        if !xid.is_valid() {
            return Err(XidLogError::InvalidArgument(
                "transaction id 0 is not a valid transaction".to_string(),
            ));
        }
        let horizon = self.horizon();
        if xid < horizon {
            return Err(XidLogError::InvalidArgument(format!(
                "transaction {} precedes the truncation horizon {}",
                xid, horizon
            )));
        }
        Ok(self.geometry.locate(kind, xid))
    }

    fn report(&self, xid: TransactionId, block: BlockNumber, err: XidLogError) -> XidLogError {
        if err.is_storage_failure() {
            error!(%xid, block, error = %err, "transaction log access failed");
        }
        err
    }

    fn reject_permanent(xid: TransactionId, what: &str) -> Result<()> {
        if xid.is_permanent() {
            return Err(XidLogError::InvalidArgument(format!(
                "cannot set the {} of permanent transaction {}",
                what, xid
            )));
        }
        Ok(())
    }

    pub fn get_status(&self, xid: TransactionId) -> Result<XidStatus> {
        if xid.is_permanent() {
            return Ok(XidStatus::Committed);
        }
        let lock = self.locks.acquire_read(&self.status_rel)?;
        let status = self.read_status_locked(xid)?;
        lock.release();
        Ok(status)
    }

    /// Records the outcome of `xid` and writes it through to disk.
    ///
    /// Re-recording the current status is accepted. Changing a committed or
    /// aborted transaction is refused. If the write fails, the cached block
    /// is put back as it was and the transaction keeps its old status.
    pub fn set_status(&self, xid: TransactionId, status: RecordedStatus) -> Result<()> {
        Self::reject_permanent(xid, "status")?;
        let lock = self.locks.acquire_write(&self.status_rel)?;
        self.write_status_locked(xid, status)?;
        lock.release();
        Ok(())
    }

    pub fn get_commit_time(&self, xid: TransactionId) -> Result<CommitTime> {
        if xid.is_permanent() {
            return Ok(CommitTime::INVALID);
        }
        let lock = self.locks.acquire_read(&self.time_rel)?;
        let time = self.read_time_locked(xid)?;
        lock.release();
        Ok(time)
    }

    /// Records the commit time of `xid`. A commit time is set once;
    /// setting the same value again is accepted. A failed write leaves no
    /// time behind.
    pub fn set_commit_time(&self, xid: TransactionId, time: CommitTime) -> Result<()> {
        Self::reject_permanent(xid, "commit time")?;
        let lock = self.locks.acquire_write(&self.time_rel)?;
        self.write_time_locked(xid, time)?;
        lock.release();
        Ok(())
    }

    /// Records a commit: the time first, then the status. The status lock
    /// is held throughout, so an abort cannot slip in between. A failure
    /// after the time is written leaves the time in place.
    pub fn record_commit(&self, xid: TransactionId, time: CommitTime) -> Result<()> {
        Self::reject_permanent(xid, "status")?;
        let status_lock = self.locks.acquire_write(&self.status_rel)?;
        if self.read_status_locked(xid)? == XidStatus::Aborted {
            return Err(XidLogError::InvalidArgument(format!(
                "transaction {} is already aborted; cannot record it as committed",
                xid
            )));
        }
        let time_lock = self.locks.acquire_write(&self.time_rel)?;
        self.write_time_locked(xid, time)?;
        time_lock.release();
        self.write_status_locked(xid, RecordedStatus::Committed)?;
        status_lock.release();
        Ok(())
    }

    // The helpers below expect the caller to hold the relation lock: shared
    // for reads, exclusive for writes.

    fn read_status_locked(&self, xid: TransactionId) -> Result<XidStatus> {
        let addr = self.address(StoreKind::Status, xid)?;
        let handle = self
            .buffers
            .pin_for_read(&self.status_rel, addr.block)
            .map_err(|e| self.report(xid, addr.block, e))?;
        let decoded = {
            let image = handle.read();
            codec::get_xid_status(Some(&*image), &self.geometry, xid)
        };
        decoded.map_err(|e| self.report(xid, addr.block, e))
    }

    fn write_status_locked(&self, xid: TransactionId, status: RecordedStatus) -> Result<()> {
        let addr = self.address(StoreKind::Status, xid)?;
        let handle = self
            .buffers
            .pin(&self.status_rel, addr.block)
            .map_err(|e| self.report(xid, addr.block, e))?;

        let current = {
            let image = handle.read();
            codec::get_xid_status(Some(&*image), &self.geometry, xid)
        }
        .map_err(|e| self.report(xid, addr.block, e))?;
        let requested = XidStatus::from(status);
        if current.is_final() && current != requested {
            warn!(%xid, %current, %requested, "refusing to change a finished transaction");
            return Err(XidLogError::InvalidArgument(format!(
                "transaction {} is already {}; cannot record it as {}",
                xid, current, requested
            )));
        }
        let previous = RecordedStatus::try_from(current).map_err(|_| {
            XidLogError::InvalidArgument(format!("transaction {} has no status block", xid))
        })?;

        {
            let mut image = handle.write();
            codec::set_xid_status(Some(&mut *image), &self.geometry, xid, status)?;
        }
        if let Err(e) = handle.flush() {
            // The frame stays dirty, so the restored image is what reaches
            // disk next.
            let mut image = handle.write();
            codec::set_xid_status(Some(&mut *image), &self.geometry, xid, previous)?;
            return Err(self.report(xid, addr.block, e));
        }
        debug!(%xid, %requested, block = addr.block, index = addr.index, "recorded status");
        Ok(())
    }

    fn read_time_locked(&self, xid: TransactionId) -> Result<CommitTime> {
        let addr = self.address(StoreKind::Time, xid)?;
        let handle = self
            .buffers
            .pin_for_read(&self.time_rel, addr.block)
            .map_err(|e| self.report(xid, addr.block, e))?;
        let decoded = {
            let image = handle.read();
            codec::get_commit_time(Some(&*image), &self.geometry, xid)
        };
        decoded.map_err(|e| self.report(xid, addr.block, e))
    }

    fn write_time_locked(&self, xid: TransactionId, time: CommitTime) -> Result<()> {
        if !time.is_valid() {
            return Err(XidLogError::InvalidArgument(format!(
                "commit time for transaction {} must not be the invalid sentinel",
                xid
            )));
        }
        let addr = self.address(StoreKind::Time, xid)?;
        let handle = self
            .buffers
            .pin(&self.time_rel, addr.block)
            .map_err(|e| self.report(xid, addr.block, e))?;

        let previous = {
            let image = handle.read();
            codec::get_commit_time(Some(&*image), &self.geometry, xid)?
        };
        if previous.is_valid() && previous != time {
            return Err(XidLogError::InvalidArgument(format!(
                "transaction {} already has commit time {}",
                xid, previous
            )));
        }

        {
            let mut image = handle.write();
            codec::set_commit_time(Some(&mut *image), &self.geometry, xid, time)?;
        }
        if let Err(e) = handle.flush() {
            let mut image = handle.write();
            codec::set_commit_time(Some(&mut *image), &self.geometry, xid, previous)?;
            return Err(self.report(xid, addr.block, e));
        }
        debug!(%xid, %time, block = addr.block, "recorded commit time");
        Ok(())
    }

    pub fn record_abort(&self, xid: TransactionId) -> Result<()> {
        self.set_status(xid, RecordedStatus::Aborted)
    }

    pub fn did_commit(&self, xid: TransactionId) -> Result<bool> {
        Ok(self.get_status(xid)? == XidStatus::Committed)
    }

    pub fn did_abort(&self, xid: TransactionId) -> Result<bool> {
        Ok(self.get_status(xid)? == XidStatus::Aborted)
    }

    pub fn is_in_progress(&self, xid: TransactionId) -> Result<bool> {
        Ok(self.get_status(xid)? == XidStatus::InProgress)
    }

    /// Makes sure the blocks that will hold `newest` exist on disk. Only the
    /// first id of a block does any work.
    pub fn extend(&self, newest: TransactionId) -> Result<()> {
        for kind in [StoreKind::Status, StoreKind::Time] {
            let addr = self.geometry.locate(kind, newest);
            if addr.index != 0 && newest != TransactionId::FIRST_NORMAL {
                continue;
            }
            let relation = self.relation(kind);
            let lock = self.locks.acquire_write(relation)?;
            let addr = self.address(kind, newest)?;
            if addr.block < relation.nblocks() {
                continue;
            }
            self.buffers
                .pin(relation, addr.block)
                .map_err(|e| self.report(newest, addr.block, e))?
                .release();
            debug!(relation = relation.name(), block = addr.block, "extended for new transaction");
            lock.release();
        }
        Ok(())
    }

    /// Writes out every dirty block of both relations. Each relation is
    /// share-locked while it is flushed, so no half-finished write reaches
    /// disk.
    pub fn checkpoint(&self) -> Result<usize> {
        let mut written = 0;
        for kind in [StoreKind::Status, StoreKind::Time] {
            let relation = self.relation(kind);
            let lock = self.locks.acquire_read(relation)?;
            written += self.buffers.flush_relation(relation.id())?;
            lock.release();
        }
        info!(written, "checkpoint complete");
        Ok(written)
    }

    /// Removes every segment that holds only transactions older than the
    /// segment containing `oldest`. Afterwards, ids below the new horizon
    /// are rejected.
    pub fn truncate(&self, oldest: TransactionId) -> Result<TruncateSummary> {
        let mut summary = TruncateSummary::default();
        let per_segment = self.config.blocks_per_segment;

        let status_lock = self.locks.acquire_write(&self.status_rel)?;
        let latest = self.status_rel.nblocks();
        let oldest_block = self.geometry.block_number(StoreKind::Status, oldest);
        if oldest_block >= latest {
            warn!(%oldest, latest, "refusing to truncate past the end of the status log");
            return Err(XidLogError::InvalidArgument(format!(
                "cannot truncate at transaction {}: the status log ends at block {}",
                oldest, latest
            )));
        }
        let status_cutoff = oldest_block - oldest_block % per_segment;
        summary.status_segments = self.truncate_relation(&self.status_rel, status_cutoff)?;

        let time_lock = self.locks.acquire_write(&self.time_rel)?;
        let time_block = self.geometry.block_number(StoreKind::Time, oldest);
        // Keep the segment holding the last commit time block.
        let time_last = self.time_rel.nblocks().saturating_sub(1);
        let time_cutoff = (time_block - time_block % per_segment).min(time_last - time_last % per_segment);
        summary.time_segments = self.truncate_relation(&self.time_rel, time_cutoff)?;

        summary.horizon = self.horizon();
        time_lock.release();
        status_lock.release();
        info!(
            %oldest,
            horizon = %summary.horizon,
            status_segments = summary.status_segments.len(),
            time_segments = summary.time_segments.len(),
            "truncated transaction log"
        );
        Ok(summary)
    }

    fn truncate_relation(&self, relation: &Arc<Relation>, cutoff: BlockNumber) -> Result<Vec<u32>> {
        if cutoff <= relation.first_block() {
            return Ok(Vec::new());
        }
        self.buffers.flush_relation(relation.id())?;
        self.buffers.discard_before(relation.id(), cutoff)?;
        let removed = relation
            .storage
            .lock()
            .remove_segments_before(cutoff)
            .map_err(|e| XidLogError::io(relation.name(), cutoff, e))?;
        for segno in &removed {
            info!(relation = relation.name(), segment = segno, "removed segment");
        }
        Ok(removed)
    }

    /// Flushes anything still dirty and closes the store.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        Ok(())
    }
}

impl Drop for TransactionLog {
    /// Lets go of the relations in the shared cache and lock table. Blocks
    /// that are still dirty stay cached until they are written out.
    fn drop(&mut self) {
        for relation in [&self.status_rel, &self.time_rel] {
            let dropped = self.buffers.drop_relation(relation.id());
            let forgotten = self.locks.forget(relation.id());
            debug!(relation = relation.name(), dropped, forgotten, "released relation");
        }
    }
}
