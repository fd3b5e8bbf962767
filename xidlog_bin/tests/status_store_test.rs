use std::sync::Arc;

use xidlog::failpoint;
use xidlog::{
    BufferCache, CommitTime, LockManager, RecordedStatus, StoreConfig, StoreKind, TransactionId, TransactionLog,
    XidLogError, XidStatus,
};

mod common;

#[test]
fn test_unset_transactions_read_in_progress() {
    let store = common::setup_store();
    for raw in [3, 4095, 4096, 5000, 70_000] {
        let xid = TransactionId(raw);
        assert_eq!(store.log.get_status(xid).unwrap(), XidStatus::InProgress);
        assert_eq!(store.log.get_commit_time(xid).unwrap(), CommitTime::INVALID);
    }
}

#[test]
fn test_statuses_survive_reopen() {
    let store = common::setup_store();
    let committed: Vec<TransactionId> = (3..2_000).step_by(7).map(TransactionId).collect();
    let aborted: Vec<TransactionId> = (4..2_000).step_by(7).map(TransactionId).collect();

    for (i, xid) in committed.iter().enumerate() {
        store.log.record_commit(*xid, CommitTime(1_000 + i as i64)).unwrap();
    }
    for xid in &aborted {
        store.log.record_abort(*xid).unwrap();
    }

    let store = store.reopen();
    for (i, xid) in committed.iter().enumerate() {
        assert!(store.log.did_commit(*xid).unwrap(), "{} lost its commit", xid);
        assert_eq!(store.log.get_commit_time(*xid).unwrap(), CommitTime(1_000 + i as i64));
    }
    for xid in &aborted {
        assert!(store.log.did_abort(*xid).unwrap());
        assert_eq!(store.log.get_commit_time(*xid).unwrap(), CommitTime::INVALID);
    }
    assert!(store.log.is_in_progress(TransactionId(5)).unwrap());
}

#[test]
fn test_writes_are_durable_without_checkpoint() {
    let store = common::setup_store();
    store.log.set_status(TransactionId(5000), RecordedStatus::Committed).unwrap();

    // A second store on the same directory reads straight from disk.
    let other = TransactionLog::open(store.config.clone()).unwrap();
    assert_eq!(other.get_status(TransactionId(5000)).unwrap(), XidStatus::Committed);
}

#[test]
fn test_neighbours_are_untouched() {
    let store = common::setup_store();
    let xid = TransactionId(5000);
    store.log.set_status(xid, RecordedStatus::Aborted).unwrap();
    for raw in [4997, 4998, 4999, 5001, 5002, 5003] {
        assert_eq!(store.log.get_status(TransactionId(raw)).unwrap(), XidStatus::InProgress);
    }
    assert_eq!(store.log.get_status(xid).unwrap(), XidStatus::Aborted);
}

#[test]
fn test_status_block_edges() {
    let store = common::setup_store();
    let geometry = *store.log.geometry();
    // 4096 statuses per 1024-byte block.
    for raw in [4095u32, 4096, 8191, 8192] {
        let xid = TransactionId(raw);
        let addr = geometry.locate(StoreKind::Status, xid);
        assert_eq!(addr.block, raw / 4096);
        assert_eq!(addr.index, raw % 4096);
        store.log.set_status(xid, RecordedStatus::Committed).unwrap();
    }
    assert_eq!(store.log.relation(StoreKind::Status).nblocks(), 3);
    for raw in [4094u32, 4097, 8190, 8193] {
        assert!(store.log.is_in_progress(TransactionId(raw)).unwrap());
    }
}

#[test]
fn test_small_cache_evicts_and_rereads() {
    let store = common::setup_store_with(|config| config.with_buffer_capacity(2));
    // One transaction in each of six status blocks.
    let xids: Vec<TransactionId> = (0..6).map(|b| TransactionId(b * 4096 + 10)).collect();
    for xid in &xids {
        store.log.set_status(*xid, RecordedStatus::Committed).unwrap();
    }
    for xid in &xids {
        assert!(store.log.did_commit(*xid).unwrap());
    }
    let stats = store.log.buffers().stats();
    assert!(stats.evictions > 0);
    assert!(store.log.buffers().resident_count() <= 2);
}

#[test]
fn test_read_failure_propagates_and_store_recovers() {
    let store = common::setup_store_with(|config| config.with_buffer_capacity(1));
    store.log.set_status(TransactionId(10), RecordedStatus::Committed).unwrap();
    // Evict block 0 so the next read goes to disk.
    store.log.set_status(TransactionId(5000), RecordedStatus::Committed).unwrap();

    failpoint::enable(failpoint::STORAGE_READ);
    let err = store.log.get_status(TransactionId(10)).unwrap_err();
    failpoint::clear();
    assert!(err.is_storage_failure());
    assert!(matches!(err, XidLogError::Io { block: 0, .. }));

    assert!(store.log.did_commit(TransactionId(10)).unwrap());
}

#[test]
fn test_extension_failure_propagates() {
    let store = common::setup_store();
    failpoint::enable(failpoint::STORAGE_EXTEND);
    let err = store.log.extend(TransactionId::FIRST_NORMAL).unwrap_err();
    failpoint::clear();
    assert!(matches!(err, XidLogError::Io { .. }));
    assert_eq!(store.log.relation(StoreKind::Status).nblocks(), 0);

    store.log.extend(TransactionId::FIRST_NORMAL).unwrap();
    assert_eq!(store.log.relation(StoreKind::Status).nblocks(), 1);
}

#[test]
fn test_truncate_then_reopen_keeps_horizon() {
    let store = common::setup_store();
    for raw in [3u32, 9_000, 17_000, 21_000] {
        store.log.record_commit(TransactionId(raw), CommitTime(raw as i64)).unwrap();
    }

    let summary = store.log.truncate(TransactionId(17_000)).unwrap();
    assert_eq!(summary.status_segments, vec![0, 1]);
    assert!(!summary.time_segments.is_empty());
    assert!(summary.horizon <= TransactionId(17_000));

    let store = store.reopen();
    assert_eq!(store.log.horizon(), summary.horizon);
    assert!(matches!(
        store.log.get_status(TransactionId(3)),
        Err(XidLogError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.log.set_status(TransactionId(9_000), RecordedStatus::Aborted),
        Err(XidLogError::InvalidArgument(_))
    ));
    assert!(store.log.did_commit(TransactionId(17_000)).unwrap());
    assert_eq!(store.log.get_commit_time(TransactionId(21_000)).unwrap(), CommitTime(21_000));
}

#[test]
fn test_reopen_with_other_geometry_fails() {
    let store = common::setup_store();
    store.log.set_status(TransactionId(3), RecordedStatus::Committed).unwrap();
    let config = store.config.clone().with_block_size(2048);
    match TransactionLog::open(config) {
        Err(XidLogError::Configuration(msg)) => assert!(msg.contains("1024"), "{}", msg),
        other => panic!("expected configuration error, got {:?}", other.err()),
    }
}

#[test]
fn test_stores_can_share_cache_and_locks() {
    let dirs = [tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap()];
    let buffers = Arc::new(BufferCache::new(4, 1024).unwrap());
    let locks = Arc::new(LockManager::new());
    let open = |dir: &tempfile::TempDir| {
        let config: StoreConfig = common::small_config(dir.path());
        TransactionLog::open_with(config, Arc::clone(&buffers), Arc::clone(&locks)).unwrap()
    };
    let first = open(&dirs[0]);
    let second = open(&dirs[1]);

    first.record_abort(TransactionId(100)).unwrap();
    second.set_status(TransactionId(100), RecordedStatus::Committed).unwrap();
    assert!(first.did_abort(TransactionId(100)).unwrap());
    assert!(second.did_commit(TransactionId(100)).unwrap());
    assert_eq!(buffers.resident_count(), 2);
    assert_eq!(locks.tracked_relations(), 4);

    // Closing one store hands its frames and lock entries back.
    first.close().unwrap();
    assert_eq!(buffers.resident_count(), 1);
    assert_eq!(locks.tracked_relations(), 2);
    assert!(second.did_commit(TransactionId(100)).unwrap());
    drop(second);
    assert_eq!(buffers.resident_count(), 0);
    assert_eq!(locks.tracked_relations(), 0);
}
