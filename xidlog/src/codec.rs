//! Packing of statuses and commit times inside a block.
//!
//! Status entries are two bits wide. Entry `i` lives in byte `i / 4` at bit
//! shift `(i % 4) * 2`; within the field `0b10` is committed, `0b01` aborted
//! and `0b00` in progress. Commit times are little-endian `i64` slots.

use crate::address::{Geometry, StoreKind, COMMIT_TIME_WIDTH, STATUS_BITS_PER_XACT, STATUS_XACTS_PER_BYTE};
use crate::block::Block;
use crate::error::{Result, XidLogError};
use crate::status::{CommitTime, RecordedStatus, XidStatus};
use crate::xid::TransactionId;

const STATUS_MASK: u8 = (1 << STATUS_BITS_PER_XACT) - 1;

/// A bounds-checked array of two-bit fields over a byte buffer.
pub struct StatusBits<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> StatusBits<B> {
    pub fn new(bytes: B) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> u32 {
        self.bytes.as_ref().len() as u32 * STATUS_XACTS_PER_BYTE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.as_ref().is_empty()
    }

    fn position(index: u32) -> (usize, u32) {
        let byte = (index / STATUS_XACTS_PER_BYTE) as usize;
        let shift = (index % STATUS_XACTS_PER_BYTE) * STATUS_BITS_PER_XACT;
        (byte, shift)
    }

    /// Raw two-bit pattern at `index`.
    pub fn get(&self, index: u32) -> Option<u8> {
        let (byte, shift) = Self::position(index);
        let value = *self.bytes.as_ref().get(byte)?;
        Some((value >> shift) & STATUS_MASK)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> StatusBits<B> {
    /// Overwrites the field at `index`, leaving its neighbours untouched.
    pub fn set(&mut self, index: u32, bits: u8) -> Option<()> {
        let (byte, shift) = Self::position(index);
        let slot = self.bytes.as_mut().get_mut(byte)?;
        *slot = (*slot & !(STATUS_MASK << shift)) | ((bits & STATUS_MASK) << shift);
        Some(())
    }
}

/// A bounds-checked array of commit-time slots over a byte buffer.
pub struct TimeSlots<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> TimeSlots<B> {
    pub fn new(bytes: B) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> u32 {
        self.bytes.as_ref().len() as u32 / COMMIT_TIME_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(index: u32) -> std::ops::Range<usize> {
        let start = (index * COMMIT_TIME_WIDTH) as usize;
        start..start + COMMIT_TIME_WIDTH as usize
    }

    pub fn get(&self, index: u32) -> Option<CommitTime> {
        let slot = self.bytes.as_ref().get(Self::range(index))?;
        let raw: [u8; 8] = slot.try_into().ok()?;
        Some(CommitTime::from_le_bytes(raw))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TimeSlots<B> {
    pub fn set(&mut self, index: u32, time: CommitTime) -> Option<()> {
        let slot = self.bytes.as_mut().get_mut(Self::range(index))?;
        slot.copy_from_slice(&time.to_le_bytes());
        Some(())
    }
}

fn out_of_range(kind: StoreKind, xid: TransactionId, block_len: usize) -> XidLogError {
    XidLogError::InvalidArgument(format!(
        "{} entry for transaction {} does not fit a {}-byte block",
        kind.relation_name(),
        xid,
        block_len
    ))
}

/// Reads the status of `xid` from its status block. A missing block reads
/// as [`XidStatus::Invalid`].
pub fn get_xid_status(block: Option<&Block>, geometry: &Geometry, xid: TransactionId) -> Result<XidStatus> {
    let Some(block) = block else {
        return Ok(XidStatus::Invalid);
    };
    let addr = geometry.locate(StoreKind::Status, xid);
    let bits = StatusBits::new(block.as_bytes())
        .get(addr.index)
        .ok_or_else(|| out_of_range(StoreKind::Status, xid, block.len()))?;
    match RecordedStatus::from_bits(bits) {
        Some(status) => Ok(status.into()),
        None => Err(XidLogError::CorruptData {
            xid,
            block: addr.block,
            pattern: bits,
        }),
    }
}

/// Records the status of `xid` in its status block. A missing block is a
/// no-op.
pub fn set_xid_status(
    block: Option<&mut Block>,
    geometry: &Geometry,
    xid: TransactionId,
    status: RecordedStatus,
) -> Result<()> {
    let Some(block) = block else {
        return Ok(());
    };
    let addr = geometry.locate(StoreKind::Status, xid);
    let len = block.len();
    StatusBits::new(block.as_bytes_mut())
        .set(addr.index, status.bits())
        .ok_or_else(|| out_of_range(StoreKind::Status, xid, len))
}

/// Reads the commit time of `xid`. A missing block reads as
/// [`CommitTime::INVALID`].
pub fn get_commit_time(block: Option<&Block>, geometry: &Geometry, xid: TransactionId) -> Result<CommitTime> {
    let Some(block) = block else {
        return Ok(CommitTime::INVALID);
    };
    let addr = geometry.locate(StoreKind::Time, xid);
    TimeSlots::new(block.as_bytes())
        .get(addr.index)
        .ok_or_else(|| out_of_range(StoreKind::Time, xid, block.len()))
}

pub fn set_commit_time(
    block: Option<&mut Block>,
    geometry: &Geometry,
    xid: TransactionId,
    time: CommitTime,
) -> Result<()> {
    let Some(block) = block else {
        return Ok(());
    };
    let addr = geometry.locate(StoreKind::Time, xid);
    let len = block.len();
    TimeSlots::new(block.as_bytes_mut())
        .set(addr.index, time)
        .ok_or_else(|| out_of_range(StoreKind::Time, xid, len))
}
