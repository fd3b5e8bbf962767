//! Values recorded per transaction: the commit outcome and the commit time.

use std::fmt;

use chrono::{DateTime, Utc};

/// Outcome of a transaction as read back from the status relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XidStatus {
    /// No block was available to read from.
    Invalid,
    InProgress,
    Committed,
    Aborted,
}

impl XidStatus {
    pub fn is_final(self) -> bool {
        matches!(self, XidStatus::Committed | XidStatus::Aborted)
    }
}

impl fmt::Display for XidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XidStatus::Invalid => "invalid",
            XidStatus::InProgress => "in progress",
            XidStatus::Committed => "committed",
            XidStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// The statuses a writer may record. `Invalid` has no bit pattern and so
/// cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordedStatus {
    InProgress,
    Committed,
    Aborted,
}

impl RecordedStatus {
    /// The two-bit pattern stored for this status.
    pub const fn bits(self) -> u8 {
        match self {
            RecordedStatus::InProgress => 0b00,
            RecordedStatus::Aborted => 0b01,
            RecordedStatus::Committed => 0b10,
        }
    }

    /// Decodes a two-bit pattern. `0b11` is never written and yields `None`.
    pub const fn from_bits(bits: u8) -> Option<RecordedStatus> {
        match bits & 0b11 {
            0b00 => Some(RecordedStatus::InProgress),
            0b01 => Some(RecordedStatus::Aborted),
            0b10 => Some(RecordedStatus::Committed),
            _ => None,
        }
    }
}

impl From<RecordedStatus> for XidStatus {
    fn from(status: RecordedStatus) -> Self {
        match status {
            RecordedStatus::InProgress => XidStatus::InProgress,
            RecordedStatus::Committed => XidStatus::Committed,
            RecordedStatus::Aborted => XidStatus::Aborted,
        }
    }
}

impl TryFrom<XidStatus> for RecordedStatus {
    type Error = XidStatus;

    fn try_from(status: XidStatus) -> Result<Self, XidStatus> {
        match status {
            XidStatus::InProgress => Ok(RecordedStatus::InProgress),
            XidStatus::Committed => Ok(RecordedStatus::Committed),
            XidStatus::Aborted => Ok(RecordedStatus::Aborted),
            XidStatus::Invalid => Err(status),
        }
    }
}

/// Commit timestamp in microseconds since the Unix epoch. Zero is the
/// "no time recorded" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitTime(pub i64);

impl CommitTime {
    pub const INVALID: CommitTime = CommitTime(0);

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_micros(micros: i64) -> Self {
        CommitTime(micros)
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        CommitTime(at.timestamp_micros())
    }

    pub fn micros(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if !self.is_valid() {
            return None;
        }
        DateTime::from_timestamp_micros(self.0)
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        CommitTime(i64::from_le_bytes(bytes))
    }
}

impl fmt::Display for CommitTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(at) => write!(f, "{}", at.to_rfc3339()),
            None => f.write_str("invalid"),
        }
    }
}
