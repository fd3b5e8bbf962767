//! Transaction identifiers.

use std::fmt;

/// A 32-bit, monotonically assigned transaction id. Ids are never reused.
///
/// The first three values are reserved: `0` is invalid, and `1` (bootstrap)
/// and `2` (frozen) are permanent ids that always count as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionId(pub u32);

impl TransactionId {
    pub const INVALID: TransactionId = TransactionId(0);
    pub const BOOTSTRAP: TransactionId = TransactionId(1);
    pub const FROZEN: TransactionId = TransactionId(2);
    pub const FIRST_NORMAL: TransactionId = TransactionId(3);

    pub fn new(raw: u32) -> Self {
        TransactionId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn is_normal(self) -> bool {
        self >= Self::FIRST_NORMAL
    }

    /// Bootstrap and frozen ids are never looked up in storage.
    pub fn is_permanent(self) -> bool {
        self.is_valid() && !self.is_normal()
    }

    /// The following id, or `None` once the id space is exhausted.
    pub fn next(self) -> Option<TransactionId> {
        self.0.checked_add(1).map(TransactionId)
    }
}

impl From<u32> for TransactionId {
    fn from(raw: u32) -> Self {
        TransactionId(raw)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
