//! The in-memory image of one fixed-size block.

/// A block is a fixed-size run of bytes read from and written to a relation.
/// Freshly created blocks are zero-filled, which for the status relation
/// means "every transaction in progress".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    data: Box<[u8]>,
}

impl Block {
    pub fn zeroed(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}
