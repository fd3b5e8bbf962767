//! Segmented block files backing a relation.
//!
//! A relation's blocks are split across segment files of
//! `blocks_per_segment` blocks each, named with four hex digits (`0000`,
//! `0001`, ...). Block `b` lives in segment `b / blocks_per_segment` at byte
//! offset `(b % blocks_per_segment) * block_size`.
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::failpoint;
use crate::BlockNumber;

pub struct SegmentedFile {
    dir: PathBuf,
    block_size: usize,
    blocks_per_segment: u32,
    open_segments: HashMap<u32, File>,
    /// One past the highest block present on disk.
    nblocks: BlockNumber,
    /// Lowest block not yet truncated away.
    first_block: BlockNumber,
}

pub fn segment_file_name(segno: u32) -> String {
    format!("{:04X}", segno)
}

fn parse_segment_name(name: &str) -> Option<u32> {
    if name.len() < 4 || !name.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase()) {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

impl SegmentedFile {
    /// Opens the segment directory, creating it if it doesn't exist, and
    /// works out the relation's extent from the segments present.
    pub fn open<P: AsRef<Path>>(dir: P, block_size: usize, blocks_per_segment: u32) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let (first_block, nblocks) = match (segments.first(), segments.last()) {
            (Some(&first), Some(&last)) => {
                let len = fs::metadata(dir.join(segment_file_name(last)))?.len();
                let blocks_in_last = len.div_ceil(block_size as u64) as u32;
                (first * blocks_per_segment, last * blocks_per_segment + blocks_in_last)
            }
            _ => (0, 0),
        };
        debug!(
            dir = %dir.display(),
            segments = segments.len(),
            first_block,
            nblocks,
            "opened segmented file"
        );

        Ok(Self {
            dir,
            block_size,
            blocks_per_segment,
            open_segments: HashMap::new(),
            nblocks,
            first_block,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn nblocks(&self) -> BlockNumber {
        self.nblocks
    }

    pub fn first_block(&self) -> BlockNumber {
        self.first_block
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn locate(&self, block: BlockNumber) -> (u32, u64) {
        let segno = block / self.blocks_per_segment;
        let offset = (block % self.blocks_per_segment) as u64 * self.block_size as u64;
        (segno, offset)
    }

    fn segment(&mut self, segno: u32, create: bool) -> io::Result<&mut File> {
        if !self.open_segments.contains_key(&segno) {
            let path = self.dir.join(segment_file_name(segno));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .truncate(false)
                .open(&path)?;
            self.open_segments.insert(segno, file);
        }
        self.open_segments
            .get_mut(&segno)
            .ok_or_else(|| io::Error::other(format!("segment {} not open", segno)))
    }

    /// Reads a block into `buf`. Blocks past the end of the relation, and
    /// the unwritten tail of a short segment, read as zeros.
    pub fn read_block(&mut self, block: BlockNumber, buf: &mut [u8]) -> io::Result<()> {
        failpoint::maybe_fail(failpoint::STORAGE_READ)?;
        if block < self.first_block {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("block {} precedes the truncation point {}", block, self.first_block),
            ));
        }
        if block >= self.nblocks {
            buf.fill(0);
            return Ok(());
        }

        let (segno, offset) = self.locate(block);
        let file = self.segment(segno, false)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < buf.len() {
            debug!(block, filled, "short read, zeroing rest of block");
            buf[filled..].fill(0);
        }
        Ok(())
    }

    /// Writes a block and syncs it to disk before returning.
    pub fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> io::Result<()> {
        failpoint::maybe_fail(failpoint::STORAGE_WRITE)?;
        if data.len() != self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block image is {} bytes, expected {}", data.len(), self.block_size),
            ));
        }
        if block > self.nblocks {
            // Keep segments contiguous: no holes below a written block.
            self.extend_to(block - 1)?;
        }
        let (segno, offset) = self.locate(block);
        let file = self.segment(segno, true)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        if block >= self.nblocks {
            self.nblocks = block + 1;
        }
        debug!(block, segno, "wrote block");
        Ok(())
    }

    /// Zero-fills every block from the current end up to and including
    /// `block`.
    pub fn extend_to(&mut self, block: BlockNumber) -> io::Result<()> {
        if block < self.nblocks {
            return Ok(());
        }
        failpoint::maybe_fail(failpoint::STORAGE_EXTEND)?;

        let zeros = vec![0u8; self.block_size];
        let mut touched = BTreeSet::new();
        for b in self.nblocks..=block {
            let (segno, offset) = self.locate(b);
            let file = self.segment(segno, true)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&zeros)?;
            touched.insert(segno);
        }
        for segno in touched {
            self.segment(segno, false)?.sync_data()?;
        }
        debug!(from = self.nblocks, to = block, "extended relation");
        self.nblocks = block + 1;
        Ok(())
    }

    /// Deletes every segment lying wholly before the segment that holds
    /// `cutoff`. Returns the removed segment numbers.
    pub fn remove_segments_before(&mut self, cutoff: BlockNumber) -> io::Result<Vec<u32>> {
        let cutoff_segment = cutoff / self.blocks_per_segment;
        let mut removed = Vec::new();
        for segno in list_segments(&self.dir)? {
            if segno >= cutoff_segment {
                continue;
            }
            self.open_segments.remove(&segno);
            fs::remove_file(self.dir.join(segment_file_name(segno)))?;
            removed.push(segno);
        }
        let horizon = cutoff_segment * self.blocks_per_segment;
        if horizon > self.first_block {
            self.first_block = horizon;
        }
        if !removed.is_empty() {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(removed)
    }
}

fn list_segments(dir: &Path) -> io::Result<Vec<u32>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(segno) = entry.file_name().to_str().and_then(parse_segment_name) {
            segments.push(segno);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}
