//! The control file pins a store's geometry at creation time.
//!
//! Layout (little-endian): magic `u32`, format version `u32`, block size
//! `u32`, blocks per segment `u32`, CRC-32 of the preceding 16 bytes `u32`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::info;

use crate::error::{Result, XidLogError};

pub const CONTROL_FILE_NAME: &str = "xidlog.control";
const MAGIC: u32 = 0x5849_444C; // "XIDL"
const FORMAT_VERSION: u32 = 1;
const BODY_LEN: usize = 16;
const FILE_LEN: usize = BODY_LEN + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlData {
    pub version: u32,
    pub block_size: u32,
    pub blocks_per_segment: u32,
}

impl ControlData {
    pub fn new(block_size: usize, blocks_per_segment: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            block_size: block_size as u32,
            blocks_per_segment,
        }
    }

    fn encode(&self) -> [u8; FILE_LEN] {
        let mut buf = [0u8; FILE_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.blocks_per_segment.to_le_bytes());
        let crc = checksum(&buf[..BODY_LEN]);
        buf[BODY_LEN..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() != FILE_LEN {
            return Err(format!("expected {} bytes, found {}", FILE_LEN, buf.len()));
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        if word(0) != MAGIC {
            return Err("bad magic number".to_string());
        }
        if word(BODY_LEN) != checksum(&buf[..BODY_LEN]) {
            return Err("checksum mismatch".to_string());
        }
        Ok(Self {
            version: word(4),
            block_size: word(8),
            blocks_per_segment: word(12),
        })
    }
}

fn checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

pub fn control_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONTROL_FILE_NAME)
}

pub fn read(data_dir: &Path) -> Result<Option<ControlData>> {
    let path = control_path(data_dir);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(XidLogError::io(CONTROL_FILE_NAME, 0, e)),
    };
    ControlData::decode(&bytes)
        .map(Some)
        .map_err(|why| XidLogError::Configuration(format!("{}: {}", path.display(), why)))
}

pub fn write(data_dir: &Path, data: &ControlData) -> Result<()> {
    let path = control_path(data_dir);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| XidLogError::io(CONTROL_FILE_NAME, 0, e))?;
    file.write_all(&data.encode())
        .and_then(|_| file.sync_all())
        .map_err(|e| XidLogError::io(CONTROL_FILE_NAME, 0, e))
}

/// Reads the control file, creating it on first use, and checks that the
/// requested geometry matches the one the store was created with.
pub fn ensure(data_dir: &Path, wanted: &ControlData) -> Result<ControlData> {
    match read(data_dir)? {
        None => {
            write(data_dir, wanted)?;
            info!(
                dir = %data_dir.display(),
                block_size = wanted.block_size,
                blocks_per_segment = wanted.blocks_per_segment,
                "initialized control file"
            );
            Ok(*wanted)
        }
        Some(found) if found == *wanted => Ok(found),
        Some(found) => Err(XidLogError::Configuration(format!(
            "store was created with block size {} and {} blocks per segment (format {}), \
             but opened with block size {} and {} blocks per segment",
            found.block_size, found.blocks_per_segment, found.version, wanted.block_size, wanted.blocks_per_segment
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_creates_then_matches() {
        let temp_dir = tempdir().unwrap();
        let wanted = ControlData::new(8192, 32);
        assert_eq!(ensure(temp_dir.path(), &wanted).unwrap(), wanted);
        assert_eq!(read(temp_dir.path()).unwrap(), Some(wanted));
        assert_eq!(ensure(temp_dir.path(), &wanted).unwrap(), wanted);
    }

    #[test]
    fn test_geometry_mismatch_is_configuration_error() {
        let temp_dir = tempdir().unwrap();
        ensure(temp_dir.path(), &ControlData::new(8192, 32)).unwrap();
        let err = ensure(temp_dir.path(), &ControlData::new(1024, 32)).unwrap_err();
        assert!(matches!(err, XidLogError::Configuration(_)));
    }

    #[test]
    fn test_corrupt_control_file_detected() {
        let temp_dir = tempdir().unwrap();
        write(temp_dir.path(), &ControlData::new(8192, 32)).unwrap();

        let path = control_path(temp_dir.path());
        let mut bytes = fs::read(&path).unwrap();
        bytes[9] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = read(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }
}
