//! Seam toward the block storage backend.

use thiserror::Error;

/// Failures reported by the storage backend. The engine converts these
/// to MEDIUM ERROR sense data; it never retries.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    #[error("unrecovered read error at sector {0}")]
    Read(u32),
    #[error("write error at sector {0}")]
    Write(u32),
    #[error("capacity query failed")]
    Capacity,
}

/// Sector-addressed storage behind the logical unit.
///
/// `read` fills `buf` with `num_sectors` sectors starting at `lba`;
/// `write` consumes it. The engine guarantees `buf.len()` is exactly
/// `num_sectors * block_size` and that calls for a single command are
/// issued in ascending LBA order.
pub trait StorageBackend {
    fn read(&mut self, lba: u32, num_sectors: u32, buf: &mut [u8]) -> Result<(), BackendError>;

    fn write(&mut self, lba: u32, num_sectors: u32, buf: &[u8]) -> Result<(), BackendError>;

    /// Total number of addressable blocks.
    fn capacity(&mut self) -> Result<u32, BackendError>;

    /// Block size in bytes (512 and 4096 are the common cases).
    fn block_size(&mut self) -> Result<u32, BackendError>;

    /// Medium present and spun up. TEST UNIT READY fails while false.
    fn is_ready(&self) -> bool {
        true
    }

    /// Reported through the MODE SENSE device-specific WP bit.
    fn write_protected(&self) -> bool {
        false
    }
}
