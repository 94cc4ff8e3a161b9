//! Binary schema utilities shared by the archive format

use crate::error::Result;

/// Calculate CRC32 checksum
pub fn calculate_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate checksum
pub fn validate_checksum(data: &[u8], expected: u32) -> Result<()> {
    let computed = calculate_checksum(data);
    if computed != expected {
        return Err(crate::error::StorageError::ChecksumMismatch { expected, computed });
    }
    Ok(())
}
