/*!
 * Range partitioning for multipart transfers
 *
 * Splits a byte span into ordered, 1-indexed parts. The last part carries the
 * remainder; part sizes are never rounded or aligned.
 */

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Smallest part size accepted for multipart uploads (100 KiB)
pub const MIN_PART_SIZE: u64 = 100 * 1024;

/// Largest part size accepted by the service (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Highest part number the service accepts
pub const MAX_PART_COUNT: u32 = 10_000;

/// One contiguous byte range of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTask {
    /// Part number (1-indexed)
    pub part_number: u32,

    /// Offset of the part relative to the start of the transfer span
    pub offset: u64,

    /// Length of the part in bytes
    pub length: u64,
}

impl PartTask {
    /// Offset one past the last byte of this part
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Number of parts needed to cover `total_size`
pub fn part_count(total_size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total_size.div_ceil(part_size)
}

/// Split `total_size` bytes into parts of `part_size`
///
/// Returns an empty list for an empty span. Fails with `ValidateError` when
/// `part_size` is zero or the split would exceed [`MAX_PART_COUNT`] parts.
pub fn partition(total_size: u64, part_size: u64) -> Result<Vec<PartTask>> {
    if part_size == 0 {
        return Err(VaultError::Validate("part size must be positive".to_string()));
    }

    let count = part_count(total_size, part_size);
    if count > MAX_PART_COUNT as u64 {
        return Err(VaultError::Validate(format!(
            "{} bytes at part size {} needs {} parts, more than the {} allowed",
            total_size, part_size, count, MAX_PART_COUNT
        )));
    }

    let parts = (0..count)
        .map(|index| {
            let offset = index * part_size;
            PartTask {
                part_number: index as u32 + 1,
                offset,
                length: part_size.min(total_size - offset),
            }
        })
        .collect();

    Ok(parts)
}

/// Check an upload part size against the service limits
pub fn validate_upload_part_size(part_size: u64) -> Result<()> {
    if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&part_size) {
        return Err(VaultError::Validate(format!(
            "part size {} outside [{}, {}]",
            part_size, MIN_PART_SIZE, MAX_PART_SIZE
        )));
    }
    Ok(())
}

/// Check a part number against the service limits
pub fn validate_part_number(part_number: u32) -> Result<()> {
    if part_number == 0 || part_number > MAX_PART_COUNT {
        return Err(VaultError::Validate(format!(
            "part number {} outside [1, {}]",
            part_number, MAX_PART_COUNT
        )));
    }
    Ok(())
}
