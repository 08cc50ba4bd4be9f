//! Exact measurement counts for uncompressed buckets, derived from size alone.
//!
//! An uncompressed time column is a BSON sub-document whose keys are the row
//! indices `"0"`, `"1"`, ... `"n-1"` and whose values are 8-byte dates. Each
//! entry costs one type byte, the key digits, one key terminator, and eight
//! value bytes, so the column size is piecewise linear in `n` with a
//! breakpoint wherever the key gains a digit.
//!
//! ```text
//! tier  rows              bytes per entry
//! ----  ----------------  ---------------
//!    0  0 ..= 9                        11
//!    1  10 ..= 99                      12
//!    2  100 ..= 999                    13
//!  ...
//! ```

use crate::error::{Result, UnpackError};
use crate::unpacker::{BUCKET_CONTROL_FIELD, BUCKET_DATA_FIELD, CONTROL_VERSION_FIELD};
use bson::raw::RawBsonRef;
use bson::RawDocument;

/// Size of an empty BSON document: the 4-byte length and the terminator.
pub const MIN_DOCUMENT_SIZE: usize = 5;

/// Fixed per-entry overhead of a date element: type byte, key terminator and
/// the 8-byte value.
const DATE_ENTRY_OVERHEAD: usize = 10;

/// `(rows, size)` at the start of each tier, sizes excluding document framing.
///
/// Tier `i` covers rows whose largest key has `i + 1` digits.
const TIER_TABLE: [(usize, usize); 9] = [
    (0, 0),
    (10, 110),
    (100, 1_190),
    (1_000, 12_890),
    (10_000, 138_890),
    (100_000, 1_488_890),
    (1_000_000, 15_888_890),
    (10_000_000, 168_888_890),
    (100_000_000, 1_788_888_890),
];

/// Returns the number of measurements in a time column of `size` bytes.
///
/// `size` is the full serialized size of the sub-document, framing included.
///
/// # Errors
///
/// Returns `UnpackError::CorruptSizeEncoding` if no whole number of entries
/// produces `size`.
pub fn measurement_count_from_size(size: usize) -> Result<usize> {
    if size < MIN_DOCUMENT_SIZE {
        return Err(UnpackError::CorruptSizeEncoding { size });
    }
    let body = size - MIN_DOCUMENT_SIZE;

    // Last tier whose lower bound fits; the first entry is (0, 0) so this
    // always finds one.
    let tier = TIER_TABLE
        .iter()
        .rposition(|&(_, tier_size)| tier_size <= body)
        .unwrap_or(0);
    let (tier_rows, tier_size) = TIER_TABLE[tier];
    let entry_size = DATE_ENTRY_OVERHEAD + tier + 1;

    let remaining = body - tier_size;
    if remaining % entry_size != 0 {
        return Err(UnpackError::CorruptSizeEncoding { size });
    }

    Ok(tier_rows + remaining / entry_size)
}

/// Computes the number of measurements in an uncompressed bucket from the
/// serialized size of its time column.
///
/// # Errors
///
/// - `UnpackError::MalformedBucket` if `control.version`, `data`, or the time
///   column is missing or of the wrong type.
/// - `UnpackError::UnsupportedVersion` if the bucket is not version 1.
/// - `UnpackError::CorruptSizeEncoding` if the time column size is not
///   consistent with whole entries.
pub fn compute_measurement_count(bucket: &RawDocument, time_field: &str) -> Result<usize> {
    let version = raw_version(bucket)?;
    if version != 1 {
        return Err(UnpackError::UnsupportedVersion(version));
    }

    let data = bucket
        .get_document(BUCKET_DATA_FIELD)
        .map_err(|e| UnpackError::MalformedBucket(format!("bad data region: {}", e)))?;
    let time_column = data.get_document(time_field).map_err(|e| {
        UnpackError::MalformedBucket(format!("bad time column '{}': {}", time_field, e))
    })?;

    measurement_count_from_size(time_column.as_bytes().len())
}

fn raw_version(bucket: &RawDocument) -> Result<i64> {
    let control = bucket
        .get_document(BUCKET_CONTROL_FIELD)
        .map_err(|e| UnpackError::MalformedBucket(format!("bad control region: {}", e)))?;
    let version = control
        .get(CONTROL_VERSION_FIELD)
        .map_err(|e| UnpackError::MalformedBucket(format!("bad control region: {}", e)))?;

    match version {
        Some(RawBsonRef::Int32(v)) => Ok(v as i64),
        Some(RawBsonRef::Int64(v)) => Ok(v),
        Some(other) => Err(UnpackError::MalformedBucket(format!(
            "control.version must be an integer, got {:?}",
            other.element_type()
        ))),
        None => Err(UnpackError::MalformedBucket(
            "control.version is missing".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Size of a time column with `n` date entries keyed "0".."n-1".
    fn expected_size(n: usize) -> usize {
        MIN_DOCUMENT_SIZE
            + (0..n)
                .map(|i| DATE_ENTRY_OVERHEAD + i.to_string().len())
                .sum::<usize>()
    }

    #[test]
    fn test_table_matches_entry_sizes() {
        for &(rows, size) in TIER_TABLE.iter().take(6) {
            assert_eq!(expected_size(rows) - MIN_DOCUMENT_SIZE, size);
        }
    }

    #[test]
    fn test_table_is_continuous() {
        for window in TIER_TABLE.windows(2) {
            let (lo_rows, lo_size) = window[0];
            let (hi_rows, hi_size) = window[1];
            let digits = lo_rows.max(1).to_string().len();
            assert_eq!(
                lo_size + (hi_rows - lo_rows) * (DATE_ENTRY_OVERHEAD + digits),
                hi_size
            );
        }
    }

    #[test]
    fn test_empty_column() {
        assert_eq!(measurement_count_from_size(MIN_DOCUMENT_SIZE).unwrap(), 0);
    }

    #[test]
    fn test_dense_small_counts() {
        for n in 0..2_500 {
            assert_eq!(
                measurement_count_from_size(expected_size(n)).unwrap(),
                n,
                "count mismatch for {} rows",
                n
            );
        }
    }

    #[test]
    fn test_tier_boundaries() {
        for &(rows, size) in &TIER_TABLE {
            assert_eq!(
                measurement_count_from_size(size + MIN_DOCUMENT_SIZE).unwrap(),
                rows
            );
            if rows > 0 {
                let last_key_digits = (rows - 1).to_string().len();
                let below = size + MIN_DOCUMENT_SIZE - (DATE_ENTRY_OVERHEAD + last_key_digits);
                assert_eq!(measurement_count_from_size(below).unwrap(), rows - 1);
            }
        }
    }

    #[test]
    fn test_misaligned_size_is_corrupt() {
        for size in [0, 4, 6, 15, 115 + 1, 1_195 + 7] {
            assert!(matches!(
                measurement_count_from_size(size),
                Err(UnpackError::CorruptSizeEncoding { size: s }) if s == size
            ));
        }
    }

    #[test]
    fn test_beyond_last_tier() {
        let (rows, size) = TIER_TABLE[TIER_TABLE.len() - 1];
        let entry = DATE_ENTRY_OVERHEAD + TIER_TABLE.len();
        assert_eq!(
            measurement_count_from_size(size + MIN_DOCUMENT_SIZE + 3 * entry).unwrap(),
            rows + 3
        );
    }
}
