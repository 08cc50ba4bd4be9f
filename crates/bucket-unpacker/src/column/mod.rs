//! Column sources for bucket data.
//!
//! A bucket stores each field as one sparse column. Uncompressed (version 1)
//! buckets hold a sub-document keyed by decimal row index; compressed
//! (version 2) buckets hold an opaque binary blob that a [`ColumnDecoder`]
//! turns into an ascending sequence of `(row, value)` pairs. Both end up as a
//! [`ColumnSource`] so the unpacker can look up a row without caring which
//! encoding the bucket used.

pub mod codec;
pub mod gorilla;

pub use codec::{
    compress_bucket, ColumnBlock, ColumnBuilder, ColumnCodec, ColumnCodecConfig, ValueEncoding,
};

use crate::error::{Result, UnpackError};
use bson::{Bson, Document};

/// Lazy, ascending `(row, value)` sequence produced by a [`ColumnDecoder`].
pub type ColumnIter<'a> = Box<dyn Iterator<Item = Result<(u32, Bson)>> + 'a>;

/// Decodes compressed column blobs.
///
/// Implementations must yield entries in strictly ascending row order.
pub trait ColumnDecoder {
    /// Starts decoding `blob`, the compressed column stored for `field`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob header cannot be read. Errors found
    /// further into the stream are yielded by the iterator.
    fn decode<'a>(&self, field: &'a str, blob: &'a [u8]) -> Result<ColumnIter<'a>>;
}

/// Parses a canonical decimal row key (`"0"`, `"17"`; not `"017"` or `"+1"`).
pub(crate) fn parse_row_key(key: &str) -> Option<u32> {
    let canonical = !key.is_empty()
        && key.bytes().all(|b| b.is_ascii_digit())
        && (key == "0" || !key.starts_with('0'));
    if !canonical {
        return None;
    }
    key.parse().ok()
}

/// One column of a loaded bucket, bound once per reset.
#[derive(Debug, Clone)]
pub(crate) enum ColumnSource {
    /// Sub-document keyed by canonical row index, with its parsed rows.
    Uncompressed { values: Document, rows: Vec<u32> },
    /// Entries decoded from a compressed column, strictly ascending by row.
    Decoded(Vec<(u32, Bson)>),
}

impl ColumnSource {
    /// Binds an uncompressed column, validating every row key.
    pub(crate) fn uncompressed(field: &str, values: Document) -> Result<Self> {
        let mut rows = Vec::with_capacity(values.len());
        for key in values.keys() {
            let row = parse_row_key(key).ok_or_else(|| {
                UnpackError::MalformedBucket(format!(
                    "column '{}' has invalid row key '{}'",
                    field, key
                ))
            })?;
            rows.push(row);
        }
        rows.sort_unstable();
        rows.dedup();

        Ok(Self::Uncompressed { values, rows })
    }

    /// Drains a decoder's output into a lookup source.
    pub(crate) fn decoded(field: &str, entries: ColumnIter<'_>) -> Result<Self> {
        let mut decoded: Vec<(u32, Bson)> = Vec::new();
        for entry in entries {
            let (row, value) = entry?;
            if let Some(&(prev, _)) = decoded.last() {
                if row <= prev {
                    return Err(UnpackError::corrupt_column(
                        field,
                        format!("row {} follows row {}", row, prev),
                    ));
                }
            }
            decoded.push((row, value));
        }

        Ok(Self::Decoded(decoded))
    }

    /// Returns the value at `row`, whose canonical key is `key`.
    pub(crate) fn get(&self, row: u32, key: &str) -> Option<&Bson> {
        match self {
            Self::Uncompressed { values, .. } => values.get(key),
            Self::Decoded(entries) => entries
                .binary_search_by_key(&row, |&(r, _)| r)
                .ok()
                .map(|idx| &entries[idx].1),
        }
    }

    /// Returns the distinct rows present in this column, ascending.
    pub(crate) fn rows(&self) -> Vec<u32> {
        match self {
            Self::Uncompressed { rows, .. } => rows.clone(),
            Self::Decoded(entries) => entries.iter().map(|&(row, _)| row).collect(),
        }
    }
}
