//! Error and Result types for bucket unpacking.

use thiserror::Error;

/// A convenience `Result` type for unpacker operations.
pub type Result<T> = std::result::Result<T, UnpackError>;

/// Coarse classification of an [`UnpackError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The bucket lacks a usable structure.
    MalformedBucket,
    /// The bucket carries metadata the spec has no field for.
    MetadataMismatch,
    /// The bucket's metadata holds a forbidden value kind.
    InvalidMetadataValue,
    /// The caller broke an operation's precondition.
    PreconditionViolation,
    /// A serialized size does not correspond to a whole number of entries.
    CorruptSizeEncoding,
}

/// The error type for unpacker operations.
///
/// Every variant carries a stable numeric [`code`](UnpackError::code).
#[derive(Debug, Error)]
pub enum UnpackError {
    /// The bucket document has no fields at all.
    #[error("Bucket is empty")]
    EmptyBucket,

    /// The bucket is missing a required region or has one of the wrong shape.
    #[error("Malformed bucket: {0}")]
    MalformedBucket(String),

    /// `control.version` names an encoding this crate cannot read.
    #[error("Unsupported bucket version: {0}")]
    UnsupportedVersion(i64),

    /// A compressed column could not be decoded.
    #[error("Corrupt column '{field}': {reason}")]
    CorruptColumn {
        /// Name of the offending column.
        field: String,
        /// What went wrong.
        reason: String,
    },

    /// A compressed column's checksum does not match its contents.
    #[error("Checksum mismatch in column '{field}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Name of the offending column.
        field: String,
        /// CRC32 stored in the column block.
        expected: u32,
        /// CRC32 computed over the column block.
        actual: u32,
    },

    /// The bucket's `meta` value is the deprecated `undefined` type.
    #[error("Bucket metadata must be absent or a defined value, got undefined")]
    InvalidMetadata,

    /// The bucket has a `meta` value but no metadata field name is configured.
    #[error("Bucket has metadata but no metaField is configured")]
    UnexpectedMetadata,

    /// An operation that needs a loaded bucket was called before `reset`.
    #[error("No bucket is loaded")]
    NotLoaded,

    /// `get_next` was called after the last measurement.
    #[error("No more measurements in bucket")]
    Exhausted,

    /// `extract_single_measurement` was given an index outside the row domain.
    #[error("Row index {0} is not in the bucket's row domain")]
    RowNotInDomain(u32),

    /// A time column size that no whole number of entries can produce.
    #[error("Time column size {size} does not encode a whole number of measurements")]
    CorruptSizeEncoding {
        /// Serialized size of the time column in bytes.
        size: usize,
    },
}

impl UnpackError {
    /// Returns the stable numeric code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Self::EmptyBucket => 5346510,
            Self::MalformedBucket(_) => 5346511,
            Self::UnsupportedVersion(_) => 5346512,
            Self::CorruptColumn { .. } => 5346513,
            Self::ChecksumMismatch { .. } => 5346514,
            Self::InvalidMetadata => 5369600,
            Self::UnexpectedMetadata => 5369601,
            Self::NotLoaded => 5422700,
            Self::Exhausted => 5422701,
            Self::RowNotInDomain(_) => 5422702,
            Self::CorruptSizeEncoding { .. } => 5422703,
        }
    }

    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyBucket
            | Self::MalformedBucket(_)
            | Self::UnsupportedVersion(_)
            | Self::CorruptColumn { .. }
            | Self::ChecksumMismatch { .. } => ErrorKind::MalformedBucket,
            Self::InvalidMetadata => ErrorKind::InvalidMetadataValue,
            Self::UnexpectedMetadata => ErrorKind::MetadataMismatch,
            Self::NotLoaded | Self::Exhausted | Self::RowNotInDomain(_) => {
                ErrorKind::PreconditionViolation
            }
            Self::CorruptSizeEncoding { .. } => ErrorKind::CorruptSizeEncoding,
        }
    }

    pub(crate) fn corrupt_column(field: &str, reason: impl Into<String>) -> Self {
        Self::CorruptColumn {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
