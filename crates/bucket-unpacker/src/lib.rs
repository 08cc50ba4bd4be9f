//! Bucket Unpacker - Time-series bucket decoding
//!
//! This crate turns columnar time-series buckets back into the individual
//! measurement documents they were built from.
//!
//! # Components
//!
//! - [`BucketUnpacker`]: Reset/iterate/extract over one bucket at a time
//! - [`BucketSpec`] / [`Behavior`]: Field projection rules
//! - [`compute_measurement_count`]: Row count of an uncompressed bucket from size alone
//! - [`ColumnCodec`]: Compressed (version 2) column format, with [`compress_bucket`]
//!
//! # Example
//!
//! ```rust,ignore
//! use bson::doc;
//! use bucket_unpacker::{Behavior, BucketSpec, BucketUnpacker};
//!
//! let spec = BucketSpec::new("time").with_meta_field("tags");
//! let mut unpacker = BucketUnpacker::new(spec, Behavior::Exclude);
//!
//! unpacker.reset(doc! {
//!     "control": { "version": 1 },
//!     "meta": { "host": "a" },
//!     "data": { "time": { "0": 1, "1": 2 }, "cpu": { "0": 0.5, "1": 0.7 } },
//! })?;
//!
//! for measurement in &mut unpacker {
//!     let measurement = measurement?;
//!     // { tags: { host: "a" }, time: 1, cpu: 0.5 }, ...
//! }
//! ```

#![deny(missing_docs)]

pub mod column;
pub mod error;
pub mod measurement_count;
pub mod projection;
pub mod unpacker;

pub use column::{compress_bucket, ColumnCodec, ColumnCodecConfig, ColumnDecoder, ColumnIter};
pub use error::{ErrorKind, Result, UnpackError};
pub use measurement_count::{compute_measurement_count, measurement_count_from_size};
pub use projection::{Behavior, BucketSpec};
pub use unpacker::{BucketUnpacker, UnpackerState};
