//! BucketUnpacker - Turns one bucket back into per-measurement documents.
//!
//! A bucket groups many measurements into one document:
//!
//! ```text
//! { control: { version: 1|2, ... }, meta?: <any>, data: { <field>: <column>, ... } }
//! ```
//!
//! Version 1 stores each column as a sub-document keyed by decimal row index;
//! version 2 stores each column as a compressed binary blob read through a
//! [`ColumnDecoder`]. `reset` binds every column once, so the rest of the
//! unpacker never branches on the version.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──reset──▶ Loaded ──get_next (last row)──▶ Exhausted
//!  ▲                │                                 │
//!  └── failed reset ┴──────────── reset ──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bucket_unpacker::{Behavior, BucketSpec, BucketUnpacker};
//!
//! let spec = BucketSpec::new("time").with_meta_field("tags");
//! let mut unpacker = BucketUnpacker::new(spec, Behavior::Exclude);
//!
//! unpacker.reset(bucket)?;
//! while unpacker.has_next() {
//!     let measurement = unpacker.get_next()?;
//!     // ...
//! }
//! ```

use crate::column::{ColumnCodec, ColumnDecoder, ColumnSource};
use crate::error::{Result, UnpackError};
use crate::measurement_count;
use crate::projection::{
    include_field, include_time_field, resolve_meta_inclusion, Behavior, BucketSpec,
};
use bson::{Bson, Document, RawDocument};
use tracing::{debug, warn};

/// Top-level bucket field holding encoding information.
pub const BUCKET_CONTROL_FIELD: &str = "control";

/// Top-level bucket field holding the shared metadata value.
pub const BUCKET_META_FIELD: &str = "meta";

/// Top-level bucket field holding the columns.
pub const BUCKET_DATA_FIELD: &str = "data";

/// Field of `control` selecting the column encoding.
pub const CONTROL_VERSION_FIELD: &str = "version";

/// Where a [`BucketUnpacker`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackerState {
    /// No bucket has been loaded, or the last reset failed.
    Idle,
    /// A bucket is loaded and measurements remain.
    Loaded,
    /// A bucket is loaded and the sequential cursor has passed its last row.
    Exhausted,
}

/// Per-reset state: the bound columns and the row domain.
#[derive(Debug)]
struct LoadedBucket {
    /// `control.version` of the bucket.
    version: i64,
    /// Metadata value, present only if the bucket has one and it is projected.
    meta: Option<Bson>,
    /// Time column, present only if it is projected.
    time: Option<ColumnSource>,
    /// Other projected columns in the bucket's field order.
    columns: Vec<(String, ColumnSource)>,
    /// Distinct rows of the time column, ascending.
    rows: Vec<u32>,
    /// Position of the next row in `rows`.
    cursor: usize,
}

impl LoadedBucket {
    fn materialize(&self, spec: &BucketSpec, pos: usize) -> Document {
        let row = self.rows[pos];
        let key = row.to_string();
        let mut measurement = Document::new();

        if let (Some(meta_field), Some(meta)) = (&spec.meta_field, &self.meta) {
            measurement.insert(meta_field.clone(), meta.clone());
        }
        if let Some(value) = self.time.as_ref().and_then(|time| time.get(row, &key)) {
            measurement.insert(spec.time_field.clone(), value.clone());
        }
        for (field, column) in &self.columns {
            if let Some(value) = column.get(row, &key) {
                measurement.insert(field.clone(), value.clone());
            }
        }

        measurement
    }
}

/// Decoder reconstructing measurements from a bucket.
///
/// An instance processes one bucket at a time and is not meant to be shared
/// between threads; use one unpacker per execution lane.
#[derive(Debug)]
pub struct BucketUnpacker<D = ColumnCodec> {
    spec: BucketSpec,
    behavior: Behavior,
    include_meta: bool,
    include_time: bool,
    decoder: D,
    loaded: Option<LoadedBucket>,
}

impl BucketUnpacker {
    /// Creates an unpacker that reads compressed columns with the default
    /// [`ColumnCodec`].
    pub fn new(spec: BucketSpec, behavior: Behavior) -> Self {
        Self::with_decoder(spec, behavior, ColumnCodec::default())
    }

    /// Computes the number of measurements in an uncompressed bucket from the
    /// serialized size of its time column, without loading it.
    ///
    /// See [`measurement_count::compute_measurement_count`].
    pub fn compute_measurement_count(bucket: &RawDocument, time_field: &str) -> Result<usize> {
        measurement_count::compute_measurement_count(bucket, time_field)
    }
}

impl<D: ColumnDecoder> BucketUnpacker<D> {
    /// Creates an unpacker that reads compressed columns with `decoder`.
    pub fn with_decoder(spec: BucketSpec, behavior: Behavior, decoder: D) -> Self {
        let (include_meta, spec) = resolve_meta_inclusion(behavior, &spec);
        let include_time = include_time_field(behavior, &spec);
        Self {
            spec,
            behavior,
            include_meta,
            include_time,
            decoder,
            loaded: None,
        }
    }

    /// Replaces the projection and returns the unpacker to `Idle`.
    pub fn set_bucket_spec_and_behavior(&mut self, spec: BucketSpec, behavior: Behavior) {
        let (include_meta, spec) = resolve_meta_inclusion(behavior, &spec);
        self.include_time = include_time_field(behavior, &spec);
        self.include_meta = include_meta;
        self.spec = spec;
        self.behavior = behavior;
        self.loaded = None;
    }

    /// Loads `bucket`, discarding any previously loaded bucket.
    ///
    /// All whole-bucket validation happens here; on error the unpacker is
    /// left `Idle`.
    ///
    /// # Errors
    ///
    /// - `UnpackError::EmptyBucket` if `bucket` has no fields.
    /// - `UnpackError::InvalidMetadata` if `meta` is `undefined`.
    /// - `UnpackError::UnexpectedMetadata` if `meta` is present but the spec
    ///   has no metadata field.
    /// - `UnpackError::MalformedBucket` / `UnsupportedVersion` for a bad
    ///   `control` or `data` region.
    /// - `UnpackError::CorruptColumn` / `ChecksumMismatch` if a compressed
    ///   column fails to decode.
    pub fn reset(&mut self, bucket: Document) -> Result<()> {
        self.loaded = None;

        match self.load(bucket) {
            Ok(loaded) => {
                debug!(
                    "Loaded version {} bucket: {} measurements, {} projected columns, meta {}",
                    loaded.version,
                    loaded.rows.len(),
                    loaded.columns.len() + usize::from(loaded.time.is_some()),
                    if loaded.meta.is_some() { "included" } else { "omitted" }
                );
                self.loaded = Some(loaded);
                Ok(())
            }
            Err(e) => {
                warn!("Bucket reset failed (code {}): {}", e.code(), e);
                Err(e)
            }
        }
    }

    fn load(&self, mut bucket: Document) -> Result<LoadedBucket> {
        if bucket.is_empty() {
            return Err(UnpackError::EmptyBucket);
        }

        let meta = match bucket.remove(BUCKET_META_FIELD) {
            Some(Bson::Undefined) => return Err(UnpackError::InvalidMetadata),
            Some(_) if self.spec.meta_field.is_none() => {
                return Err(UnpackError::UnexpectedMetadata)
            }
            Some(value) if self.include_meta => Some(value),
            _ => None,
        };

        let version = bucket_version(&bucket)?;

        let data = match bucket.remove(BUCKET_DATA_FIELD) {
            Some(Bson::Document(data)) => data,
            Some(other) => {
                return Err(UnpackError::MalformedBucket(format!(
                    "data must be a document, got {:?}",
                    other.element_type()
                )))
            }
            None => {
                return Err(UnpackError::MalformedBucket(
                    "data region is missing".to_string(),
                ))
            }
        };

        let mut time = None;
        let mut columns = Vec::new();
        for (field, column) in data {
            let is_time = field == self.spec.time_field;
            let projected = is_time
                || (self.spec.meta_field.as_deref() != Some(field.as_str())
                    && include_field(&field, self.behavior, &self.spec));

            let source = match (version, column) {
                (1, Bson::Document(values)) => ColumnSource::uncompressed(&field, values)?,
                (2, Bson::Binary(_)) if !projected => continue,
                (2, Bson::Binary(blob)) => {
                    ColumnSource::decoded(&field, self.decoder.decode(&field, &blob.bytes)?)?
                }
                (_, other) => {
                    return Err(UnpackError::MalformedBucket(format!(
                        "column '{}' has unexpected type {:?} for version {}",
                        field,
                        other.element_type(),
                        version
                    )))
                }
            };

            if is_time {
                time = Some(source);
            } else if projected {
                columns.push((field, source));
            }
        }

        let rows = time.as_ref().map(ColumnSource::rows).unwrap_or_default();

        Ok(LoadedBucket {
            version,
            meta,
            time: if self.include_time { time } else { None },
            columns,
            rows,
            cursor: 0,
        })
    }

    /// Returns true if the sequential cursor has rows left.
    pub fn has_next(&self) -> bool {
        self.loaded
            .as_ref()
            .is_some_and(|loaded| loaded.cursor < loaded.rows.len())
    }

    /// Materializes the measurement at the cursor and advances the cursor.
    ///
    /// # Errors
    ///
    /// - `UnpackError::NotLoaded` if no bucket is loaded.
    /// - `UnpackError::Exhausted` if every row has been returned.
    pub fn get_next(&mut self) -> Result<Document> {
        let spec = &self.spec;
        let loaded = self.loaded.as_mut().ok_or(UnpackError::NotLoaded)?;
        if loaded.cursor >= loaded.rows.len() {
            return Err(UnpackError::Exhausted);
        }

        let measurement = loaded.materialize(spec, loaded.cursor);
        loaded.cursor += 1;
        Ok(measurement)
    }

    /// Materializes the measurement at `row` without moving the cursor.
    ///
    /// # Errors
    ///
    /// - `UnpackError::NotLoaded` if no bucket is loaded.
    /// - `UnpackError::RowNotInDomain` if the time column has no entry at
    ///   `row`.
    pub fn extract_single_measurement(&self, row: u32) -> Result<Document> {
        let loaded = self.loaded.as_ref().ok_or(UnpackError::NotLoaded)?;
        let pos = loaded
            .rows
            .binary_search(&row)
            .map_err(|_| UnpackError::RowNotInDomain(row))?;
        Ok(loaded.materialize(&self.spec, pos))
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> UnpackerState {
        match &self.loaded {
            None => UnpackerState::Idle,
            Some(loaded) if loaded.cursor < loaded.rows.len() => UnpackerState::Loaded,
            Some(_) => UnpackerState::Exhausted,
        }
    }

    /// Returns the number of measurements in the loaded bucket, or 0 when
    /// idle.
    pub fn measurement_count(&self) -> usize {
        self.loaded.as_ref().map_or(0, |loaded| loaded.rows.len())
    }

    /// Returns the normalized spec; its field set never holds the metadata
    /// field.
    pub fn spec(&self) -> &BucketSpec {
        &self.spec
    }

    /// Returns the projection behavior.
    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    /// Returns true if the loaded bucket's metadata appears in output.
    pub fn include_meta_field(&self) -> bool {
        self.loaded
            .as_ref()
            .is_some_and(|loaded| loaded.meta.is_some())
    }

    /// Returns true if the time field appears in output.
    pub fn include_time_field(&self) -> bool {
        self.include_time
    }

    /// Returns the column decoder.
    pub fn decoder(&self) -> &D {
        &self.decoder
    }
}

impl<D: ColumnDecoder> Iterator for BucketUnpacker<D> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        Some(self.get_next())
    }
}

fn bucket_version(bucket: &Document) -> Result<i64> {
    let control = match bucket.get(BUCKET_CONTROL_FIELD) {
        Some(Bson::Document(control)) => control,
        Some(_) => {
            return Err(UnpackError::MalformedBucket(
                "control must be a document".to_string(),
            ))
        }
        None => {
            return Err(UnpackError::MalformedBucket(
                "control region is missing".to_string(),
            ))
        }
    };

    let version = match control.get(CONTROL_VERSION_FIELD) {
        Some(Bson::Int32(v)) => *v as i64,
        Some(Bson::Int64(v)) => *v,
        _ => {
            return Err(UnpackError::MalformedBucket(
                "control.version must be an integer".to_string(),
            ))
        }
    };

    match version {
        1 | 2 => Ok(version),
        other => Err(UnpackError::UnsupportedVersion(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn bucket() -> Document {
        doc! {
            "control": { "version": 1 },
            "meta": { "m1": 999, "m2": 9999 },
            "data": {
                "_id": { "0": 1, "1": 2 },
                "time": { "0": 1, "1": 2 },
                "a": { "0": 1, "1": 2 },
                "b": { "1": 1 },
            },
        }
    }

    #[test]
    fn test_state_transitions() {
        let spec = BucketSpec::new("time").with_meta_field("myMeta");
        let mut unpacker = BucketUnpacker::new(spec, Behavior::Exclude);
        assert_eq!(unpacker.state(), UnpackerState::Idle);
        assert!(!unpacker.has_next());
        assert!(matches!(unpacker.get_next(), Err(UnpackError::NotLoaded)));

        unpacker.reset(bucket()).unwrap();
        assert_eq!(unpacker.state(), UnpackerState::Loaded);
        unpacker.get_next().unwrap();
        assert_eq!(unpacker.state(), UnpackerState::Loaded);
        unpacker.get_next().unwrap();
        assert_eq!(unpacker.state(), UnpackerState::Exhausted);
        assert!(matches!(unpacker.get_next(), Err(UnpackError::Exhausted)));

        assert!(unpacker.reset(Document::new()).is_err());
        assert_eq!(unpacker.state(), UnpackerState::Idle);
    }

    #[test]
    fn test_field_order() {
        let spec = BucketSpec::new("time").with_meta_field("myMeta");
        let mut unpacker = BucketUnpacker::new(spec, Behavior::Exclude);
        unpacker.reset(bucket()).unwrap();

        let first = unpacker.get_next().unwrap();
        let keys: Vec<&String> = first.keys().collect();
        assert_eq!(keys, ["myMeta", "time", "_id", "a"]);
    }

    #[test]
    fn test_meta_field_named_column_is_skipped() {
        let spec = BucketSpec::new("time").with_meta_field("myMeta");
        let mut unpacker = BucketUnpacker::new(spec, Behavior::Exclude);
        unpacker
            .reset(doc! {
                "control": { "version": 1 },
                "data": { "time": { "0": 1 }, "myMeta": { "0": "shadow" } },
            })
            .unwrap();

        assert_eq!(unpacker.get_next().unwrap(), doc! { "time": 1 });
    }

    #[test]
    fn test_set_spec_returns_to_idle() {
        let spec = BucketSpec::new("time").with_meta_field("myMeta");
        let mut unpacker = BucketUnpacker::new(spec.clone(), Behavior::Exclude);
        unpacker.reset(bucket()).unwrap();
        assert!(unpacker.include_meta_field());

        unpacker.set_bucket_spec_and_behavior(spec.with_fields(["a"]), Behavior::Include);
        assert_eq!(unpacker.state(), UnpackerState::Idle);
        assert!(!unpacker.include_time_field());

        unpacker.reset(bucket()).unwrap();
        assert!(!unpacker.include_meta_field());
        assert_eq!(unpacker.get_next().unwrap(), doc! { "a": 1 });
    }

    #[test]
    fn test_version_validation() {
        let spec = BucketSpec::new("time");
        let mut unpacker = BucketUnpacker::new(spec, Behavior::Exclude);

        let err = unpacker
            .reset(doc! { "control": { "version": 3 }, "data": {} })
            .unwrap_err();
        assert!(matches!(err, UnpackError::UnsupportedVersion(3)));

        let err = unpacker
            .reset(doc! { "control": { "version": "1" }, "data": {} })
            .unwrap_err();
        assert!(matches!(err, UnpackError::MalformedBucket(_)));

        let err = unpacker.reset(doc! { "data": {} }).unwrap_err();
        assert!(matches!(err, UnpackError::MalformedBucket(_)));

        unpacker
            .reset(doc! { "control": { "version": 1_i64 }, "data": {} })
            .unwrap();
        assert_eq!(unpacker.state(), UnpackerState::Exhausted);
    }

    #[test]
    fn test_column_shape_validation() {
        let spec = BucketSpec::new("time");
        let mut unpacker = BucketUnpacker::new(spec, Behavior::Exclude);

        let err = unpacker
            .reset(doc! { "control": { "version": 1 }, "data": { "time": 5 } })
            .unwrap_err();
        assert!(matches!(err, UnpackError::MalformedBucket(_)));

        let err = unpacker
            .reset(doc! { "control": { "version": 2 }, "data": { "time": { "0": 1 } } })
            .unwrap_err();
        assert!(matches!(err, UnpackError::MalformedBucket(_)));

        let err = unpacker
            .reset(doc! { "control": { "version": 1 }, "data": { "time": { "01": 1 } } })
            .unwrap_err();
        assert!(matches!(err, UnpackError::MalformedBucket(_)));

        let err = unpacker
            .reset(doc! { "control": { "version": 1 }, "data": 7 })
            .unwrap_err();
        assert!(matches!(err, UnpackError::MalformedBucket(_)));
    }
}
