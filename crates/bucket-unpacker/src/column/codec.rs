//! Compressed column blocks.
//!
//! This is the default [`ColumnDecoder`] for version 2 buckets, together with
//! the builder that produces its blocks from uncompressed columns.
//!
//! ## Binary Layout
//!
//! ```text
//! Offset    Size    Field
//! ------    ----    -----
//! 0x00      1       format (u8) = 1
//! 0x01      1       value_encoding (u8)
//! 0x02      4       count (u32 LE)
//! 0x06      4       row_bits (u32 LE)
//! 0x0A      N       row_data[ceil(row_bits / 8)]
//! 0x0A+N    4       value_data_size (u32 LE)
//! 0x0E+N    M       value_data[value_data_size]
//! 0x0E+N+M  4       block_crc32 (u32 LE)
//! ```
//!
//! Row indices are delta-of-delta encoded (see [`gorilla`](super::gorilla)).
//! Values are either a BSON document whose i-th element is the i-th entry's
//! value, or a Gorilla XOR stream when every value is a double.

use super::gorilla::{BitStream, RowDecoder, RowEncoder, ValueDecoder, ValueEncoder};
use super::{parse_row_key, ColumnDecoder, ColumnIter};
use crate::error::{Result, UnpackError};
use crate::unpacker::{BUCKET_CONTROL_FIELD, BUCKET_DATA_FIELD, CONTROL_VERSION_FIELD};
use bitvec::prelude::*;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use tracing::debug;

/// Current column block format.
pub const COLUMN_FORMAT: u8 = 1;

/// Binary subtype used for compressed columns.
pub const COLUMN_BINARY_SUBTYPE: u8 = 7;

/// Bytes before the row data.
const HEADER_SIZE: usize = 10;

/// Value encoding type for a column block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ValueEncoding {
    /// BSON document of values.
    #[default]
    Bson = 0,
    /// Gorilla XOR compressed doubles.
    GorillaXor = 1,
}

impl ValueEncoding {
    /// Creates a ValueEncoding from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Bson),
            1 => Some(Self::GorillaXor),
            _ => None,
        }
    }
}

/// Configuration for building and reading column blocks.
#[derive(Debug, Clone)]
pub struct ColumnCodecConfig {
    /// Verify each block's CRC32 before decoding it.
    pub verify_checksum: bool,
    /// Store all-double columns as Gorilla XOR streams.
    pub gorilla_doubles: bool,
}

impl Default for ColumnCodecConfig {
    fn default() -> Self {
        Self {
            verify_checksum: true,
            gorilla_doubles: true,
        }
    }
}

impl ColumnCodecConfig {
    /// Creates a codec configuration with custom settings.
    pub fn new(verify_checksum: bool, gorilla_doubles: bool) -> Self {
        Self {
            verify_checksum,
            gorilla_doubles,
        }
    }
}

/// A column block borrowing its row and value data from a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBlock<'a> {
    /// How `value_data` is encoded.
    pub value_encoding: ValueEncoding,
    /// Number of entries in the column.
    pub count: u32,
    /// Number of meaningful bits in `row_data`.
    pub row_bits: u32,
    /// Delta-of-delta encoded row indices.
    pub row_data: &'a [u8],
    /// Encoded values.
    pub value_data: &'a [u8],
    /// CRC32 stored with the block.
    pub block_crc32: u32,
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if input.len() < len {
        return None;
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Some(head)
}

fn take_u32(input: &mut &[u8]) -> Option<u32> {
    let bytes = take(input, 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl<'a> ColumnBlock<'a> {
    /// Calculates the CRC32 checksum of the block.
    ///
    /// CRC covers every field before `block_crc32`.
    pub fn calculate_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[COLUMN_FORMAT, self.value_encoding as u8]);
        hasher.update(&self.count.to_le_bytes());
        hasher.update(&self.row_bits.to_le_bytes());
        hasher.update(self.row_data);
        hasher.update(&(self.value_data.len() as u32).to_le_bytes());
        hasher.update(self.value_data);
        hasher.finalize()
    }

    /// Parses the block layout of `blob` without decoding entries.
    ///
    /// # Errors
    ///
    /// Returns `UnpackError::CorruptColumn` if the blob is truncated or names
    /// an unknown format or encoding.
    pub fn parse(field: &str, blob: &'a [u8]) -> Result<Self> {
        let truncated = || UnpackError::corrupt_column(field, "truncated column block");
        let mut input = blob;

        let header = take(&mut input, 2).ok_or_else(truncated)?;
        if header[0] != COLUMN_FORMAT {
            return Err(UnpackError::corrupt_column(
                field,
                format!("unsupported column format {}", header[0]),
            ));
        }
        let value_encoding = ValueEncoding::from_u8(header[1]).ok_or_else(|| {
            UnpackError::corrupt_column(field, format!("unknown value encoding {}", header[1]))
        })?;

        let count = take_u32(&mut input).ok_or_else(truncated)?;
        let row_bits = take_u32(&mut input).ok_or_else(truncated)?;
        let row_data = take(&mut input, (row_bits as usize).div_ceil(8)).ok_or_else(truncated)?;
        let value_size = take_u32(&mut input).ok_or_else(truncated)?;
        let value_data = take(&mut input, value_size as usize).ok_or_else(truncated)?;
        let block_crc32 = take_u32(&mut input).ok_or_else(truncated)?;

        Ok(Self {
            value_encoding,
            count,
            row_bits,
            row_data,
            value_data,
            block_crc32,
        })
    }

    /// Serializes the block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        out.push(COLUMN_FORMAT);
        out.push(self.value_encoding as u8);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.row_bits.to_le_bytes());
        out.extend_from_slice(self.row_data);
        out.extend_from_slice(&(self.value_data.len() as u32).to_le_bytes());
        out.extend_from_slice(self.value_data);
        out.extend_from_slice(&self.block_crc32.to_le_bytes());
        out
    }

    /// Returns the size of the block in bytes when serialized.
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE + self.row_data.len() + 4 + self.value_data.len() + 4
    }
}

/// Builds one compressed column from ascending `(row, value)` entries.
pub struct ColumnBuilder {
    field: String,
    gorilla_doubles: bool,
    row_encoder: RowEncoder,
    rows: BitStream,
    last_row: Option<u32>,
    values: Vec<Bson>,
}

impl ColumnBuilder {
    /// Creates an empty builder for `field`.
    pub fn new(field: impl Into<String>, config: &ColumnCodecConfig) -> Self {
        Self {
            field: field.into(),
            gorilla_doubles: config.gorilla_doubles,
            row_encoder: RowEncoder::new(),
            rows: BitStream::new(),
            last_row: None,
            values: Vec::new(),
        }
    }

    /// Appends the value stored at `row`.
    ///
    /// # Errors
    ///
    /// Returns `UnpackError::CorruptColumn` if `row` does not follow the
    /// previously appended row.
    pub fn append(&mut self, row: u32, value: Bson) -> Result<()> {
        if let Some(last) = self.last_row {
            if row <= last {
                return Err(UnpackError::corrupt_column(
                    &self.field,
                    format!("row {} appended after row {}", row, last),
                ));
            }
        }
        self.row_encoder.encode(row, &mut self.rows);
        self.last_row = Some(row);
        self.values.push(value);
        Ok(())
    }

    /// Returns the number of entries appended so far.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Finishes the column and returns the serialized block.
    pub fn finish(self) -> Result<Vec<u8>> {
        let count = u32::try_from(self.values.len())
            .map_err(|_| UnpackError::corrupt_column(&self.field, "too many entries"))?;
        let all_doubles =
            !self.values.is_empty() && self.values.iter().all(|v| matches!(v, Bson::Double(_)));

        let (value_encoding, value_data) = if self.gorilla_doubles && all_doubles {
            let mut stream = BitStream::new();
            let mut encoder = ValueEncoder::new();
            for value in &self.values {
                if let Bson::Double(v) = value {
                    encoder.encode(*v, &mut stream);
                }
            }
            (ValueEncoding::GorillaXor, stream.into_vec())
        } else {
            let mut values = Document::new();
            for (idx, value) in self.values.into_iter().enumerate() {
                values.insert(idx.to_string(), value);
            }
            let mut bytes = Vec::new();
            values.to_writer(&mut bytes).map_err(|e| {
                UnpackError::corrupt_column(&self.field, format!("cannot encode values: {}", e))
            })?;
            (ValueEncoding::Bson, bytes)
        };

        let row_bits = u32::try_from(self.rows.len())
            .map_err(|_| UnpackError::corrupt_column(&self.field, "row stream too long"))?;
        let row_data = self.rows.into_vec();

        let mut block = ColumnBlock {
            value_encoding,
            count,
            row_bits,
            row_data: &row_data,
            value_data: &value_data,
            block_crc32: 0,
        };
        block.block_crc32 = block.calculate_crc();
        Ok(block.to_bytes())
    }

    /// Finishes the column as a BSON binary value.
    pub fn finish_binary(self) -> Result<Bson> {
        Ok(Bson::Binary(Binary {
            subtype: BinarySubtype::from(COLUMN_BINARY_SUBTYPE),
            bytes: self.finish()?,
        }))
    }
}

/// Default [`ColumnDecoder`] for blocks written by [`ColumnBuilder`].
#[derive(Debug, Clone, Default)]
pub struct ColumnCodec {
    config: ColumnCodecConfig,
}

impl ColumnCodec {
    /// Creates a codec with the given configuration.
    pub fn new(config: ColumnCodecConfig) -> Self {
        Self { config }
    }

    /// Returns the codec configuration.
    pub fn config(&self) -> &ColumnCodecConfig {
        &self.config
    }
}

impl ColumnDecoder for ColumnCodec {
    fn decode<'a>(&self, field: &'a str, blob: &'a [u8]) -> Result<ColumnIter<'a>> {
        let block = ColumnBlock::parse(field, blob)?;

        if self.config.verify_checksum {
            let actual = block.calculate_crc();
            if actual != block.block_crc32 {
                return Err(UnpackError::ChecksumMismatch {
                    field: field.to_string(),
                    expected: block.block_crc32,
                    actual,
                });
            }
        }

        let row_bits = BitSlice::<u8, Msb0>::from_slice(block.row_data)
            .get(..block.row_bits as usize)
            .ok_or_else(|| UnpackError::corrupt_column(field, "row bit length exceeds data"))?;

        let values = match block.value_encoding {
            ValueEncoding::Bson => {
                let values = Document::from_reader(block.value_data).map_err(|e| {
                    UnpackError::corrupt_column(field, format!("cannot decode values: {}", e))
                })?;
                if values.len() != block.count as usize {
                    return Err(UnpackError::corrupt_column(
                        field,
                        format!("{} values for {} entries", values.len(), block.count),
                    ));
                }
                ValueStream::Bson(values.into_iter())
            }
            ValueEncoding::GorillaXor => {
                ValueStream::GorillaXor(ValueDecoder::new(BitSlice::from_slice(block.value_data)))
            }
        };

        Ok(Box::new(ColumnEntries {
            field,
            rows: RowDecoder::new(row_bits),
            values,
            remaining: block.count,
        }))
    }
}

enum ValueStream<'a> {
    Bson(bson::document::IntoIter),
    GorillaXor(ValueDecoder<'a>),
}

/// Lazy iterator over a column block's entries.
struct ColumnEntries<'a> {
    field: &'a str,
    rows: RowDecoder<'a>,
    values: ValueStream<'a>,
    remaining: u32,
}

impl<'a> ColumnEntries<'a> {
    fn next_entry(&mut self) -> Result<(u32, Bson)> {
        let row = self
            .rows
            .decode_next()
            .ok_or_else(|| UnpackError::corrupt_column(self.field, "row stream ended early"))?;
        let value = match &mut self.values {
            ValueStream::Bson(values) => values.next().map(|(_, value)| value),
            ValueStream::GorillaXor(decoder) => decoder.decode_next().map(Bson::Double),
        }
        .ok_or_else(|| UnpackError::corrupt_column(self.field, "value stream ended early"))?;
        Ok((row, value))
    }
}

impl<'a> Iterator for ColumnEntries<'a> {
    type Item = Result<(u32, Bson)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let entry = self.next_entry();
        // Stop after the first error.
        self.remaining = if entry.is_ok() { self.remaining - 1 } else { 0 };
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

/// Rewrites an uncompressed (version 1) bucket as a compressed (version 2)
/// bucket.
///
/// Each `data` column's entries are sorted by row index before encoding, so
/// buckets with unordered row keys compress correctly. Fields other than
/// `control` and `data` are copied unchanged.
///
/// # Errors
///
/// - `UnpackError::EmptyBucket` if `bucket` has no fields.
/// - `UnpackError::UnsupportedVersion` if the bucket is not version 1.
/// - `UnpackError::MalformedBucket` if a region or column has the wrong shape.
pub fn compress_bucket(bucket: &Document, config: &ColumnCodecConfig) -> Result<Document> {
    if bucket.is_empty() {
        return Err(UnpackError::EmptyBucket);
    }

    let mut compressed = Document::new();
    let mut columns = 0usize;
    for (key, value) in bucket {
        match (key.as_str(), value) {
            (BUCKET_CONTROL_FIELD, Bson::Document(control)) => {
                compressed.insert(key.clone(), compress_control(control)?);
            }
            (BUCKET_CONTROL_FIELD, _) => {
                return Err(UnpackError::MalformedBucket(
                    "control must be a document".to_string(),
                ));
            }
            (BUCKET_DATA_FIELD, Bson::Document(data)) => {
                let mut out = Document::new();
                for (field, column) in data {
                    let Bson::Document(column) = column else {
                        return Err(UnpackError::MalformedBucket(format!(
                            "column '{}' must be a document",
                            field
                        )));
                    };
                    out.insert(field.clone(), compress_column(field, column, config)?);
                    columns += 1;
                }
                compressed.insert(key.clone(), out);
            }
            (BUCKET_DATA_FIELD, _) => {
                return Err(UnpackError::MalformedBucket(
                    "data must be a document".to_string(),
                ));
            }
            _ => {
                compressed.insert(key.clone(), value.clone());
            }
        }
    }

    if !compressed.contains_key(BUCKET_CONTROL_FIELD) {
        return Err(UnpackError::MalformedBucket(
            "control region is missing".to_string(),
        ));
    }

    debug!("Compressed bucket with {} columns", columns);
    Ok(compressed)
}

fn compress_control(control: &Document) -> Result<Document> {
    let version = match control.get(CONTROL_VERSION_FIELD) {
        Some(Bson::Int32(v)) => *v as i64,
        Some(Bson::Int64(v)) => *v,
        _ => {
            return Err(UnpackError::MalformedBucket(
                "control.version must be an integer".to_string(),
            ))
        }
    };
    if version != 1 {
        return Err(UnpackError::UnsupportedVersion(version));
    }

    let mut out = control.clone();
    out.insert(CONTROL_VERSION_FIELD, 2);
    Ok(out)
}

fn compress_column(field: &str, column: &Document, config: &ColumnCodecConfig) -> Result<Bson> {
    let mut entries = Vec::with_capacity(column.len());
    for (key, value) in column {
        let row = parse_row_key(key).ok_or_else(|| {
            UnpackError::MalformedBucket(format!("column '{}' has invalid row key '{}'", field, key))
        })?;
        entries.push((row, value.clone()));
    }
    entries.sort_by_key(|&(row, _)| row);

    let mut builder = ColumnBuilder::new(field, config);
    for (row, value) in entries {
        builder.append(row, value)?;
    }
    builder.finish_binary()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn build(entries: &[(u32, Bson)], config: &ColumnCodecConfig) -> Vec<u8> {
        let mut builder = ColumnBuilder::new("a", config);
        for (row, value) in entries {
            builder.append(*row, value.clone()).unwrap();
        }
        builder.finish().unwrap()
    }

    fn decode_all(blob: &[u8]) -> Result<Vec<(u32, Bson)>> {
        ColumnCodec::default().decode("a", blob)?.collect()
    }

    #[test]
    fn test_mixed_values_roundtrip() {
        let entries = vec![
            (0, Bson::Int32(1)),
            (1, Bson::String("two".to_string())),
            (5, Bson::Document(doc! { "x": 3 })),
            (6, Bson::Null),
        ];
        let blob = build(&entries, &ColumnCodecConfig::default());
        let block = ColumnBlock::parse("a", &blob).unwrap();
        assert_eq!(block.value_encoding, ValueEncoding::Bson);
        assert_eq!(block.count, 4);
        assert_eq!(block.serialized_size(), blob.len());
        assert_eq!(decode_all(&blob).unwrap(), entries);
    }

    #[test]
    fn test_doubles_use_gorilla() {
        let entries: Vec<(u32, Bson)> =
            (0..50).map(|i| (i, Bson::Double(i as f64 * 0.5))).collect();
        let blob = build(&entries, &ColumnCodecConfig::default());
        let block = ColumnBlock::parse("a", &blob).unwrap();
        assert_eq!(block.value_encoding, ValueEncoding::GorillaXor);
        assert_eq!(decode_all(&blob).unwrap(), entries);

        let blob = build(&entries, &ColumnCodecConfig::new(true, false));
        let block = ColumnBlock::parse("a", &blob).unwrap();
        assert_eq!(block.value_encoding, ValueEncoding::Bson);
        assert_eq!(decode_all(&blob).unwrap(), entries);
    }

    #[test]
    fn test_empty_column() {
        let blob = build(&[], &ColumnCodecConfig::default());
        assert!(decode_all(&blob).unwrap().is_empty());
    }

    #[test]
    fn test_append_requires_ascending_rows() {
        let mut builder = ColumnBuilder::new("a", &ColumnCodecConfig::default());
        builder.append(3, Bson::Int32(1)).unwrap();
        assert!(matches!(
            builder.append(3, Bson::Int32(2)),
            Err(UnpackError::CorruptColumn { .. })
        ));
        assert!(builder.append(2, Bson::Int32(2)).is_err());
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut blob = build(&[(0, Bson::Int32(7))], &ColumnCodecConfig::default());
        let last_value_byte = blob.len() - 6;
        blob[last_value_byte] ^= 0xFF;

        let err = decode_all(&blob).unwrap_err();
        assert!(matches!(err, UnpackError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_block() {
        let blob = build(&[(0, Bson::Int32(7))], &ColumnCodecConfig::default());
        for len in [0, 1, 5, blob.len() - 1] {
            let err = ColumnBlock::parse("a", &blob[..len]).unwrap_err();
            assert!(matches!(err, UnpackError::CorruptColumn { .. }));
        }
    }

    #[test]
    fn test_unknown_format() {
        let mut blob = build(&[(0, Bson::Int32(7))], &ColumnCodecConfig::default());
        blob[0] = 9;
        assert!(matches!(
            ColumnBlock::parse("a", &blob),
            Err(UnpackError::CorruptColumn { .. })
        ));
    }

    #[test]
    fn test_compress_bucket_rewrites_version_and_columns() {
        let bucket = doc! {
            "_id": 1,
            "control": { "version": 1, "min": { "time": 1 } },
            "meta": "m",
            "data": { "time": { "1": 2, "0": 1 }, "a": { "1": 5 } },
        };
        let compressed = compress_bucket(&bucket, &ColumnCodecConfig::default()).unwrap();

        let keys: Vec<&String> = compressed.keys().collect();
        assert_eq!(keys, ["_id", "control", "meta", "data"]);
        let control = compressed.get_document("control").unwrap();
        assert_eq!(control.get("version"), Some(&Bson::Int32(2)));
        assert_eq!(control.get_document("min").unwrap(), &doc! { "time": 1 });

        let data = compressed.get_document("data").unwrap();
        let Some(Bson::Binary(time)) = data.get("time") else {
            panic!("time column should be binary");
        };
        assert_eq!(
            decode_all(&time.bytes).unwrap(),
            vec![(0, Bson::Int32(1)), (1, Bson::Int32(2))]
        );
    }

    #[test]
    fn test_compress_bucket_rejects_compressed_input() {
        let bucket = doc! { "control": { "version": 2 }, "data": {} };
        assert!(matches!(
            compress_bucket(&bucket, &ColumnCodecConfig::default()),
            Err(UnpackError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            compress_bucket(&Document::new(), &ColumnCodecConfig::default()),
            Err(UnpackError::EmptyBucket)
        ));
    }
}
