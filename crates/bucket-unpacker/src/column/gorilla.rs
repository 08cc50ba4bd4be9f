//! Gorilla-style bit streams for compressed columns.
//!
//! # Row Index Encoding (Delta-of-Delta)
//!
//! Row indices are strictly ascending, so consecutive deltas are usually equal
//! and the delta-of-delta is usually zero:
//! - First row: 32 bits raw
//! - Subsequent rows, by delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! # Double Encoding (XOR-based)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values, by XOR with the previous value:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Fits the previous window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits
//!
//! Leading zero counts above 31 do not fit in 5 bits; the window is widened to
//! start at bit 31 instead.
//!
//! Decoders never panic on malformed input: a truncated or inconsistent stream
//! yields `None`.

use bitvec::prelude::*;

/// Bit buffer used by all column streams.
pub type BitStream = BitVec<u8, Msb0>;

/// Largest leading-zero count representable in the 5-bit window header.
const MAX_LEADING_ZEROS: u32 = 31;

fn push_bits(output: &mut BitStream, value: u64, width: u32) {
    for i in (0..width).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Bounds-checked MSB-first reader over a bit slice.
pub struct BitReader<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader positioned at the first bit of `data`.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self { data, pos: 0 }
    }

    /// Reads one bit.
    pub fn read_bit(&mut self) -> Option<bool> {
        let bit = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(bit)
    }

    /// Reads `width` bits (at most 64) as an unsigned integer.
    pub fn read_bits(&mut self, width: u32) -> Option<u64> {
        if width > 64 || self.pos + width as usize > self.data.len() {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | u64::from(self.data[self.pos]);
            self.pos += 1;
        }
        Some(value)
    }

    /// Returns the number of bits consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Encoder for ascending row indices using delta-of-delta encoding.
#[derive(Debug, Default)]
pub struct RowEncoder {
    prev_row: Option<u32>,
    prev_delta: i64,
}

impl RowEncoder {
    /// Creates a new row encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a row index into the output bit stream.
    pub fn encode(&mut self, row: u32, output: &mut BitStream) {
        let Some(prev_row) = self.prev_row else {
            push_bits(output, u64::from(row), 32);
            self.prev_row = Some(row);
            self.prev_delta = 0;
            return;
        };

        let delta = i64::from(row) - i64::from(prev_row);
        let delta_of_delta = delta - self.prev_delta;

        if delta_of_delta == 0 {
            output.push(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            push_bits(output, 0b10, 2);
            push_bits(output, (delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            push_bits(output, 0b110, 3);
            push_bits(output, (delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (delta_of_delta + 2047) as u64, 12);
        } else {
            push_bits(output, 0b1111, 4);
            push_bits(output, delta_of_delta as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_row = Some(row);
    }
}

/// Decoder for delta-of-delta encoded row indices.
pub struct RowDecoder<'a> {
    reader: BitReader<'a>,
    prev_row: Option<u32>,
    prev_delta: i64,
}

impl<'a> RowDecoder<'a> {
    /// Creates a new row decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            prev_row: None,
            prev_delta: 0,
        }
    }

    /// Decodes the next row index, or `None` if the stream is exhausted or
    /// malformed.
    pub fn decode_next(&mut self) -> Option<u32> {
        let Some(prev_row) = self.prev_row else {
            let row = self.reader.read_bits(32)? as u32;
            self.prev_row = Some(row);
            self.prev_delta = 0;
            return Some(row);
        };

        let delta_of_delta = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(7)? as i64 - 63
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(9)? as i64 - 255
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(12)? as i64 - 2047
        } else {
            self.reader.read_bits(64)? as i64
        };

        let delta = self.prev_delta.checked_add(delta_of_delta)?;
        let row = u32::try_from(i64::from(prev_row).checked_add(delta)?).ok()?;
        self.prev_delta = delta;
        self.prev_row = Some(row);

        Some(row)
    }
}

/// Encoder for doubles using XOR compression.
#[derive(Debug, Default)]
pub struct ValueEncoder {
    prev_value: Option<u64>,
    /// Leading and trailing zero counts of the current window.
    window: Option<(u32, u32)>,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a double into the output bit stream.
    pub fn encode(&mut self, value: f64, output: &mut BitStream) {
        let bits = value.to_bits();

        let Some(prev_value) = self.prev_value else {
            push_bits(output, bits, 64);
            self.prev_value = Some(bits);
            return;
        };

        let xor = bits ^ prev_value;
        if xor == 0 {
            output.push(false);
        } else {
            let leading = xor.leading_zeros().min(MAX_LEADING_ZEROS);
            let trailing = xor.trailing_zeros();

            match self.window {
                Some((prev_leading, prev_trailing))
                    if leading >= prev_leading && trailing >= prev_trailing =>
                {
                    push_bits(output, 0b10, 2);
                    let meaningful_bits = 64 - prev_leading - prev_trailing;
                    push_bits(output, xor >> prev_trailing, meaningful_bits);
                }
                _ => {
                    push_bits(output, 0b11, 2);
                    let meaningful_bits = 64 - leading - trailing;
                    push_bits(output, u64::from(leading), 5);
                    // Length 1..=64 stored as 0..=63.
                    push_bits(output, u64::from(meaningful_bits - 1), 6);
                    push_bits(output, xor >> trailing, meaningful_bits);
                    self.window = Some((leading, trailing));
                }
            }
        }

        self.prev_value = Some(bits);
    }
}

/// Decoder for XOR-encoded doubles.
pub struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    prev_value: Option<u64>,
    window: Option<(u32, u32)>,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            prev_value: None,
            window: None,
        }
    }

    /// Decodes the next double, or `None` if the stream is exhausted or
    /// malformed.
    pub fn decode_next(&mut self) -> Option<f64> {
        let Some(prev_value) = self.prev_value else {
            let bits = self.reader.read_bits(64)?;
            self.prev_value = Some(bits);
            return Some(f64::from_bits(bits));
        };

        let xor = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            let (leading, trailing) = self.window?;
            let meaningful_bits = 64 - leading - trailing;
            self.reader.read_bits(meaningful_bits)? << trailing
        } else {
            let leading = self.reader.read_bits(5)? as u32;
            let meaningful_bits = self.reader.read_bits(6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful_bits)?;
            self.window = Some((leading, trailing));
            self.reader.read_bits(meaningful_bits)? << trailing
        };

        let bits = prev_value ^ xor;
        self.prev_value = Some(bits);

        Some(f64::from_bits(bits))
    }
}
