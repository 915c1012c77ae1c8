//! Low-level field codecs shared by every Nortek frame and parameter.
//!
//! Nortek instruments speak a little-endian binary dialect:
//!
//! ```text
//! word        [lo][hi]                       -> u16
//! double word [w0 lo][w0 hi][w1 lo][w1 hi]   -> u32 (low word first)
//! datetime    [min][sec][day][hour][yr][mon] -> six packed-BCD bytes
//! checksum    seed + sum(words[0..n-1])      -> trailing u16, mod 0x10000
//! ```
//!
//! # Packed BCD (for beginners)
//!
//! Binary-coded decimal stores one decimal digit per nibble, so the byte
//! `0x15` means the decimal number 15 rather than 21.  Reading the hex digits
//! of the byte "as if they were decimal" is all there is to decoding it.
//!
//! # Bitfield ordering
//!
//! [`bytes_to_bitfield`] reverses the input bytes and expands each byte MSB
//! first.  The last emitted bit is therefore the least significant bit of the
//! *first* input byte.  Flag lookups throughout the crate index from the end
//! (`bits[bits.len() - 1]` is "bit -1"), so this order must not change.

use thiserror::Error;

/// Size of a 16-bit word on the wire.
pub const WORD_LEN: usize = 2;
/// Size of a 32-bit double word on the wire.
pub const DOUBLE_WORD_LEN: usize = 4;
/// Size of a packed-BCD clock field.
pub const DATETIME_LEN: usize = 6;

/// Errors produced by the field codecs.
///
/// These are always recoverable: the caller treats the enclosing frame as
/// corrupt and carries on with the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer handed to a codec does not have the length the field requires.
    #[error("malformed field: expected {expected_len} bytes, got {actual_len}")]
    MalformedField {
        expected_len: usize,
        actual_len: usize,
    },

    /// A byte that should hold two decimal digits has a nibble above 9.
    #[error("byte 0x{0:02X} is not packed BCD")]
    InvalidBcd(u8),

    /// A value cannot be represented in the target encoding.
    #[error("value {value} out of range (max {max})")]
    ValueOutOfRange { value: u64, max: u64 },
}

fn expect_len(bytes: &[u8], expected_len: usize) -> Result<(), CodecError> {
    if bytes.len() != expected_len {
        return Err(CodecError::MalformedField {
            expected_len,
            actual_len: bytes.len(),
        });
    }
    Ok(())
}

// ── Integers ──────────────────────────────────────────────────────────────────

/// Decodes a little-endian 16-bit word.
///
/// # Errors
///
/// Returns [`CodecError::MalformedField`] unless `bytes` is exactly 2 bytes.
///
/// # Examples
///
/// ```rust
/// use nortek_core::protocol::codec::word_to_int;
///
/// assert_eq!(word_to_int(&[0x8C, 0xB5]).unwrap(), 0xB58C);
/// ```
pub fn word_to_int(bytes: &[u8]) -> Result<u16, CodecError> {
    expect_len(bytes, WORD_LEN)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Encodes a 16-bit value as a little-endian word.
pub fn int_to_word(value: u16) -> [u8; WORD_LEN] {
    value.to_le_bytes()
}

/// Decodes a double word stored as two little-endian words, low word first.
///
/// # Errors
///
/// Returns [`CodecError::MalformedField`] unless `bytes` is exactly 4 bytes.
pub fn double_word_to_int(bytes: &[u8]) -> Result<u32, CodecError> {
    expect_len(bytes, DOUBLE_WORD_LEN)?;
    let low = word_to_int(&bytes[0..2])? as u32;
    let high = word_to_int(&bytes[2..4])? as u32;
    Ok((high << 16) | low)
}

/// Inverse of [`double_word_to_int`].
pub fn int_to_double_word(value: u32) -> [u8; DOUBLE_WORD_LEN] {
    let low = int_to_word((value & 0xFFFF) as u16);
    let high = int_to_word((value >> 16) as u16);
    [low[0], low[1], high[0], high[1]]
}

// ── Bitfields ─────────────────────────────────────────────────────────────────

/// Expands `bytes` into individual bits: bytes reversed, each byte MSB first.
///
/// # Examples
///
/// ```rust
/// use nortek_core::protocol::codec::bytes_to_bitfield;
///
/// let bits = bytes_to_bitfield(&[0x01, 0x80]);
/// // first emitted bit is the MSB of the last byte
/// assert!(bits[0]);
/// // last emitted bit is the LSB of the first byte
/// assert!(bits[15]);
/// assert_eq!(bits.iter().filter(|b| **b).count(), 2);
/// ```
pub fn bytes_to_bitfield(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .rev()
        .flat_map(|byte| (0..8).rev().map(move |shift| (byte >> shift) & 1 == 1))
        .collect()
}

/// Inverse of [`bytes_to_bitfield`].
///
/// # Errors
///
/// Returns [`CodecError::MalformedField`] if `bits.len()` is not a multiple of 8.
pub fn bitfield_to_bytes(bits: &[bool]) -> Result<Vec<u8>, CodecError> {
    if bits.len() % 8 != 0 {
        return Err(CodecError::MalformedField {
            expected_len: bits.len().div_ceil(8) * 8,
            actual_len: bits.len(),
        });
    }
    let mut out: Vec<u8> = bits
        .chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, bit| (acc << 1) | u8::from(*bit)))
        .collect();
    out.reverse();
    Ok(out)
}

/// Returns bit `-index` of a bitfield produced by [`bytes_to_bitfield`]
/// (`1` is the last bit).  Out-of-range lookups read as `false`.
pub fn bit_from_end(bits: &[bool], index: usize) -> bool {
    index > 0 && index <= bits.len() && bits[bits.len() - index]
}

// ── Checksum ──────────────────────────────────────────────────────────────────

/// Computes the Nortek checksum over `bytes[0..length - 2]`.
///
/// The running sum starts at `seed` and adds every little-endian word
/// before the trailing checksum slot, wrapping at 16 bits.  The same function
/// validates received frames and fills in the checksum of outgoing blocks.
///
/// # Errors
///
/// Returns [`CodecError::MalformedField`] if `length` is odd, shorter than one
/// word, or longer than `bytes`.
///
/// # Examples
///
/// ```rust
/// use nortek_core::protocol::codec::checksum;
///
/// // an empty body leaves only the seed
/// assert_eq!(checksum(&[0, 0], 2, 0xB58C).unwrap(), 0xB58C);
/// assert_eq!(checksum(&[1, 0, 0, 0], 4, 0xB58C).unwrap(), 0xB58D);
/// ```
pub fn checksum(bytes: &[u8], length: usize, seed: u16) -> Result<u16, CodecError> {
    if length < WORD_LEN || length % WORD_LEN != 0 || bytes.len() < length {
        return Err(CodecError::MalformedField {
            expected_len: length,
            actual_len: bytes.len(),
        });
    }
    let sum = bytes[..length - WORD_LEN]
        .chunks_exact(WORD_LEN)
        .fold(seed, |acc, word| {
            acc.wrapping_add(u16::from_le_bytes([word[0], word[1]]))
        });
    Ok(sum)
}

/// Reads the trailing checksum word stored in the last two bytes of `frame`.
///
/// # Errors
///
/// Returns [`CodecError::MalformedField`] if `frame` is shorter than a word.
pub fn stored_checksum(frame: &[u8]) -> Result<u16, CodecError> {
    if frame.len() < WORD_LEN {
        return Err(CodecError::MalformedField {
            expected_len: WORD_LEN,
            actual_len: frame.len(),
        });
    }
    word_to_int(&frame[frame.len() - WORD_LEN..])
}

/// Overwrites the trailing checksum slot of `frame` with a freshly computed sum.
///
/// # Errors
///
/// Propagates [`checksum`] length errors.
pub fn seal_checksum(frame: &mut [u8], seed: u16) -> Result<u16, CodecError> {
    let len = frame.len();
    let sum = checksum(frame, len, seed)?;
    frame[len - WORD_LEN..].copy_from_slice(&int_to_word(sum));
    Ok(sum)
}

// ── Packed BCD ────────────────────────────────────────────────────────────────

/// Decodes one packed-BCD byte (`0x15` becomes `15`).
///
/// # Errors
///
/// Returns [`CodecError::InvalidBcd`] if either nibble is above 9.
pub fn bcd_to_int(byte: u8) -> Result<u8, CodecError> {
    let (high, low) = (byte >> 4, byte & 0x0F);
    if high > 9 || low > 9 {
        return Err(CodecError::InvalidBcd(byte));
    }
    Ok(high * 10 + low)
}

/// Encodes a value in `0..=99` as one packed-BCD byte.
///
/// # Errors
///
/// Returns [`CodecError::ValueOutOfRange`] for values above 99.
pub fn int_to_bcd(value: u8) -> Result<u8, CodecError> {
    if value > 99 {
        return Err(CodecError::ValueOutOfRange {
            value: value as u64,
            max: 99,
        });
    }
    Ok(((value / 10) << 4) | (value % 10))
}

/// Decodes six packed-BCD bytes into six integers, preserving field order.
///
/// # Errors
///
/// Returns [`CodecError::MalformedField`] unless `bytes` is exactly 6 bytes,
/// and [`CodecError::InvalidBcd`] for a non-decimal nibble.
///
/// # Examples
///
/// ```rust
/// use nortek_core::protocol::codec::words_to_datetime;
///
/// let fields = words_to_datetime(&[0x30, 0x15, 0x22, 0x09, 0x24, 0x11]).unwrap();
/// assert_eq!(fields, [30, 15, 22, 9, 24, 11]);
/// ```
pub fn words_to_datetime(bytes: &[u8]) -> Result<[u8; DATETIME_LEN], CodecError> {
    expect_len(bytes, DATETIME_LEN)?;
    let mut out = [0u8; DATETIME_LEN];
    for (slot, byte) in out.iter_mut().zip(bytes) {
        *slot = bcd_to_int(*byte)?;
    }
    Ok(out)
}

/// Inverse of [`words_to_datetime`].
///
/// # Errors
///
/// Returns [`CodecError::ValueOutOfRange`] if any field exceeds 99.
pub fn datetime_to_words(fields: &[u8; DATETIME_LEN]) -> Result<[u8; DATETIME_LEN], CodecError> {
    let mut out = [0u8; DATETIME_LEN];
    for (slot, value) in out.iter_mut().zip(fields) {
        *slot = int_to_bcd(*value)?;
    }
    Ok(out)
}

// ── Strings ───────────────────────────────────────────────────────────────────

/// Reads a NUL-terminated ASCII field, stopping at the first NUL byte.
///
/// Non-ASCII bytes read as `?`, so the text never grows past the field width.
pub fn bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    bytes[..end]
        .iter()
        .map(|&b| if b.is_ascii() { char::from(b) } else { '?' })
        .collect()
}

/// Writes `text` into a fixed-width field, NUL-padding or truncating to `width`.
pub fn string_to_bytes(text: &str, width: usize) -> Vec<u8> {
    let mut out: Vec<u8> = text.bytes().take(width).collect();
    out.resize(width, 0);
    out
}
