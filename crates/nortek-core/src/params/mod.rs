//! Instrument parameters: typed values, per-field codecs, and the registry.
//!
//! # How a parameter is described (for beginners)
//!
//! Each setting the instrument stores in its 512-byte user configuration
//! block is described by plain data: where it lives (`offset`, `length`), how
//! its bytes map to a [`Value`] ([`FieldCodec`]), and who may change it
//! ([`Visibility`]).  The codec is a small enum dispatched by `match`, so the
//! table is ordinary data that can be inspected, cloned, and extended.
//!
//! ```rust
//! use nortek_core::params::{FieldCodec, Parameter, Value, Visibility};
//!
//! let param = Parameter::new("BlankingDistance", FieldCodec::Word)
//!     .at(6, 2)
//!     .visibility(Visibility::ReadWrite)
//!     .default_value(Value::Int(16));
//! assert_eq!(param.encode(&Value::Int(16)).unwrap(), vec![16, 0]);
//! ```

pub mod registry;
pub mod user_config;

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::codec::{
    bitfield_to_bytes, bytes_to_bitfield, bytes_to_string, datetime_to_words,
    double_word_to_int, int_to_double_word, int_to_word, string_to_bytes, word_to_int,
    words_to_datetime, CodecError, DATETIME_LEN,
};
use crate::protocol::frames::FrameError;

pub use registry::{ConfigChange, ConfigSnapshot, ParameterRegistry};

/// Errors raised by parameter lookups, local sets and block updates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("parameter {0} is read-only")]
    ReadOnly(String),

    #[error("parameter {0} is immutable")]
    Immutable(String),

    #[error("parameter {name} expects {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("value {value} for {name} out of range (max {max})")]
    ValueOutOfRange { name: String, value: i64, max: i64 },

    #[error("value for {name} is {length} bytes, field holds {max}")]
    ValueTooLong {
        name: String,
        length: usize,
        max: usize,
    },

    #[error("parameter {name} has no value to encode")]
    NoValue { name: String },

    #[error("cannot encode {name}: {source}")]
    Codec {
        name: String,
        #[source]
        source: CodecError,
    },

    #[error("parameter {0} registered after the registry was sealed")]
    Sealed(String),

    #[error("parameter {0} is already registered")]
    Duplicate(String),

    /// Block fields must tile the block without gaps or overlaps.
    #[error("parameter {name} at offset {offset} does not follow the previous field (expected {expected})")]
    LayoutGap {
        name: String,
        offset: usize,
        expected: usize,
    },

    #[error("invalid configuration block: {0}")]
    InvalidBlock(#[from] FrameError),

    #[error("invalid configuration blob: {0}")]
    InvalidBlob(String),

    #[error("invalid interval {0:?}, expected HH:MM:SS")]
    InvalidInterval(String),
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Kind of a [`Value`], used in type checks and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Str,
    Blob,
    Bits,
    DateTime,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValueKind::Int => "integer",
            ValueKind::Str => "string",
            ValueKind::Blob => "binary blob",
            ValueKind::Bits => "bit vector",
            ValueKind::DateTime => "six-field timestamp",
        };
        f.write_str(text)
    }
}

/// A parameter's current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Str(String),
    /// Raw bytes; shown base64-encoded.
    Blob(Vec<u8>),
    Bits(Vec<bool>),
    /// Six decoded BCD fields in wire order.
    DateTime([u8; DATETIME_LEN]),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Str(_) => ValueKind::Str,
            Value::Blob(_) => ValueKind::Blob,
            Value::Bits(_) => ValueKind::Bits,
            Value::DateTime(_) => ValueKind::DateTime,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Blob(bytes) => f.write_str(&STANDARD.encode(bytes)),
            Value::Bits(bits) => bits
                .iter()
                .try_for_each(|b| f.write_str(if *b { "1" } else { "0" })),
            Value::DateTime(d) => write!(
                f,
                "{:02} {:02} {:02} {:02} {:02} {:02}",
                d[0], d[1], d[2], d[3], d[4], d[5]
            ),
        }
    }
}

// ── Parameter description ─────────────────────────────────────────────────────

/// How a parameter's bytes map to a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCodec {
    /// Little-endian `u16`.
    Word,
    /// Two little-endian words, low first.
    DoubleWord,
    /// NUL-terminated, NUL-padded ASCII.
    Text,
    /// Opaque bytes.
    Blob,
    /// Reserved bytes; carried through but hidden from snapshots.
    Spare,
    /// Register shown as a bit vector.
    Flags,
    /// Six packed-BCD bytes.
    DateTime,
    /// Driver-side `HH:MM:SS` interval with no place in the block.
    Interval,
}

impl FieldCodec {
    pub fn value_kind(self) -> ValueKind {
        match self {
            FieldCodec::Word | FieldCodec::DoubleWord => ValueKind::Int,
            FieldCodec::Text | FieldCodec::Interval => ValueKind::Str,
            FieldCodec::Blob | FieldCodec::Spare => ValueKind::Blob,
            FieldCodec::Flags => ValueKind::Bits,
            FieldCodec::DateTime => ValueKind::DateTime,
        }
    }
}

/// Who may change a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    ReadWrite,
    /// Written only by the startup-parameter step, never by a caller's set.
    ReadOnly,
    /// Fixed once the driver is configured.
    Immutable,
}

/// Location of a parameter inside the user configuration block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub length: usize,
}

impl Span {
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// One named instrument setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub codec: FieldCodec,
    pub span: Option<Span>,
    pub visibility: Visibility,
    pub default_value: Option<Value>,
    pub init_value: Option<Value>,
    pub startup_param: bool,
    pub direct_access: bool,
}

impl Parameter {
    /// A read-write parameter with no location and no default.
    pub fn new(name: impl Into<String>, codec: FieldCodec) -> Self {
        Self {
            name: name.into(),
            codec,
            span: None,
            visibility: Visibility::ReadWrite,
            default_value: None,
            init_value: None,
            startup_param: false,
            direct_access: false,
        }
    }

    pub fn at(mut self, offset: usize, length: usize) -> Self {
        self.span = Some(Span { offset, length });
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn init_value(mut self, value: Value) -> Self {
        self.init_value = Some(value);
        self
    }

    pub fn startup(mut self) -> Self {
        self.startup_param = true;
        self
    }

    pub fn direct_access(mut self) -> Self {
        self.direct_access = true;
        self
    }

    pub fn is_spare(&self) -> bool {
        self.codec == FieldCodec::Spare
    }

    pub fn expected_kind(&self) -> ValueKind {
        self.codec.value_kind()
    }

    /// Decodes this parameter's bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedField`] if `bytes` does not match the
    /// declared length, or a BCD error for a bad timestamp.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if let Some(span) = self.span {
            if bytes.len() != span.length {
                return Err(CodecError::MalformedField {
                    expected_len: span.length,
                    actual_len: bytes.len(),
                });
            }
        }
        let value = match self.codec {
            FieldCodec::Word => Value::Int(word_to_int(bytes)? as i64),
            FieldCodec::DoubleWord => Value::Int(double_word_to_int(bytes)? as i64),
            FieldCodec::Text | FieldCodec::Interval => Value::Str(bytes_to_string(bytes)),
            FieldCodec::Blob | FieldCodec::Spare => Value::Blob(bytes.to_vec()),
            FieldCodec::Flags => Value::Bits(bytes_to_bitfield(bytes)),
            FieldCodec::DateTime => Value::DateTime(words_to_datetime(bytes)?),
        };
        Ok(value)
    }

    /// Checks that `value` has the right kind and fits the field.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TypeMismatch`], [`RegistryError::ValueOutOfRange`],
    /// [`RegistryError::ValueTooLong`], or [`RegistryError::InvalidInterval`].
    pub fn check(&self, value: &Value) -> Result<(), RegistryError> {
        let expected = self.expected_kind();
        if value.kind() != expected {
            return Err(RegistryError::TypeMismatch {
                name: self.name.clone(),
                expected,
                found: value.kind(),
            });
        }
        match (self.codec, value) {
            (FieldCodec::Word, Value::Int(n)) => self.check_range(*n, u16::MAX as i64),
            (FieldCodec::DoubleWord, Value::Int(n)) => self.check_range(*n, u32::MAX as i64),
            (FieldCodec::Interval, Value::Str(s)) => parse_interval(s).map(|_| ()),
            (FieldCodec::Text, Value::Str(s)) => self.check_width(s.len()),
            (FieldCodec::Blob | FieldCodec::Spare, Value::Blob(bytes)) => {
                self.check_width(bytes.len())
            }
            (FieldCodec::Flags, Value::Bits(bits)) => self.check_width(bits.len().div_ceil(8)),
            (FieldCodec::DateTime, Value::DateTime(fields)) => fields
                .iter()
                .try_for_each(|f| self.check_range(*f as i64, 99)),
            _ => Ok(()),
        }
    }

    fn check_range(&self, value: i64, max: i64) -> Result<(), RegistryError> {
        if !(0..=max).contains(&value) {
            return Err(RegistryError::ValueOutOfRange {
                name: self.name.clone(),
                value,
                max,
            });
        }
        Ok(())
    }

    /// Shorter values are padded when encoded; longer ones are rejected.
    fn check_width(&self, length: usize) -> Result<(), RegistryError> {
        match self.span {
            Some(span) if length > span.length => Err(RegistryError::ValueTooLong {
                name: self.name.clone(),
                length,
                max: span.length,
            }),
            _ => Ok(()),
        }
    }

    /// Encodes `value` in this parameter's wire form, before width fitting.
    ///
    /// # Errors
    ///
    /// Propagates [`Parameter::check`] failures and codec errors.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, RegistryError> {
        self.check(value)?;
        let codec_err = |source| RegistryError::Codec {
            name: self.name.clone(),
            source,
        };
        let bytes = match value {
            Value::Int(n) if self.codec == FieldCodec::Word => int_to_word(*n as u16).to_vec(),
            Value::Int(n) => int_to_double_word(*n as u32).to_vec(),
            Value::Str(s) => s.as_bytes().to_vec(),
            Value::Blob(bytes) => bytes.clone(),
            Value::Bits(bits) => bitfield_to_bytes(bits).map_err(codec_err)?,
            Value::DateTime(fields) => datetime_to_words(fields).map_err(codec_err)?.to_vec(),
        };
        Ok(bytes)
    }

    /// Encodes `value` and NUL-pads it to the declared field width.
    ///
    /// # Errors
    ///
    /// Same as [`Parameter::encode`].
    pub fn encode_fitted(&self, value: &Value) -> Result<Vec<u8>, RegistryError> {
        let bytes = self.encode(value)?;
        let Some(span) = self.span else {
            return Ok(bytes);
        };
        let fitted = match value {
            Value::Str(s) => string_to_bytes(s, span.length),
            _ => {
                let mut bytes = bytes;
                bytes.resize(span.length, 0);
                bytes
            }
        };
        Ok(fitted)
    }
}

/// Parses an `HH:MM:SS` interval; `00:00:00` means "disabled" and parses as zero.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidInterval`] for anything else.
pub fn parse_interval(text: &str) -> Result<Duration, RegistryError> {
    let invalid = || RegistryError::InvalidInterval(text.to_string());
    let parts: Vec<&str> = text.split(':').collect();
    let [h, m, s] = parts.as_slice() else {
        return Err(invalid());
    };
    let field = |part: &str, max: u64| -> Result<u64, RegistryError> {
        if part.len() != 2 {
            return Err(invalid());
        }
        part.parse::<u64>()
            .ok()
            .filter(|v| *v <= max)
            .ok_or_else(invalid)
    };
    let seconds = field(*h, 99)? * 3600 + field(*m, 59)? * 60 + field(*s, 59)?;
    Ok(Duration::from_secs(seconds))
}
