//! # nortek-core
//!
//! Protocol core for Nortek acoustic current meters (Vector, Aquadopp): the
//! binary field codecs, configuration and sample frame decoding, the stream
//! chunker, and the parameter registry.
//!
//! This crate has no I/O.  It is driven by `nortek-driver`, which owns the
//! transport and the protocol state machine.
//!
//! # Architecture overview (for beginners)
//!
//! The instrument talks over a serial line in a compact binary dialect.  Bytes
//! travel up through this crate in three steps:
//!
//! - **`protocol::chunker`** – finds complete frames in the raw byte stream by
//!   looking for sync markers and checking trailing checksums.
//!
//! - **`protocol::frames`** – turns each frame into a typed record such as
//!   [`HardwareConfig`] or a clock reading, using the primitives in
//!   **`protocol::codec`** (little-endian words, bitfields, packed BCD).
//!
//! - **`params`** – keeps every named setting of the 512-byte user
//!   configuration block, decodes blocks read from the instrument, and builds
//!   new blocks when a caller changes a setting.
//!
//! **`family`** holds the constants that differ between instrument families:
//! checksum seed, clock layout, and sample frame formats.

pub mod family;
pub mod params;
pub mod protocol;

pub use family::{ClockReading, InstrumentFamily, AQUADOPP, VECTOR};
pub use params::{
    ConfigChange, ConfigSnapshot, FieldCodec, Parameter, ParameterRegistry, RegistryError, Value,
    ValueKind, Visibility,
};
pub use protocol::frames::{HardwareConfig, HeadConfig};
pub use protocol::{Frame, FrameError, StreamChunker};
