//! Frame kinds and their typed records.
//!
//! Three shapes of device output are recognised:
//!
//! - **fixed configuration blocks** (hardware 48 B, head 224 B, user 512 B):
//!   sync bytes, body, trailing checksum word;
//! - **short ack-terminated replies** (clock, battery, id): a fixed payload
//!   followed by `06 06`, with no sync marker or checksum;
//! - **samples**: sync marker, fixed length and trailing checksum, with the
//!   exact layout left to the instrument family.
//!
//! A frame whose checksum does not match is still returned, flagged
//! `checksum_ok = false`, so the caller can publish a degraded record instead
//! of dropping data.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::family::{ClockReading, InstrumentFamily};
use crate::protocol::codec::{
    bit_from_end, bytes_to_bitfield, bytes_to_string, checksum, stored_checksum, word_to_int,
    CodecError,
};
use crate::protocol::commands::ACK;

pub const USER_CONFIG_LEN: usize = 512;
pub const HW_CONFIG_LEN: usize = 48;
pub const HEAD_CONFIG_LEN: usize = 224;
pub const CLOCK_LEN: usize = 6;
pub const BATTERY_LEN: usize = 2;
pub const ID_LEN: usize = 14;

pub const USER_CONFIG_SYNC: &[u8] = b"\xa5\x00\x00\x01";
pub const HW_CONFIG_SYNC: &[u8] = b"\xa5\x05\x18\x00";
pub const HEAD_CONFIG_SYNC: &[u8] = b"\xa5\x04\x70\x00";

/// Errors raised while validating or decoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The block is neither the bare frame length nor the frame plus an ACK.
    #[error("bad {kind} length: expected {expected} bytes, got {actual}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The block does not start with its sync marker.
    #[error("{kind} does not start with its sync marker")]
    BadSync { kind: &'static str },

    /// An ack-terminated reply is missing its `06 06` terminator.
    #[error("{kind} reply is missing its acknowledgment terminator")]
    MissingAck { kind: &'static str },

    /// The stored checksum word disagrees with the recomputed sum.
    #[error("checksum mismatch: stored 0x{stored:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch { stored: u16, computed: u16 },
}

// ── Frame kinds ───────────────────────────────────────────────────────────────

/// Fixed configuration block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKind {
    Hardware,
    Head,
    User,
}

impl ConfigKind {
    pub fn spec(self) -> FrameSpec {
        match self {
            Self::Hardware => HARDWARE_CONFIG,
            Self::Head => HEAD_CONFIG,
            Self::User => USER_CONFIG,
        }
    }
}

/// Short ack-terminated reply kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShortAckKind {
    Clock,
    Battery,
    Id,
}

impl ShortAckKind {
    /// Payload length, not counting the ACK terminator.
    pub fn payload_len(self) -> usize {
        match self {
            Self::Clock => CLOCK_LEN,
            Self::Battery => BATTERY_LEN,
            Self::Id => ID_LEN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Clock => "clock",
            Self::Battery => "battery",
            Self::Id => "id",
        }
    }
}

/// What a sync-delimited, checksummed frame decodes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameKind {
    Config(ConfigKind),
    Sample(&'static str),
}

/// A `(sync marker, fixed length)` pair the chunker scans for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub kind: FrameKind,
    pub sync: &'static [u8],
    pub length: usize,
}

impl FrameSpec {
    pub fn name(&self) -> &'static str {
        match self.kind {
            FrameKind::Config(ConfigKind::Hardware) => "hardware config",
            FrameKind::Config(ConfigKind::Head) => "head config",
            FrameKind::Config(ConfigKind::User) => "user config",
            FrameKind::Sample(name) => name,
        }
    }
}

pub const USER_CONFIG: FrameSpec = FrameSpec {
    kind: FrameKind::Config(ConfigKind::User),
    sync: USER_CONFIG_SYNC,
    length: USER_CONFIG_LEN,
};

pub const HARDWARE_CONFIG: FrameSpec = FrameSpec {
    kind: FrameKind::Config(ConfigKind::Hardware),
    sync: HW_CONFIG_SYNC,
    length: HW_CONFIG_LEN,
};

pub const HEAD_CONFIG: FrameSpec = FrameSpec {
    kind: FrameKind::Config(ConfigKind::Head),
    sync: HEAD_CONFIG_SYNC,
    length: HEAD_CONFIG_LEN,
};

// ── Typed records ─────────────────────────────────────────────────────────────

/// Decoded hardware configuration block (`GP`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub serial_number: String,
    pub config: Vec<bool>,
    pub board_frequency: u16,
    pub pic_version: u16,
    pub hardware_revision: u16,
    pub recorder_size: u16,
    pub status: Vec<bool>,
    pub firmware_version: String,
}

impl HardwareConfig {
    pub fn recorder_installed(&self) -> bool {
        bit_from_end(&self.config, 1)
    }

    pub fn compass_installed(&self) -> bool {
        bit_from_end(&self.config, 2)
    }

    pub fn velocity_range(&self) -> bool {
        bit_from_end(&self.status, 1)
    }

    fn decode(block: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            serial_number: bytes_to_string(&block[4..18]),
            config: bytes_to_bitfield(&block[18..20]),
            board_frequency: word_to_int(&block[20..22])?,
            pic_version: word_to_int(&block[22..24])?,
            hardware_revision: word_to_int(&block[24..26])?,
            recorder_size: word_to_int(&block[26..28])?,
            status: bytes_to_bitfield(&block[28..30]),
            firmware_version: bytes_to_string(&block[42..46]),
        })
    }
}

/// Decoded head configuration block (`GH`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadConfig {
    pub config: Vec<bool>,
    pub head_frequency: u16,
    pub head_type: u16,
    pub head_serial_number: String,
    /// Opaque calibration data, base64-encoded.
    pub system_data: String,
    pub number_of_beams: u16,
}

impl HeadConfig {
    pub fn pressure_sensor(&self) -> bool {
        bit_from_end(&self.config, 1)
    }

    pub fn magnetometer_sensor(&self) -> bool {
        bit_from_end(&self.config, 2)
    }

    pub fn tilt_sensor(&self) -> bool {
        bit_from_end(&self.config, 3)
    }

    pub fn tilt_sensor_mounted_down(&self) -> bool {
        bit_from_end(&self.config, 4)
    }

    fn decode(block: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            config: bytes_to_bitfield(&block[4..6]),
            head_frequency: word_to_int(&block[6..8])?,
            head_type: word_to_int(&block[8..10])?,
            head_serial_number: bytes_to_string(&block[10..22]),
            system_data: STANDARD.encode(&block[22..198]),
            number_of_beams: word_to_int(&block[220..222])?,
        })
    }
}

/// A configuration block decoded by kind.  The user block stays raw because
/// the parameter registry owns its field layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConfigRecord {
    Hardware(HardwareConfig),
    Head(HeadConfig),
    User(Vec<u8>),
}

/// Payload of a short ack-terminated reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ShortAckRecord {
    Clock(ClockReading),
    /// Battery voltage in millivolts.
    Battery(u16),
    Id(String),
}

/// A decoded unit of device output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Frame {
    FixedConfig {
        kind: ConfigKind,
        record: ConfigRecord,
        checksum_ok: bool,
    },
    ShortAck {
        kind: ShortAckKind,
        record: ShortAckRecord,
        terminator: [u8; 2],
    },
    Sample {
        name: &'static str,
        payload: Vec<u8>,
        checksum_ok: bool,
    },
}

impl Frame {
    /// `false` only for checksummed frames whose checksum did not match.
    pub fn checksum_ok(&self) -> bool {
        match self {
            Frame::FixedConfig { checksum_ok, .. } | Frame::Sample { checksum_ok, .. } => {
                *checksum_ok
            }
            Frame::ShortAck { .. } => true,
        }
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Compares the stored and recomputed checksums of a complete frame.
///
/// # Errors
///
/// Returns [`FrameError::Codec`] if the frame is too short to carry a checksum.
pub fn checksum_matches(frame: &[u8], seed: u16) -> Result<bool, FrameError> {
    let computed = checksum(frame, frame.len(), seed)?;
    Ok(stored_checksum(frame)? == computed)
}

/// Decodes one sync-delimited frame of exactly `spec.length` bytes.
///
/// A checksum mismatch is logged and reported through `checksum_ok`; only
/// structural problems (length, sync, field codecs) are errors.
///
/// # Errors
///
/// Returns [`FrameError::BadLength`] or [`FrameError::BadSync`] for a frame
/// that does not fit `spec`, and [`FrameError::Codec`] if a field fails to decode.
pub fn decode_frame(spec: &FrameSpec, bytes: &[u8], seed: u16) -> Result<Frame, FrameError> {
    if bytes.len() != spec.length {
        return Err(FrameError::BadLength {
            kind: spec.name(),
            expected: spec.length,
            actual: bytes.len(),
        });
    }
    if !bytes.starts_with(spec.sync) {
        return Err(FrameError::BadSync { kind: spec.name() });
    }
    let checksum_ok = checksum_matches(bytes, seed)?;
    if !checksum_ok {
        warn!(kind = spec.name(), "checksum mismatch, frame flagged");
    }

    let frame = match spec.kind {
        FrameKind::Config(kind) => {
            let record = match kind {
                ConfigKind::Hardware => ConfigRecord::Hardware(HardwareConfig::decode(bytes)?),
                ConfigKind::Head => ConfigRecord::Head(HeadConfig::decode(bytes)?),
                ConfigKind::User => ConfigRecord::User(bytes.to_vec()),
            };
            Frame::FixedConfig {
                kind,
                record,
                checksum_ok,
            }
        }
        FrameKind::Sample(name) => Frame::Sample {
            name,
            payload: bytes.to_vec(),
            checksum_ok,
        },
    };
    Ok(frame)
}

/// Decodes an ack-terminated reply (`payload` + `06 06`).
///
/// # Errors
///
/// Returns [`FrameError::BadLength`], [`FrameError::MissingAck`], or a codec
/// error for an undecodable clock.
pub fn decode_short_ack(
    kind: ShortAckKind,
    bytes: &[u8],
    family: &InstrumentFamily,
) -> Result<Frame, FrameError> {
    let expected = kind.payload_len() + ACK.len();
    if bytes.len() != expected {
        return Err(FrameError::BadLength {
            kind: kind.name(),
            expected,
            actual: bytes.len(),
        });
    }
    let (payload, terminator) = bytes.split_at(kind.payload_len());
    if terminator != ACK {
        return Err(FrameError::MissingAck { kind: kind.name() });
    }

    let record = match kind {
        ShortAckKind::Clock => ShortAckRecord::Clock(family.decode_clock(payload)?),
        ShortAckKind::Battery => ShortAckRecord::Battery(word_to_int(payload)?),
        ShortAckKind::Id => ShortAckRecord::Id(bytes_to_string(payload).trim().to_string()),
    };
    Ok(Frame::ShortAck {
        kind,
        record,
        terminator: [terminator[0], terminator[1]],
    })
}

/// Validates a configuration block read from the instrument or imported
/// from a blob, returning the block with any trailing ACK stripped.
///
/// Accepts either exactly `spec.length` bytes or `spec.length + 2` bytes
/// ending in `06 06`.  Unlike [`decode_frame`], a checksum mismatch is an error
/// here because the caller is about to trust every field.
///
/// # Errors
///
/// Returns [`FrameError::BadLength`], [`FrameError::MissingAck`],
/// [`FrameError::BadSync`], or [`FrameError::ChecksumMismatch`].
pub fn validate_block<'a>(
    bytes: &'a [u8],
    spec: &FrameSpec,
    seed: u16,
) -> Result<&'a [u8], FrameError> {
    let block = if bytes.len() == spec.length {
        bytes
    } else if bytes.len() == spec.length + ACK.len() {
        if !bytes.ends_with(ACK) {
            return Err(FrameError::MissingAck { kind: spec.name() });
        }
        &bytes[..spec.length]
    } else {
        return Err(FrameError::BadLength {
            kind: spec.name(),
            expected: spec.length + ACK.len(),
            actual: bytes.len(),
        });
    };

    if !block.starts_with(spec.sync) {
        return Err(FrameError::BadSync { kind: spec.name() });
    }
    let computed = checksum(block, block.len(), seed)?;
    let stored = stored_checksum(block)?;
    if computed != stored {
        return Err(FrameError::ChecksumMismatch { stored, computed });
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::VECTOR;
    use crate::protocol::codec::{int_to_word, seal_checksum};

    fn hardware_block() -> Vec<u8> {
        let mut block = vec![0u8; HW_CONFIG_LEN];
        block[..4].copy_from_slice(HW_CONFIG_SYNC);
        block[4..13].copy_from_slice(b"VEC 12345");
        block[18..20].copy_from_slice(&[0x01, 0x00]);
        block[20..22].copy_from_slice(&int_to_word(65_535));
        block[22..24].copy_from_slice(&int_to_word(4));
        block[24..26].copy_from_slice(&int_to_word(2));
        block[26..28].copy_from_slice(&int_to_word(0));
        block[28..30].copy_from_slice(&[0x01, 0x00]);
        block[42..46].copy_from_slice(b"3.36");
        seal_checksum(&mut block, VECTOR.checksum_seed).unwrap();
        block
    }

    fn head_block() -> Vec<u8> {
        let mut block = vec![0u8; HEAD_CONFIG_LEN];
        block[..4].copy_from_slice(HEAD_CONFIG_SYNC);
        block[4..6].copy_from_slice(&[0x0B, 0x00]);
        block[6..8].copy_from_slice(&int_to_word(6000));
        block[10..19].copy_from_slice(b"VEC 4943\0");
        block[220..222].copy_from_slice(&int_to_word(3));
        seal_checksum(&mut block, VECTOR.checksum_seed).unwrap();
        block
    }

    #[test]
    fn test_decode_hardware_config_fields_and_flags() {
        // Arrange
        let block = hardware_block();

        // Act
        let frame = decode_frame(&HARDWARE_CONFIG, &block, VECTOR.checksum_seed).unwrap();

        // Assert
        let Frame::FixedConfig {
            record: ConfigRecord::Hardware(hw),
            checksum_ok,
            ..
        } = frame
        else {
            panic!("expected hardware config");
        };
        assert!(checksum_ok);
        assert_eq!(hw.serial_number, "VEC 12345");
        assert_eq!(hw.board_frequency, 65_535);
        assert_eq!(hw.firmware_version, "3.36");
        assert!(hw.recorder_installed());
        assert!(!hw.compass_installed());
        assert!(hw.velocity_range());
    }

    #[test]
    fn test_decode_head_config_sensor_flags() {
        let block = head_block();
        let frame = decode_frame(&HEAD_CONFIG, &block, VECTOR.checksum_seed).unwrap();
        let Frame::FixedConfig {
            record: ConfigRecord::Head(head),
            ..
        } = frame
        else {
            panic!("expected head config");
        };
        // 0x0B = 0b1011
        assert!(head.pressure_sensor());
        assert!(head.magnetometer_sensor());
        assert!(!head.tilt_sensor());
        assert!(head.tilt_sensor_mounted_down());
        assert_eq!(head.head_frequency, 6000);
        assert_eq!(head.head_serial_number, "VEC 4943");
        assert_eq!(head.number_of_beams, 3);
    }

    #[test]
    fn test_bad_checksum_is_flagged_not_dropped() {
        // Arrange
        let mut block = hardware_block();
        block[20] ^= 0xFF;

        // Act
        let frame = decode_frame(&HARDWARE_CONFIG, &block, VECTOR.checksum_seed).unwrap();

        // Assert
        assert!(!frame.checksum_ok());
    }

    #[test]
    fn test_decode_frame_rejects_wrong_sync() {
        let mut block = hardware_block();
        block[1] = 0x99;
        assert_eq!(
            decode_frame(&HARDWARE_CONFIG, &block, VECTOR.checksum_seed),
            Err(FrameError::BadSync {
                kind: "hardware config"
            })
        );
    }

    #[test]
    fn test_decode_battery_reply() {
        let frame = decode_short_ack(ShortAckKind::Battery, b"\xe8\x2e\x06\x06", &VECTOR).unwrap();
        assert_eq!(
            frame,
            Frame::ShortAck {
                kind: ShortAckKind::Battery,
                record: ShortAckRecord::Battery(0x2EE8),
                terminator: [0x06, 0x06],
            }
        );
    }

    #[test]
    fn test_decode_id_reply_trims_padding() {
        let frame = decode_short_ack(ShortAckKind::Id, b"VEC 8181      \x06\x06", &VECTOR).unwrap();
        let Frame::ShortAck {
            record: ShortAckRecord::Id(id),
            ..
        } = frame
        else {
            panic!("expected id");
        };
        assert_eq!(id, "VEC 8181");
    }

    #[test]
    fn test_short_ack_without_terminator_fails() {
        let err = decode_short_ack(ShortAckKind::Battery, b"\xe8\x2e\x15\x15", &VECTOR).unwrap_err();
        assert_eq!(err, FrameError::MissingAck { kind: "battery" });
    }

    #[test]
    fn test_validate_block_accepts_optional_ack() {
        // Arrange
        let block = hardware_block();
        let mut with_ack = block.clone();
        with_ack.extend_from_slice(ACK);

        // Act / Assert
        assert_eq!(
            validate_block(&block, &HARDWARE_CONFIG, VECTOR.checksum_seed).unwrap(),
            &block[..]
        );
        assert_eq!(
            validate_block(&with_ack, &HARDWARE_CONFIG, VECTOR.checksum_seed).unwrap(),
            &block[..]
        );
    }

    #[test]
    fn test_validate_block_rejects_checksum_and_length() {
        let mut block = hardware_block();
        block[30] = 0x7F;
        assert!(matches!(
            validate_block(&block, &HARDWARE_CONFIG, VECTOR.checksum_seed),
            Err(FrameError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            validate_block(&block[..40], &HARDWARE_CONFIG, VECTOR.checksum_seed),
            Err(FrameError::BadLength { .. })
        ));
    }
}
