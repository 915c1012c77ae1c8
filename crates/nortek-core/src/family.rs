//! Per-family constants: checksum seed, clock layout and sample frames.
//!
//! Instruments in the Nortek line share the command set and configuration
//! blocks, but their sample records differ and nothing guarantees the checksum
//! seed or clock encoding stays fixed across product generations.  Every
//! codec call that depends on one of these takes it from an
//! [`InstrumentFamily`] instead of a hard-coded constant.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::protocol::codec::{datetime_to_words, words_to_datetime, CodecError, DATETIME_LEN};
use crate::protocol::frames::{FrameKind, FrameSpec, HARDWARE_CONFIG, HEAD_CONFIG, USER_CONFIG};

/// Checksum seed used by every current Nortek instrument.
pub const NORTEK_CHECKSUM_SEED: u16 = 0xB58C;

/// One field of the six-byte packed-BCD clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockField {
    Minute,
    Second,
    Day,
    Hour,
    Year,
    Month,
}

/// Wire order of the clock fields for the reference families.
pub const NORTEK_CLOCK_ORDER: [ClockField; DATETIME_LEN] = [
    ClockField::Minute,
    ClockField::Second,
    ClockField::Day,
    ClockField::Hour,
    ClockField::Year,
    ClockField::Month,
];

/// Instrument clock reading with a two-digit year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockReading {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl ClockReading {
    fn field(&self, field: ClockField) -> u8 {
        match field {
            ClockField::Minute => self.minute,
            ClockField::Second => self.second,
            ClockField::Day => self.day,
            ClockField::Hour => self.hour,
            ClockField::Year => self.year,
            ClockField::Month => self.month,
        }
    }

    fn field_mut(&mut self, field: ClockField) -> &mut u8 {
        match field {
            ClockField::Minute => &mut self.minute,
            ClockField::Second => &mut self.second,
            ClockField::Day => &mut self.day,
            ClockField::Hour => &mut self.hour,
            ClockField::Year => &mut self.year,
            ClockField::Month => &mut self.month,
        }
    }

    /// Builds a reading from calendar time, keeping the last two year digits.
    pub fn from_datetime(time: &NaiveDateTime) -> Self {
        use chrono::{Datelike, Timelike};
        Self {
            year: time.year().rem_euclid(100) as u8,
            month: time.month() as u8,
            day: time.day() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
        }
    }

    /// Calendar time for this reading, or `None` if the fields are not a valid date.
    pub fn to_datetime(&self, century: i32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            century + self.year as i32,
            self.month as u32,
            self.day as u32,
        )?
        .and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
    }
}

/// Everything that varies between instrument families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentFamily {
    pub name: &'static str,
    pub checksum_seed: u16,
    pub clock_order: [ClockField; DATETIME_LEN],
    /// Added to the two-digit clock year.
    pub century: i32,
    /// Sample frames the chunker recognises in addition to the config blocks.
    pub samples: &'static [FrameSpec],
}

const VECTOR_SAMPLES: &[FrameSpec] = &[
    FrameSpec {
        kind: FrameKind::Sample("vector velocity"),
        sync: b"\xa5\x10",
        length: 24,
    },
    FrameSpec {
        kind: FrameKind::Sample("vector system"),
        sync: b"\xa5\x11",
        length: 28,
    },
    FrameSpec {
        kind: FrameKind::Sample("vector velocity header"),
        sync: b"\xa5\x12",
        length: 42,
    },
];

const AQUADOPP_SAMPLES: &[FrameSpec] = &[FrameSpec {
    kind: FrameKind::Sample("aquadopp velocity"),
    sync: b"\xa5\x01",
    length: 42,
}];

pub const VECTOR: InstrumentFamily = InstrumentFamily {
    name: "vector",
    checksum_seed: NORTEK_CHECKSUM_SEED,
    clock_order: NORTEK_CLOCK_ORDER,
    century: 2000,
    samples: VECTOR_SAMPLES,
};

pub const AQUADOPP: InstrumentFamily = InstrumentFamily {
    name: "aquadopp",
    checksum_seed: NORTEK_CHECKSUM_SEED,
    clock_order: NORTEK_CLOCK_ORDER,
    century: 2000,
    samples: AQUADOPP_SAMPLES,
};

impl InstrumentFamily {
    /// Looks up a built-in family by its configuration name.
    pub fn by_name(name: &str) -> Option<&'static InstrumentFamily> {
        [&VECTOR, &AQUADOPP]
            .into_iter()
            .find(|family| family.name.eq_ignore_ascii_case(name))
    }

    /// Config blocks first, then the family's samples.
    pub fn frame_specs(&self) -> Vec<FrameSpec> {
        let mut specs = vec![USER_CONFIG, HARDWARE_CONFIG, HEAD_CONFIG];
        specs.extend_from_slice(self.samples);
        specs
    }

    /// Decodes a six-byte packed-BCD clock in this family's field order.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for a wrong-length buffer or a non-BCD byte.
    pub fn decode_clock(&self, bytes: &[u8]) -> Result<ClockReading, CodecError> {
        let values = words_to_datetime(bytes)?;
        let mut reading = ClockReading {
            year: 0,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            second: 0,
        };
        for (field, value) in self.clock_order.iter().zip(values) {
            *reading.field_mut(*field) = value;
        }
        Ok(reading)
    }

    /// Inverse of [`InstrumentFamily::decode_clock`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ValueOutOfRange`] if a field exceeds 99.
    pub fn encode_clock(&self, reading: &ClockReading) -> Result<[u8; DATETIME_LEN], CodecError> {
        let mut values = [0u8; DATETIME_LEN];
        for (slot, field) in values.iter_mut().zip(self.clock_order) {
            *slot = reading.field(field);
        }
        datetime_to_words(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_clock_follows_minute_second_day_hour_year_month() {
        // Arrange
        let bytes = [0x45, 0x30, 0x17, 0x08, 0x24, 0x06];

        // Act
        let reading = VECTOR.decode_clock(&bytes).unwrap();

        // Assert
        assert_eq!(
            reading,
            ClockReading {
                year: 24,
                month: 6,
                day: 17,
                hour: 8,
                minute: 45,
                second: 30,
            }
        );
        assert_eq!(VECTOR.encode_clock(&reading).unwrap(), bytes);
    }

    #[test]
    fn test_clock_reading_to_calendar_time() {
        let reading = ClockReading {
            year: 24,
            month: 2,
            day: 29,
            hour: 23,
            minute: 59,
            second: 58,
        };
        let time = reading.to_datetime(VECTOR.century).unwrap();
        assert_eq!(time.to_string(), "2024-02-29 23:59:58");
        assert_eq!(ClockReading::from_datetime(&time), reading);
    }

    #[test]
    fn test_invalid_calendar_fields_give_none() {
        let reading = ClockReading {
            year: 23,
            month: 2,
            day: 30,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert!(reading.to_datetime(2000).is_none());
    }

    #[test]
    fn test_family_lookup_is_case_insensitive() {
        assert_eq!(InstrumentFamily::by_name("Vector"), Some(&VECTOR));
        assert_eq!(InstrumentFamily::by_name("aquadopp"), Some(&AQUADOPP));
        assert!(InstrumentFamily::by_name("signature").is_none());
    }

    #[test]
    fn test_frame_specs_list_config_blocks_before_samples() {
        let specs = VECTOR.frame_specs();
        assert_eq!(specs.len(), 6);
        assert_eq!(specs[0], USER_CONFIG);
        assert_eq!(specs[3].length, 24);
    }
}
