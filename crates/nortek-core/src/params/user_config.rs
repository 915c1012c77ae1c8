//! The Nortek user configuration block (`GC` / `CC`), field by field.
//!
//! Offsets are byte positions inside the 512-byte block.  The fields tile
//! bytes 4..510 exactly; bytes 0..4 are the sync header and 510..512 the
//! checksum.

use super::{FieldCodec, Parameter, ParameterRegistry, RegistryError, Value, Visibility};
use crate::family::InstrumentFamily;
use crate::protocol::codec::bytes_to_bitfield;

pub const TRANSMIT_PULSE_LENGTH: &str = "TransmitPulseLength";
pub const BLANKING_DISTANCE: &str = "BlankingDistance";
pub const RECEIVE_LENGTH: &str = "ReceiveLength";
pub const TIME_BETWEEN_PINGS: &str = "TimeBetweenPings";
pub const TIME_BETWEEN_BURST_SEQUENCES: &str = "TimeBetweenBurstSequences";
pub const NUMBER_PINGS: &str = "NumberPings";
pub const AVG_INTERVAL: &str = "AvgInterval";
pub const USER_NUMBER_BEAMS: &str = "UserNumberOfBeams";
pub const TIMING_CONTROL_REGISTER: &str = "TimingControlRegister";
pub const POWER_CONTROL_REGISTER: &str = "PowerControlRegister";
pub const A1_1_SPARE: &str = "A1_1Spare";
pub const B0_1_SPARE: &str = "B0_1Spare";
pub const B1_1_SPARE: &str = "B1_1Spare";
pub const COMPASS_UPDATE_RATE: &str = "CompassUpdateRate";
pub const COORDINATE_SYSTEM: &str = "CoordinateSystem";
pub const NUMBER_BINS: &str = "NumberOfBins";
pub const BIN_LENGTH: &str = "BinLength";
pub const MEASUREMENT_INTERVAL: &str = "MeasurementInterval";
pub const DEPLOYMENT_NAME: &str = "DeploymentName";
pub const WRAP_MODE: &str = "WrapMode";
pub const CLOCK_DEPLOY: &str = "ClockDeploy";
pub const DIAGNOSTIC_INTERVAL: &str = "DiagnosticInterval";
pub const MODE: &str = "Mode";
pub const ADJUSTMENT_SOUND_SPEED: &str = "AdjustmentSoundSpeed";
pub const NUMBER_SAMPLES_DIAGNOSTIC: &str = "NumberSamplesInDiagMode";
pub const NUMBER_BEAMS_CELL_DIAGNOSTIC: &str = "NumberBeamsPerCellInDiagMode";
pub const NUMBER_PINGS_DIAGNOSTIC: &str = "NumberPingsInDiagMode";
pub const MODE_TEST: &str = "ModeTest";
pub const ANALOG_INPUT_ADDR: &str = "AnalogInputAddress";
pub const SW_VERSION: &str = "SwVersion";
pub const USER_1_SPARE: &str = "User1Spare";
pub const VELOCITY_ADJ_TABLE: &str = "VelocityAdjTable";
pub const COMMENTS: &str = "Comments";
pub const WAVE_MEASUREMENT_MODE: &str = "WaveMeasurementMode";
pub const DYN_PERCENTAGE_POSITION: &str = "PercentageForCellPositioning";
pub const WAVE_TRANSMIT_PULSE: &str = "WaveTransmitPulse";
pub const WAVE_BLANKING_DISTANCE: &str = "WaveBlankingDistance";
pub const WAVE_CELL_SIZE: &str = "WaveCellSize";
pub const NUMBER_DIAG_SAMPLES: &str = "NumberDiagnosticSamples";
pub const A1_2_SPARE: &str = "A1_2Spare";
pub const B0_2_SPARE: &str = "B0_2Spare";
pub const NUMBER_SAMPLES_PER_BURST: &str = "NumberSamplesPerBurst";
pub const USER_2_SPARE: &str = "User2Spare";
pub const ANALOG_OUTPUT_SCALE: &str = "AnalogOutputScale";
pub const CORRELATION_THRESHOLD: &str = "CorrelationThreshold";
pub const USER_3_SPARE: &str = "User3Spare";
pub const TRANSMIT_PULSE_LENGTH_SECOND_LAG: &str = "TransmitPulseLengthSecondLag";
pub const USER_4_SPARE: &str = "User4Spare";
pub const QUAL_CONSTANTS: &str = "StageMatchFilterConstants";

/// Driver-side scheduling intervals (`HH:MM:SS`, `00:00:00` disables).
pub const CLOCK_SYNC_INTERVAL: &str = "ClockSyncInterval";
pub const ACQUIRE_STATUS_INTERVAL: &str = "AcquireStatusInterval";

/// Field width of [`DEPLOYMENT_NAME`].
pub const DEPLOYMENT_NAME_LEN: usize = 6;
/// Field width of [`COMMENTS`].
pub const COMMENTS_LEN: usize = 180;

const DISABLED_INTERVAL: &str = "00:00:00";

fn word(name: &str, offset: usize) -> Parameter {
    Parameter::new(name, FieldCodec::Word)
        .at(offset, 2)
        .visibility(Visibility::ReadOnly)
}

fn read_write(name: &str, offset: usize) -> Parameter {
    word(name, offset).visibility(Visibility::ReadWrite)
}

fn flags(name: &str, offset: usize) -> Parameter {
    Parameter::new(name, FieldCodec::Flags)
        .at(offset, 2)
        .visibility(Visibility::ReadOnly)
}

fn spare(name: &str, offset: usize, length: usize) -> Parameter {
    Parameter::new(name, FieldCodec::Spare)
        .at(offset, length)
        .visibility(Visibility::ReadOnly)
        .default_value(Value::Blob(vec![0; length]))
}

fn interval(name: &str) -> Parameter {
    Parameter::new(name, FieldCodec::Interval)
        .visibility(Visibility::Immutable)
        .default_value(Value::Str(DISABLED_INTERVAL.to_string()))
        .startup()
}

/// Every user configuration field plus the driver-side intervals, in block order.
pub fn user_config_parameters() -> Vec<Parameter> {
    vec![
        read_write(TRANSMIT_PULSE_LENGTH, 4).default_value(Value::Int(2)).startup(),
        read_write(BLANKING_DISTANCE, 6).default_value(Value::Int(16)).startup(),
        read_write(RECEIVE_LENGTH, 8).default_value(Value::Int(7)).startup(),
        read_write(TIME_BETWEEN_PINGS, 10).startup(),
        word(TIME_BETWEEN_BURST_SEQUENCES, 12),
        word(NUMBER_PINGS, 14),
        read_write(AVG_INTERVAL, 16)
            .default_value(Value::Int(32))
            .init_value(Value::Int(60))
            .startup(),
        word(USER_NUMBER_BEAMS, 18).default_value(Value::Int(3)).direct_access(),
        flags(TIMING_CONTROL_REGISTER, 20),
        flags(POWER_CONTROL_REGISTER, 22),
        spare(A1_1_SPARE, 24, 2),
        spare(B0_1_SPARE, 26, 2),
        spare(B1_1_SPARE, 28, 2),
        word(COMPASS_UPDATE_RATE, 30)
            .default_value(Value::Int(1))
            .init_value(Value::Int(2))
            .startup()
            .direct_access(),
        read_write(COORDINATE_SYSTEM, 32)
            .default_value(Value::Int(0))
            .init_value(Value::Int(1))
            .startup(),
        word(NUMBER_BINS, 34).default_value(Value::Int(1)).startup().direct_access(),
        word(BIN_LENGTH, 36).default_value(Value::Int(7)).startup().direct_access(),
        word(MEASUREMENT_INTERVAL, 38)
            .default_value(Value::Int(3600))
            .init_value(Value::Int(3600))
            .startup()
            .direct_access(),
        Parameter::new(DEPLOYMENT_NAME, FieldCodec::Text)
            .at(40, DEPLOYMENT_NAME_LEN)
            .visibility(Visibility::ReadOnly),
        word(WRAP_MODE, 46),
        Parameter::new(CLOCK_DEPLOY, FieldCodec::DateTime)
            .at(48, 6)
            .visibility(Visibility::ReadOnly),
        Parameter::new(DIAGNOSTIC_INTERVAL, FieldCodec::DoubleWord)
            .at(54, 4)
            .visibility(Visibility::ReadOnly)
            .default_value(Value::Int(10_800))
            .init_value(Value::Int(43_200))
            .startup()
            .direct_access(),
        flags(MODE, 58)
            .default_value(Value::Bits(bytes_to_bitfield(&[96, 0])))
            .startup()
            .direct_access(),
        read_write(ADJUSTMENT_SOUND_SPEED, 60).default_value(Value::Int(1525)).startup(),
        word(NUMBER_SAMPLES_DIAGNOSTIC, 62)
            .default_value(Value::Int(1))
            .init_value(Value::Int(20))
            .startup()
            .direct_access(),
        word(NUMBER_BEAMS_CELL_DIAGNOSTIC, 64)
            .default_value(Value::Int(1))
            .startup()
            .direct_access(),
        word(NUMBER_PINGS_DIAGNOSTIC, 66)
            .default_value(Value::Int(1))
            .startup()
            .direct_access(),
        flags(MODE_TEST, 68).startup().direct_access(),
        word(ANALOG_INPUT_ADDR, 70),
        word(SW_VERSION, 72),
        spare(USER_1_SPARE, 74, 2),
        Parameter::new(VELOCITY_ADJ_TABLE, FieldCodec::Blob)
            .at(76, 180)
            .visibility(Visibility::ReadOnly)
            .direct_access(),
        Parameter::new(COMMENTS, FieldCodec::Text)
            .at(256, COMMENTS_LEN)
            .visibility(Visibility::ReadOnly)
            .startup()
            .direct_access(),
        flags(WAVE_MEASUREMENT_MODE, 436),
        word(DYN_PERCENTAGE_POSITION, 438),
        word(WAVE_TRANSMIT_PULSE, 440),
        word(WAVE_BLANKING_DISTANCE, 442),
        word(WAVE_CELL_SIZE, 444),
        word(NUMBER_DIAG_SAMPLES, 446),
        spare(A1_2_SPARE, 448, 2),
        spare(B0_2_SPARE, 450, 2),
        word(NUMBER_SAMPLES_PER_BURST, 452).default_value(Value::Int(0)),
        spare(USER_2_SPARE, 454, 2),
        word(ANALOG_OUTPUT_SCALE, 456).startup(),
        read_write(CORRELATION_THRESHOLD, 458)
            .default_value(Value::Int(0))
            .startup()
            .direct_access(),
        spare(USER_3_SPARE, 460, 2),
        word(TRANSMIT_PULSE_LENGTH_SECOND_LAG, 462)
            .default_value(Value::Int(2))
            .startup()
            .direct_access(),
        spare(USER_4_SPARE, 464, 30),
        Parameter::new(QUAL_CONSTANTS, FieldCodec::Blob)
            .at(494, 16)
            .visibility(Visibility::ReadOnly)
            .startup()
            .direct_access(),
        interval(CLOCK_SYNC_INTERVAL),
        interval(ACQUIRE_STATUS_INTERVAL),
    ]
}

/// A registry holding every Nortek user configuration parameter, not yet sealed.
///
/// # Errors
///
/// Only fails if the table itself contains a duplicate name.
pub fn nortek_registry(family: &InstrumentFamily) -> Result<ParameterRegistry, RegistryError> {
    let mut registry = ParameterRegistry::new(family.checksum_seed);
    for param in user_config_parameters() {
        registry.add_parameter(param)?;
    }
    Ok(registry)
}
