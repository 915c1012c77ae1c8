//! Command vocabulary, prompts and mode sentinels of the Nortek command set.
//!
//! Nortek commands are two ASCII letters with no line terminator.  Replies
//! end with a two-byte acknowledgment (`06 06`) or negative acknowledgment
//! (`15 15`); a handful of textual prompts are emitted around break sequences.

/// Acknowledgment terminator.
pub const ACK: &[u8] = b"\x06\x06";
/// Negative acknowledgment terminator.
pub const NACK: &[u8] = b"\x15\x15";

/// Every command the driver sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentCommand {
    /// Write a user configuration block (followed by the 512-byte block).
    Configure,
    /// First half of the soft break.
    SoftBreakFirst,
    /// Second half of the soft break.
    SoftBreakSecond,
    ReadClock,
    /// Set clock (followed by six packed-BCD bytes).
    SetClock,
    /// Ask the instrument which mode it is in.
    WhatMode,
    ReadUserConfig,
    ReadHardwareConfig,
    ReadHeadConfig,
    PowerDown,
    ReadBatteryVoltage,
    ReadId,
    /// Start measurement without recorder.
    StartMeasurement,
    /// Acquire one sample.
    AcquireData,
    /// Confirm entry into command mode after a break.
    Confirmation,
    /// Read every configuration block in one reply.
    GetAll,
}

impl InstrumentCommand {
    /// The bytes written to the transport for this command.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Configure => b"CC",
            Self::SoftBreakFirst => b"@@@@@@",
            Self::SoftBreakSecond => b"K1W%!Q",
            Self::ReadClock => b"RC",
            Self::SetClock => b"SC",
            Self::WhatMode => b"II",
            Self::ReadUserConfig => b"GC",
            Self::ReadHardwareConfig => b"GP",
            Self::ReadHeadConfig => b"GH",
            Self::PowerDown => b"PD",
            Self::ReadBatteryVoltage => b"BV",
            Self::ReadId => b"ID",
            Self::StartMeasurement => b"ST",
            Self::AcquireData => b"AD",
            Self::Confirmation => b"MC",
            Self::GetAll => b"GA",
        }
    }

    /// Builds the command followed by a binary payload.
    pub fn with_payload(self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.as_bytes().len() + payload.len());
        out.extend_from_slice(self.as_bytes());
        out.extend_from_slice(payload);
        out
    }
}

impl std::fmt::Display for InstrumentCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Prompts the instrument emits, in the order the mode probe checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    CommandMode,
    Confirmation,
    Ack,
    Nack,
}

impl Prompt {
    /// Probe order: the first contained prompt that is not `Nack` wins.
    pub const PROBE_ORDER: [Prompt; 4] = [
        Prompt::CommandMode,
        Prompt::Confirmation,
        Prompt::Ack,
        Prompt::Nack,
    ];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::CommandMode => b"Command mode",
            Self::Confirmation => b"Confirm:",
            Self::Ack => ACK,
            Self::Nack => NACK,
        }
    }

    /// Finds the winning prompt in an accumulated reply buffer.
    ///
    /// Containment is used rather than an exact frame match, so stray bytes
    /// that happen to spell a prompt produce a false positive.
    pub fn first_match(buffer: &[u8]) -> Option<Prompt> {
        Self::PROBE_ORDER
            .into_iter()
            .filter(|p| *p != Prompt::Nack)
            .find(|p| contains(buffer, p.as_bytes()))
    }
}

/// Mode sentinels returned inside the reply to [`InstrumentCommand::WhatMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSentinel {
    FirmwareUpgrade,
    Measurement,
    Command,
    DataRetrieval,
    Confirmation,
}

impl ModeSentinel {
    pub const ALL: [ModeSentinel; 5] = [
        ModeSentinel::FirmwareUpgrade,
        ModeSentinel::Measurement,
        ModeSentinel::Command,
        ModeSentinel::DataRetrieval,
        ModeSentinel::Confirmation,
    ];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::FirmwareUpgrade => b"\x00\x00\x06\x06",
            Self::Measurement => b"\x01\x00\x06\x06",
            Self::Command => b"\x02\x00\x06\x06",
            Self::DataRetrieval => b"\x04\x00\x06\x06",
            Self::Confirmation => b"\x05\x00\x06\x06",
        }
    }

    /// First sentinel contained anywhere in `buffer`.
    pub fn find_in(buffer: &[u8]) -> Option<ModeSentinel> {
        Self::ALL
            .into_iter()
            .find(|s| contains(buffer, s.as_bytes()))
    }
}

/// Byte-slice substring search.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

/// Offset of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
