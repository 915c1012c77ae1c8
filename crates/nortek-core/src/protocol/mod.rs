//! Protocol module: field codecs, frame kinds, command vocabulary and the chunker.

pub mod chunker;
pub mod codec;
pub mod commands;
pub mod frames;

pub use chunker::{Chunk, ChunkKind, FrameRange, PendingFrame, Sieve, StreamChunker};
pub use codec::CodecError;
pub use commands::{InstrumentCommand, ModeSentinel, Prompt, ACK, NACK};
pub use frames::{
    decode_frame, decode_short_ack, validate_block, ConfigKind, ConfigRecord, Frame, FrameError,
    FrameKind, FrameSpec, ShortAckKind, ShortAckRecord,
};
