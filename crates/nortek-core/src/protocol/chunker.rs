//! Stream chunker: finds complete, checksummed frames in an accumulating buffer.
//!
//! # How the sieve works (for beginners)
//!
//! Bytes from a serial line arrive in arbitrary pieces.  A 512-byte
//! configuration block may come in as 300 bytes now and 212 bytes later, and
//! noise or partial frames may sit in between.  The [`Sieve`] looks at the
//! whole buffer each time and reports the `(start, end)` ranges that are
//! definitely complete frames:
//!
//! 1. For every known `(sync marker, length)` pair, find each occurrence of the
//!    marker.  If the buffer holds `length` bytes from there and the trailing
//!    checksum matches, that range is a frame; scanning resumes after it.
//!    Otherwise the scan moves on by a single byte, so sync-like bytes inside
//!    a payload cannot wedge it.
//! 2. Short replies such as the battery voltage carry no sync marker or
//!    checksum.  The command layer holds the reply bytes back with
//!    [`StreamChunker::append`], registers them as a [`PendingFrame`], and
//!    only then scans.  A second pass finds each registration once; a
//!    registration the scan cannot find is dropped, never carried over.
//! 3. Overlapping candidates are resolved in favour of the lower start offset.
//!
//! The sieve never mutates the buffer.  [`StreamChunker`] owns a buffer,
//! runs the sieve after every append, and evicts bytes once the ranges before
//! them have been delivered.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::protocol::commands::find;
use crate::protocol::frames::{checksum_matches, FrameSpec, ShortAckKind};

/// A dynamically registered ack-terminated reply, matched by exact content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFrame {
    pub kind: ShortAckKind,
    pub pattern: Vec<u8>,
}

/// What kind of frame a range holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Fixed(FrameSpec),
    Pending(ShortAckKind),
}

/// A half-open `[start, end)` byte range holding one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub start: usize,
    pub end: usize,
    pub kind: ChunkKind,
}

impl FrameRange {
    fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end && self.start < end
    }
}

/// Stateless frame scanner over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct Sieve {
    specs: Vec<FrameSpec>,
    seed: u16,
}

impl Sieve {
    pub fn new(specs: Vec<FrameSpec>, seed: u16) -> Self {
        Self { specs, seed }
    }

    /// Longest registered fixed frame.
    pub fn max_frame_len(&self) -> usize {
        self.specs.iter().map(|s| s.length).max().unwrap_or(0)
    }

    /// Returns every complete frame range in `buffer`, ordered by start offset.
    ///
    /// Matched pending registrations are removed from `pending`; the rest stay
    /// queued for a later call.
    pub fn scan(&self, buffer: &[u8], pending: &mut VecDeque<PendingFrame>) -> Vec<FrameRange> {
        let mut candidates = Vec::new();
        for spec in &self.specs {
            self.scan_fixed(spec, buffer, &mut candidates);
        }
        candidates.sort_by_key(|r| r.start);

        let mut ranges: Vec<FrameRange> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match ranges.last() {
                Some(last) if candidate.start < last.end => {
                    debug!(start = candidate.start, "dropping overlapping candidate");
                }
                _ => ranges.push(candidate),
            }
        }

        let mut still_pending = VecDeque::with_capacity(pending.len());
        while let Some(registration) = pending.pop_front() {
            match find_unclaimed(buffer, &registration.pattern, &ranges) {
                Some(start) => {
                    let range = FrameRange {
                        start,
                        end: start + registration.pattern.len(),
                        kind: ChunkKind::Pending(registration.kind),
                    };
                    let at = ranges.partition_point(|r| r.start < start);
                    ranges.insert(at, range);
                }
                None => still_pending.push_back(registration),
            }
        }
        *pending = still_pending;

        ranges
    }

    fn scan_fixed(&self, spec: &FrameSpec, buffer: &[u8], out: &mut Vec<FrameRange>) {
        let mut cursor = 0;
        while cursor < buffer.len() {
            let Some(offset) = find(&buffer[cursor..], spec.sync) else {
                break;
            };
            let start = cursor + offset;
            let end = start + spec.length;
            if end > buffer.len() {
                // incomplete; every later occurrence is too
                break;
            }
            match checksum_matches(&buffer[start..end], self.seed) {
                Ok(true) => {
                    out.push(FrameRange {
                        start,
                        end,
                        kind: ChunkKind::Fixed(*spec),
                    });
                    cursor = end;
                }
                _ => cursor = start + 1,
            }
        }
    }
}

fn find_unclaimed(buffer: &[u8], pattern: &[u8], claimed: &[FrameRange]) -> Option<usize> {
    let mut cursor = 0;
    while cursor < buffer.len() {
        let start = cursor + find(&buffer[cursor..], pattern)?;
        let end = start + pattern.len();
        if !claimed.iter().any(|r| r.overlaps(start, end)) {
            return Some(start);
        }
        cursor = start + 1;
    }
    None
}

// ── Buffered chunker ──────────────────────────────────────────────────────────

/// One extracted frame, copied out of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub bytes: Vec<u8>,
}

/// Owns the receive buffer, the sieve, and the pending-frame queue.
#[derive(Debug)]
pub struct StreamChunker {
    sieve: Sieve,
    buffer: Vec<u8>,
    pending: VecDeque<PendingFrame>,
    max_buffer: usize,
}

impl StreamChunker {
    /// `max_buffer` bounds how much unmatched data is retained.  It is raised
    /// to twice the longest frame if smaller.
    pub fn new(sieve: Sieve, max_buffer: usize) -> Self {
        let max_buffer = max_buffer.max(sieve.max_frame_len() * 2);
        Self {
            sieve,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            max_buffer,
        }
    }

    /// Appends freshly received bytes and returns every frame now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Chunk> {
        self.buffer.extend_from_slice(bytes);
        self.drain()
    }

    /// Buffers bytes without scanning them.
    ///
    /// Used while a reply is still being collected, so that its registration
    /// is in place before [`StreamChunker::drain`] sees the bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Queues an ack-terminated reply for the next scan only.
    pub fn expect(&mut self, kind: ShortAckKind, pattern: Vec<u8>) {
        self.pending.push_back(PendingFrame { kind, pattern });
    }

    /// Re-scans the buffer, delivers complete frames, and evicts consumed bytes.
    ///
    /// Registrations the scan did not match are dropped.
    pub fn drain(&mut self) -> Vec<Chunk> {
        let ranges = self.sieve.scan(&self.buffer, &mut self.pending);
        for stale in self.pending.drain(..) {
            warn!(kind = stale.kind.name(), "expected reply not found, dropping registration");
        }

        let mut skipped = 0;
        let mut cursor = 0;
        let chunks: Vec<Chunk> = ranges
            .iter()
            .map(|range| {
                skipped += range.start - cursor;
                cursor = range.end;
                Chunk {
                    kind: range.kind,
                    bytes: self.buffer[range.start..range.end].to_vec(),
                }
            })
            .collect();

        if skipped > 0 {
            warn!(bytes = skipped, "discarding unframed bytes before delivered frames");
        }
        self.buffer.drain(..cursor);

        if self.buffer.len() > self.max_buffer {
            let keep = self.sieve.max_frame_len();
            let excess = self.buffer.len() - keep;
            warn!(bytes = excess, "receive buffer over limit, discarding oldest bytes");
            self.buffer.drain(..excess);
        }

        chunks
    }

    /// Bytes not yet attributed to a frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drops buffered bytes and pending registrations.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{NORTEK_CHECKSUM_SEED, VECTOR};
    use crate::protocol::codec::seal_checksum;
    use crate::protocol::frames::{FrameKind, HARDWARE_CONFIG, HW_CONFIG_LEN, HW_CONFIG_SYNC};

    fn hardware_frame(fill: u8) -> Vec<u8> {
        let mut block = vec![fill; HW_CONFIG_LEN];
        block[..4].copy_from_slice(HW_CONFIG_SYNC);
        seal_checksum(&mut block, NORTEK_CHECKSUM_SEED).unwrap();
        block
    }

    fn velocity_frame(counter: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 24];
        frame[0] = 0xA5;
        frame[1] = 0x10;
        frame[3] = counter;
        seal_checksum(&mut frame, NORTEK_CHECKSUM_SEED).unwrap();
        frame
    }

    fn sieve() -> Sieve {
        Sieve::new(VECTOR.frame_specs(), VECTOR.checksum_seed)
    }

    #[test]
    fn test_scan_finds_back_to_back_frames() {
        // Arrange
        let mut buffer = hardware_frame(0x11);
        buffer.extend(velocity_frame(1));
        buffer.extend(velocity_frame(2));

        // Act
        let ranges = sieve().scan(&buffer, &mut VecDeque::new());

        // Assert
        let spans: Vec<_> = ranges.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(spans, vec![(0, 48), (48, 72), (72, 96)]);
        assert_eq!(ranges[0].kind, ChunkKind::Fixed(HARDWARE_CONFIG));
    }

    #[test]
    fn test_scan_is_idempotent_over_unchanged_buffer() {
        let mut buffer = velocity_frame(7);
        buffer.extend_from_slice(b"\x00\x01\x02");
        let s = sieve();

        let first = s.scan(&buffer, &mut VecDeque::new());
        let second = s.scan(&buffer, &mut VecDeque::new());

        assert_eq!(first, second);
    }

    #[test]
    fn test_noise_between_frames_does_not_change_result() {
        // Arrange
        let a = velocity_frame(1);
        let b = hardware_frame(0x22);
        let mut clean = a.clone();
        clean.extend(&b);
        let mut noisy = b"\x01\x02\x03\x7f".to_vec();
        noisy.extend(&a);
        noisy.extend_from_slice(b"\x00\x42\x10\x99\xa5");
        noisy.extend(&b);
        noisy.extend_from_slice(b"\xa5\x10\x00");
        let s = sieve();

        // Act
        let clean_frames: Vec<Vec<u8>> = s
            .scan(&clean, &mut VecDeque::new())
            .iter()
            .map(|r| clean[r.start..r.end].to_vec())
            .collect();
        let noisy_frames: Vec<Vec<u8>> = s
            .scan(&noisy, &mut VecDeque::new())
            .iter()
            .map(|r| noisy[r.start..r.end].to_vec())
            .collect();

        // Assert
        assert_eq!(clean_frames, noisy_frames);
        assert_eq!(noisy_frames.len(), 2);
    }

    #[test]
    fn test_sync_inside_payload_does_not_wedge_scan() {
        // A bad frame whose payload contains a real frame's sync marker.
        let mut buffer = vec![0xA5, 0x10, 0x00, 0x00, 0xFF, 0xFF];
        buffer.extend(velocity_frame(3));
        let ranges = sieve().scan(&buffer, &mut VecDeque::new());
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 6);
    }

    #[test]
    fn test_pending_frame_matched_once() {
        // Arrange
        let reply = b"\xe8\x2e\x06\x06".to_vec();
        let mut buffer = reply.clone();
        buffer.extend_from_slice(&reply);
        let mut pending = VecDeque::from([PendingFrame {
            kind: ShortAckKind::Battery,
            pattern: reply.clone(),
        }]);

        // Act
        let ranges = sieve().scan(&buffer, &mut pending);

        // Assert
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].kind, ChunkKind::Pending(ShortAckKind::Battery));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unmatched_registrations_do_not_outlive_their_scan() {
        // Arrange
        let mut chunker = StreamChunker::new(sieve(), 1024);
        for _ in 0..101 {
            chunker.expect(ShortAckKind::Battery, b"\x11\x22\x06\x06".to_vec());
        }

        // Act
        let first = chunker.push(b"noise");
        let later = chunker.push(b"\x00\x11\x22\x06\x06");

        // Assert
        assert!(first.is_empty());
        assert_eq!(chunker.pending_len(), 0);
        assert!(later.is_empty());
    }

    #[test]
    fn test_held_reply_is_framed_in_arrival_order() {
        // Arrange
        let reply = b"\xe8\x2e\x06\x06".to_vec();
        let sample = velocity_frame(4);
        let mut chunker = StreamChunker::new(sieve(), 1024);
        chunker.append(&reply);
        chunker.append(&sample);

        // Act
        chunker.expect(ShortAckKind::Battery, reply.clone());
        let chunks = chunker.drain();

        // Assert
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].kind, ChunkKind::Pending(ShortAckKind::Battery));
        assert_eq!(chunks[0].bytes, reply);
        assert_eq!(chunks[1].bytes, sample);
        assert!(chunker.buffered().is_empty());
    }

    #[test]
    fn test_pending_frame_never_overlaps_fixed_frame() {
        let frame = velocity_frame(9);
        let pattern = frame[4..8].to_vec();
        let mut pending = VecDeque::from([PendingFrame {
            kind: ShortAckKind::Battery,
            pattern,
        }]);
        let ranges = sieve().scan(&frame, &mut pending);
        assert_eq!(ranges.len(), 1);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_fragmented_frame_delivered_once_complete() {
        // Arrange
        let frame = hardware_frame(0x33);
        let mut chunker = StreamChunker::new(sieve(), 1024);

        // Act
        let first = chunker.push(&frame[..20]);
        let second = chunker.push(&frame[20..]);

        // Assert
        assert!(first.is_empty());
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].bytes, frame);
        assert!(chunker.buffered().is_empty());
    }

    #[test]
    fn test_drain_again_yields_nothing_new() {
        let mut chunker = StreamChunker::new(sieve(), 1024);
        assert_eq!(chunker.push(&velocity_frame(1)).len(), 1);
        assert!(chunker.drain().is_empty());
    }

    #[test]
    fn test_expected_reply_recognised_after_registration() {
        let mut chunker = StreamChunker::new(sieve(), 1024);
        assert!(chunker.push(b"\x45\x30\x17\x08\x24\x06\x06\x06").is_empty());

        chunker.expect(ShortAckKind::Clock, b"\x45\x30\x17\x08\x24\x06\x06\x06".to_vec());
        let chunks = chunker.drain();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Pending(ShortAckKind::Clock));
        assert_eq!(chunker.pending_len(), 0);
    }

    #[test]
    fn test_garbage_is_capped_but_partial_frame_kept() {
        // Arrange
        let mut chunker = StreamChunker::new(sieve(), 0);
        let limit = sieve().max_frame_len();
        let frame = hardware_frame(0x44);

        // Act
        chunker.push(&vec![0x00; limit * 3]);
        chunker.push(&frame[..10]);
        let chunks = chunker.push(&frame[10..]);

        // Assert
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0].kind,
            ChunkKind::Fixed(FrameSpec {
                kind: FrameKind::Config(_),
                ..
            })
        ));
    }
}
