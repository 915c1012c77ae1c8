//! Command/response exchanges with the instrument.
//!
//! # How an exchange works (for beginners)
//!
//! The instrument has no request IDs: the driver writes a command and then
//! watches the incoming bytes until the expected terminator (usually the
//! `06 06` ACK) shows up.  The engine keeps a *reply buffer* that is cleared
//! right before each command is written and filled with every byte received
//! until the exchange ends.  While waiting it wakes up every
//! [`Timing::poll_interval`] to re-check its deadline, so a silent instrument
//! produces [`DriverError::Timeout`] exactly at the configured bound.
//!
//! Every received byte also goes into the [`StreamChunker`], which pulls out
//! complete frames independently of which exchange is running.  The protocol
//! layer collects those with [`CommandEngine::take_chunks`] and publishes them.
//! Short replies have no sync marker, so while one is being read the chunker
//! only buffers; it scans once the reply has been registered.
//!
//! Any wait also watches the session's shutdown signal and returns
//! [`DriverError::Cancelled`] as soon as it fires.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{TimeDelta, Timelike, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use nortek_core::protocol::chunker::{Chunk, Sieve};
use nortek_core::protocol::commands::{contains, find};
use nortek_core::protocol::frames::{FrameSpec, ShortAckKind};
use nortek_core::protocol::{InstrumentCommand, ModeSentinel, Prompt, ACK, NACK};
use nortek_core::{ClockReading, InstrumentFamily, StreamChunker};

use super::DriverError;
use crate::infrastructure::transport::{ByteStream, Transport, TransportError};

/// Exchange timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Upper bound on any single exchange.
    pub command_timeout: Duration,
    pub poll_interval: Duration,
    /// How long each what-mode probe waits before re-sending `II`.
    pub probe_delay: Duration,
    pub soft_break_delay: Duration,
    /// Upper bound on unframed bytes held by the chunker.
    pub max_buffer: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            probe_delay: Duration::from_secs(1),
            soft_break_delay: Duration::from_millis(100),
            max_buffer: 64 * 1024,
        }
    }
}

enum Step {
    Bytes(Vec<u8>),
    Tick,
    Closed,
    Cancelled,
}

/// Owns the transport and performs one exchange at a time.
pub struct CommandEngine {
    transport: Box<dyn Transport>,
    inbound: ByteStream,
    shutdown: watch::Receiver<bool>,
    chunker: StreamChunker,
    chunks: VecDeque<Chunk>,
    reply: Vec<u8>,
    capturing: bool,
    /// Buffer input without scanning until a short reply is registered.
    holding: bool,
    timing: Timing,
}

impl CommandEngine {
    pub fn new(
        transport: Box<dyn Transport>,
        inbound: ByteStream,
        shutdown: watch::Receiver<bool>,
        family: &InstrumentFamily,
        timing: Timing,
    ) -> Self {
        let sieve = Sieve::new(family.frame_specs(), family.checksum_seed);
        Self {
            transport,
            inbound,
            shutdown,
            chunker: StreamChunker::new(sieve, timing.max_buffer),
            chunks: VecDeque::new(),
            reply: Vec::new(),
            capturing: false,
            holding: false,
            timing,
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Frames extracted since the last call, in arrival order.
    pub fn take_chunks(&mut self) -> Vec<Chunk> {
        self.chunks.drain(..).collect()
    }

    /// Waits for unsolicited output between exchanges.
    ///
    /// Returns `None` once the link is closed.  Cancel-safe.
    pub async fn next_output(&mut self) -> Option<Vec<u8>> {
        let bytes = self.inbound.recv().await?;
        self.absorb(&bytes);
        Some(bytes)
    }

    /// Writes bytes without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Propagates transport write failures.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        self.transport.write(bytes).await?;
        Ok(())
    }

    // ── Exchanges ─────────────────────────────────────────────────────────────

    /// Writes `bytes` and waits until `expect` appears in the reply.
    ///
    /// Returns everything received during the exchange.
    ///
    /// # Errors
    ///
    /// - [`DriverError::Timeout`] if `expect` does not arrive within `timeout`.
    /// - [`DriverError::Rejected`] if the instrument answers with NACK instead.
    /// - [`DriverError::Cancelled`] if the session shuts down meanwhile.
    pub async fn send_and_wait(
        &mut self,
        bytes: &[u8],
        expect: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, DriverError> {
        let reply = self
            .exchange(bytes, timeout, &describe(expect), |reply| {
                contains(reply, expect) || (expect == ACK && contains(reply, NACK))
            })
            .await?;
        if !contains(&reply, expect) {
            return Err(DriverError::Rejected {
                command: describe(command_prefix(bytes)),
            });
        }
        Ok(reply)
    }

    /// Sends a bare command and waits for ACK within the command timeout.
    ///
    /// # Errors
    ///
    /// See [`CommandEngine::send_and_wait`].
    pub async fn send_command(&mut self, command: InstrumentCommand) -> Result<Vec<u8>, DriverError> {
        let timeout = self.timing.command_timeout;
        self.send_and_wait(command.as_bytes(), ACK, timeout).await
    }

    /// Sends `command` and returns its `payload + 06 06` reply.
    ///
    /// The reply is also registered with the chunker so it is published as a
    /// frame.
    ///
    /// # Errors
    ///
    /// See [`CommandEngine::send_and_wait`].
    pub async fn read_reply(
        &mut self,
        command: InstrumentCommand,
        kind: ShortAckKind,
    ) -> Result<Vec<u8>, DriverError> {
        let len = kind.payload_len();
        let timeout = self.timing.command_timeout;
        self.holding = true;
        let result = self
            .exchange(command.as_bytes(), timeout, kind.name(), |reply| {
                payload_end(reply, len).is_some()
            })
            .await
            .and_then(|reply| {
                let end = payload_end(&reply, len).ok_or_else(|| DriverError::Timeout {
                    waiting_for: kind.name().to_string(),
                    timeout,
                })?;
                Ok(reply[end - len..end + ACK.len()].to_vec())
            });
        self.holding = false;
        if let Ok(frame) = &result {
            self.chunker.expect(kind, frame.clone());
        }
        self.chunks.extend(self.chunker.drain());
        result
    }

    /// Sends `command` and returns the `spec.length + 2` bytes starting at the
    /// block's sync marker.  The block is not validated here.
    ///
    /// # Errors
    ///
    /// See [`CommandEngine::send_and_wait`].
    pub async fn read_block(
        &mut self,
        command: InstrumentCommand,
        spec: &FrameSpec,
    ) -> Result<Vec<u8>, DriverError> {
        let total = spec.length + ACK.len();
        let timeout = self.timing.command_timeout;
        let reply = self
            .exchange(command.as_bytes(), timeout, spec.name(), |reply| {
                block_start(reply, spec, total).is_some()
            })
            .await?;
        let start = block_start(&reply, spec, total).ok_or_else(|| DriverError::Timeout {
            waiting_for: spec.name().to_string(),
            timeout,
        })?;
        Ok(reply[start..start + total].to_vec())
    }

    /// Sends `II` until a prompt shows up, re-sending after each probe delay.
    ///
    /// A bare ACK is not conclusive, since streamed samples can contain
    /// `06 06`; probing continues until a mode sentinel or text prompt arrives.
    /// If only an ACK was seen by the deadline, that is what is returned.
    ///
    /// Returns the prompt and everything received while probing.
    ///
    /// # Errors
    ///
    /// [`DriverError::Timeout`] if nothing recognisable arrives within the
    /// command timeout.
    pub async fn what_mode(&mut self) -> Result<(Prompt, Vec<u8>), DriverError> {
        let timeout = self.timing.command_timeout;
        let deadline = Instant::now() + timeout;
        self.begin_reply();
        let result = self.probe_until(deadline).await;
        self.capturing = false;
        match result? {
            Some(prompt) => Ok((prompt, std::mem::take(&mut self.reply))),
            None => {
                warn!(?timeout, "what-mode probe got no recognisable reply");
                Err(DriverError::Timeout {
                    waiting_for: "mode prompt".to_string(),
                    timeout,
                })
            }
        }
    }

    async fn probe_until(&mut self, deadline: Instant) -> Result<Option<Prompt>, DriverError> {
        loop {
            self.write(InstrumentCommand::WhatMode.as_bytes()).await?;
            let wake = (Instant::now() + self.timing.probe_delay).min(deadline);
            if self.wait_until(wake, conclusive_prompt).await? {
                return Ok(Prompt::first_match(&self.reply));
            }
            if Instant::now() >= deadline {
                return Ok(Prompt::first_match(&self.reply));
            }
            debug!("no mode prompt yet, probing again");
        }
    }

    /// Two-stage break out of measurement into command mode.
    ///
    /// # Errors
    ///
    /// [`DriverError::Timeout`] if the confirmation prompt or final ACK is missing.
    pub async fn soft_break(&mut self) -> Result<(), DriverError> {
        let timeout = self.timing.command_timeout;
        let pause = self.timing.soft_break_delay;
        debug!("sending soft break");

        self.write(InstrumentCommand::SoftBreakFirst.as_bytes()).await?;
        self.pause(pause).await?;
        self.send_and_wait(
            InstrumentCommand::SoftBreakSecond.as_bytes(),
            Prompt::Confirmation.as_bytes(),
            timeout,
        )
        .await?;
        self.pause(pause).await?;
        self.send_command(InstrumentCommand::Confirmation).await?;
        Ok(())
    }

    /// Sets the instrument clock to the next whole second of UTC.
    ///
    /// Sleeps until that second starts so the instrument is not left a
    /// fraction of a second behind.
    ///
    /// # Errors
    ///
    /// [`DriverError::Frame`] if the time cannot be encoded, otherwise see
    /// [`CommandEngine::send_and_wait`].
    pub async fn sync_clock(&mut self, family: &InstrumentFamily) -> Result<ClockReading, DriverError> {
        let now = Utc::now();
        let wait = Duration::from_nanos(1_000_000_000 - u64::from(now.nanosecond() % 1_000_000_000));
        let target = now.with_nanosecond(0).unwrap_or(now) + TimeDelta::seconds(1);

        let reading = ClockReading::from_datetime(&target.naive_utc());
        let payload = family
            .encode_clock(&reading)
            .map_err(nortek_core::FrameError::from)?;

        self.pause(wait).await?;
        debug!(time = %target, "setting instrument clock");
        let timeout = self.timing.command_timeout;
        self.send_and_wait(&InstrumentCommand::SetClock.with_payload(&payload), ACK, timeout)
            .await?;
        Ok(reading)
    }

    /// Keeps absorbing input for `duration` without waiting on anything.
    ///
    /// # Errors
    ///
    /// [`DriverError::Cancelled`] or a closed transport.
    pub async fn pause(&mut self, duration: Duration) -> Result<(), DriverError> {
        let deadline = Instant::now() + duration;
        self.wait_until(deadline, |_| false).await.map(|_| ())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn exchange<F>(
        &mut self,
        bytes: &[u8],
        timeout: Duration,
        waiting_for: &str,
        done: F,
    ) -> Result<Vec<u8>, DriverError>
    where
        F: Fn(&[u8]) -> bool,
    {
        self.begin_reply();
        let result = self.write_and_wait(bytes, Instant::now() + timeout, &done).await;
        self.capturing = false;
        if result? {
            Ok(std::mem::take(&mut self.reply))
        } else {
            warn!(waiting_for, ?timeout, "exchange timed out");
            Err(DriverError::Timeout {
                waiting_for: waiting_for.to_string(),
                timeout,
            })
        }
    }

    async fn write_and_wait<F>(&mut self, bytes: &[u8], deadline: Instant, done: &F) -> Result<bool, DriverError>
    where
        F: Fn(&[u8]) -> bool,
    {
        self.write(bytes).await?;
        self.wait_until(deadline, done).await
    }

    /// Clears the reply buffer after absorbing anything already queued.
    fn begin_reply(&mut self) {
        self.capturing = false;
        while let Ok(bytes) = self.inbound.try_recv() {
            self.absorb(&bytes);
        }
        self.reply.clear();
        self.capturing = true;
    }

    fn absorb(&mut self, bytes: &[u8]) {
        if self.capturing {
            self.reply.extend_from_slice(bytes);
        }
        if self.holding {
            self.chunker.append(bytes);
        } else {
            self.chunks.extend(self.chunker.push(bytes));
        }
    }

    /// Pumps input until `done(reply)` holds (`Ok(true)`) or `deadline`
    /// passes (`Ok(false)`).
    async fn wait_until<F>(&mut self, deadline: Instant, done: F) -> Result<bool, DriverError>
    where
        F: Fn(&[u8]) -> bool,
    {
        loop {
            if done(&self.reply) {
                return Ok(true);
            }
            if *self.shutdown.borrow() {
                return Err(DriverError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            match self.step((now + self.timing.poll_interval).min(deadline)).await {
                Step::Bytes(bytes) => self.absorb(&bytes),
                Step::Tick => {}
                Step::Closed => return Err(TransportError::Closed.into()),
                Step::Cancelled => return Err(DriverError::Cancelled),
            }
        }
    }

    async fn step(&mut self, wake: Instant) -> Step {
        tokio::select! {
            biased;
            // A dropped sender means the session owner is gone.
            _ = self.shutdown.changed() => Step::Cancelled,
            bytes = self.inbound.recv() => match bytes {
                Some(bytes) => Step::Bytes(bytes),
                None => Step::Closed,
            },
            _ = tokio::time::sleep_until(wake) => Step::Tick,
        }
    }
}

/// End of a `len`-byte payload followed by ACK.
///
/// Anchored on the last ACK with room for the payload before it, so leading
/// noise cannot shift the payload onto ACK bytes it contains.
fn payload_end(reply: &[u8], len: usize) -> Option<usize> {
    let last = reply.len().checked_sub(ACK.len())?;
    (len..=last).rev().find(|&at| reply[at..].starts_with(ACK))
}

fn conclusive_prompt(reply: &[u8]) -> bool {
    match Prompt::first_match(reply) {
        Some(Prompt::Ack) => ModeSentinel::find_in(reply).is_some(),
        Some(_) => true,
        None => false,
    }
}

fn block_start(reply: &[u8], spec: &FrameSpec, total: usize) -> Option<usize> {
    let start = find(reply, spec.sync)?;
    (reply.len() >= start + total).then_some(start)
}

fn command_prefix(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(2)]
}

fn describe(bytes: &[u8]) -> String {
    match bytes {
        b"\x06\x06" => "ACK".to_string(),
        b"\x15\x15" => "NACK".to_string(),
        other => format!("{:?}", String::from_utf8_lossy(other)),
    }
}
