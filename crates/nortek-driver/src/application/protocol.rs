//! The instrument protocol state machine.
//!
//! ```text
//!              DISCOVER                       START_AUTOSAMPLE
//!   UNKNOWN ─────────────▶ COMMAND ◀──────────────────────────▶ AUTOSAMPLE
//!      ▲                   │   ▲          STOP_AUTOSAMPLE           │
//!      │       RESET       │   │ STOP_DIRECT                        │
//!      └───────────────────┘   │                                    │
//!      ▲                START_DIRECT                                │
//!      │                   ▼   │                                    │
//!      │               DIRECT_ACCESS                                │
//!      └──────────────────────────── RESET ─────────────────────────┘
//! ```
//!
//! Every (state, event) pair the instrument supports has a handler in
//! [`Protocol::execute`]; any other pair is rejected with
//! [`DriverError::InvalidTransition`] before a byte is written.
//!
//! Entering COMMAND re-reads the user configuration so the registry matches
//! the instrument.  Entering AUTOSAMPLE arms the clock-sync and status jobs
//! whose intervals are non-zero; leaving it disarms them.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, info, warn};

use nortek_core::params::parse_interval;
use nortek_core::params::user_config::{ACQUIRE_STATUS_INTERVAL, CLOCK_SYNC_INTERVAL};
use nortek_core::protocol::chunker::{Chunk, ChunkKind};
use nortek_core::protocol::commands::find;
use nortek_core::protocol::frames::{
    decode_frame, decode_short_ack, validate_block, ConfigKind, ShortAckKind, USER_CONFIG,
};
use nortek_core::protocol::{InstrumentCommand, ModeSentinel, Prompt, ACK};
use nortek_core::{
    ConfigChange, ConfigSnapshot, Frame, InstrumentFamily, ParameterRegistry, Value,
};

use super::{CommandEngine, DriverError, ExecuteResult, Outcome, ProtocolEvent, ProtocolState};
use crate::infrastructure::notify::NotificationSink;
use crate::infrastructure::scheduler::{JobFired, ScheduledJob, Scheduler};

/// Sent direct-access commands remembered for echo removal.
const MAX_ECHOES: usize = 32;

/// Protocol state, the live parameter registry, and the engine that talks to
/// the instrument.
pub struct Protocol {
    state: ProtocolState,
    engine: CommandEngine,
    registry: ParameterRegistry,
    family: &'static InstrumentFamily,
    scheduler: Box<dyn Scheduler>,
    sink: Arc<dyn NotificationSink>,
    echoes: VecDeque<Vec<u8>>,
}

impl Protocol {
    /// Seals `registry`; parameters cannot be added once a session exists.
    pub fn new(
        engine: CommandEngine,
        mut registry: ParameterRegistry,
        family: &'static InstrumentFamily,
        scheduler: Box<dyn Scheduler>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        registry.seal();
        Self {
            state: ProtocolState::Unknown,
            engine,
            registry,
            family,
            scheduler,
            sink,
            echoes: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Runs `event` against the current state.
    ///
    /// # Errors
    ///
    /// [`DriverError::InvalidTransition`] for an event the current state does
    /// not accept, otherwise whatever the handler's exchanges return.
    pub async fn execute(&mut self, event: ProtocolEvent) -> Result<ExecuteResult, DriverError> {
        use ProtocolEvent as E;
        use ProtocolState as S;

        let name = event.name();
        debug!(state = %self.state, event = name, "handling event");
        let result = match (self.state, event) {
            (S::Unknown, E::Discover) => self.discover().await,

            (S::Command, E::StartAutosample) => self.start_autosample().await,
            (S::Autosample, E::StopAutosample) => self.stop_autosample().await,
            (S::Command | S::Autosample, E::AcquireStatus)
            | (S::Autosample, E::ScheduledAcquireStatus) => self.acquire_status().await,
            (S::Command | S::Autosample, E::Reset) => self.reset().await,
            (S::Autosample, E::ScheduledClockSync) => self.scheduled_clock_sync().await,

            (S::Command, E::AcquireSample) => self.acquire_sample().await,
            (S::Command, E::ClockSync) => self.clock_sync().await,
            (S::Command, E::ReadClock) => self.read_short(InstrumentCommand::ReadClock, ShortAckKind::Clock).await,
            (S::Command, E::ReadBatteryVoltage) => {
                self.read_short(InstrumentCommand::ReadBatteryVoltage, ShortAckKind::Battery)
                    .await
            }
            (S::Command, E::ReadId) => self.read_short(InstrumentCommand::ReadId, ShortAckKind::Id).await,
            (S::Command, E::ReadMode) => self.read_mode().await,
            (S::Command, E::ReadHardwareConfig) => self.read_config(ConfigKind::Hardware).await,
            (S::Command, E::ReadHeadConfig) => self.read_config(ConfigKind::Head).await,
            (S::Command, E::ReadUserConfig) => self.read_config(ConfigKind::User).await,
            (S::Command, E::Set(values)) => self.set(values).await,
            (S::Command, E::SetConfiguration(blob)) => self.set_configuration(&blob).await,
            (S::Command, E::ApplyStartupParams) => self.apply_startup_params().await,

            (S::Command, E::StartDirectAccess) => self.start_direct_access().await,
            (S::DirectAccess, E::ExecuteDirect(bytes)) => self.execute_direct(bytes).await,
            (S::DirectAccess, E::StopDirectAccess) => self.stop_direct_access().await,

            (state, _) => Err(DriverError::InvalidTransition { state, event: name }),
        };
        self.publish_chunks();
        if let Err(e) = &result {
            warn!(state = %self.state, event = name, "event failed: {e}");
        }
        result
    }

    /// Feeds unsolicited output received between exchanges.
    pub fn handle_output(&mut self, bytes: &[u8]) {
        if self.state == ProtocolState::DirectAccess {
            let output = self.strip_echoes(bytes);
            if !output.is_empty() {
                self.sink.on_direct_access_output(&output);
            }
        }
        self.publish_chunks();
    }

    /// See [`CommandEngine::next_output`].
    pub async fn next_output(&mut self) -> Option<Vec<u8>> {
        self.engine.next_output().await
    }

    /// `true` if `fired` comes from a job that is still armed.
    pub fn is_current(&self, fired: &JobFired) -> bool {
        self.scheduler.is_current(fired)
    }

    /// Replaces the registry's block with a base64 blob, without touching the
    /// instrument.
    ///
    /// # Errors
    ///
    /// [`DriverError::Registry`] if the blob is not a valid block.
    pub fn import_raw_config(&mut self, blob: &str) -> Result<(), DriverError> {
        let change = self.registry.import_raw_config(blob)?;
        self.notify_config(change);
        Ok(())
    }

    /// Disarms every job.  Called when the session ends.
    pub fn teardown(&mut self) {
        self.scheduler.disarm_all();
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    /// Moves to `next` and runs its entry action.
    ///
    /// The new state is committed before the entry action runs.  If entering
    /// COMMAND fails to re-read the user configuration, the error is returned
    /// and the session stays in COMMAND, which is where the instrument is.
    async fn enter(&mut self, next: ProtocolState) -> Result<Option<ProtocolState>, DriverError> {
        let prev = self.state;
        if next == prev {
            return Ok(None);
        }
        match prev {
            ProtocolState::Autosample => self.scheduler.disarm_all(),
            ProtocolState::DirectAccess => self.echoes.clear(),
            ProtocolState::Unknown | ProtocolState::Command => {}
        }

        self.state = next;
        info!(from = %prev, to = %next, "state transition");
        self.sink.on_state_change(next);

        match next {
            ProtocolState::Command => {
                self.read_user_config().await?;
            }
            ProtocolState::Autosample => self.arm_jobs(),
            ProtocolState::DirectAccess => self.echoes.clear(),
            ProtocolState::Unknown => {}
        }
        Ok(Some(next))
    }

    fn arm_jobs(&mut self) {
        for (job, name) in [
            (ScheduledJob::ClockSync, CLOCK_SYNC_INTERVAL),
            (ScheduledJob::AcquireStatus, ACQUIRE_STATUS_INTERVAL),
        ] {
            let text = match self.registry.value(name) {
                Ok(Some(Value::Str(text))) => text.clone(),
                _ => continue,
            };
            match parse_interval(&text) {
                Ok(interval) if interval.is_zero() => {}
                Ok(interval) => self.scheduler.arm(job, interval),
                Err(e) => warn!(?job, "not arming job: {e}"),
            }
        }
    }

    async fn probe_state(&mut self) -> Result<ProtocolState, DriverError> {
        let (prompt, reply) = match self.engine.what_mode().await {
            Ok(found) => found,
            Err(DriverError::Timeout { .. }) => return Err(DriverError::UnknownInstrumentState),
            Err(e) => return Err(e),
        };
        match prompt {
            Prompt::CommandMode => Ok(ProtocolState::Command),
            Prompt::Confirmation => Ok(ProtocolState::Autosample),
            Prompt::Ack | Prompt::Nack => match ModeSentinel::find_in(&reply) {
                Some(ModeSentinel::Command) => Ok(ProtocolState::Command),
                Some(ModeSentinel::Measurement | ModeSentinel::Confirmation) => {
                    Ok(ProtocolState::Autosample)
                }
                other => {
                    warn!(sentinel = ?other, "mode reply not recognised");
                    Err(DriverError::UnknownInstrumentState)
                }
            },
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// A failed entry action leaves the discovered state in place; see
    /// [`Protocol::enter`].
    async fn discover(&mut self) -> Result<ExecuteResult, DriverError> {
        let next = self.probe_state().await?;
        info!(state = %next, "instrument discovered");
        let next_state = self.enter(next).await?;
        Ok(changed(next_state))
    }

    async fn start_autosample(&mut self) -> Result<ExecuteResult, DriverError> {
        self.engine.sync_clock(self.family).await?;
        self.engine
            .send_command(InstrumentCommand::StartMeasurement)
            .await?;
        let next_state = self.enter(ProtocolState::Autosample).await?;
        Ok(changed(next_state))
    }

    async fn stop_autosample(&mut self) -> Result<ExecuteResult, DriverError> {
        self.engine.soft_break().await?;
        let next_state = self.enter(ProtocolState::Command).await?;
        Ok(changed(next_state))
    }

    /// Battery, clock, and hardware configuration.  From AUTOSAMPLE the
    /// instrument is broken out first and restarted afterwards.
    async fn acquire_status(&mut self) -> Result<ExecuteResult, DriverError> {
        let resume = self.state == ProtocolState::Autosample;
        if resume {
            self.engine.soft_break().await?;
        }

        let status = self.read_status().await;

        if resume {
            self.engine
                .send_command(InstrumentCommand::StartMeasurement)
                .await?;
        }
        Ok(done(Outcome::Status(status?)))
    }

    async fn read_status(&mut self) -> Result<Vec<Frame>, DriverError> {
        let battery = self
            .short_frame(InstrumentCommand::ReadBatteryVoltage, ShortAckKind::Battery)
            .await?;
        let clock = self
            .short_frame(InstrumentCommand::ReadClock, ShortAckKind::Clock)
            .await?;
        let hardware = self.config_frame(ConfigKind::Hardware).await?;
        Ok(vec![battery, clock, hardware])
    }

    async fn reset(&mut self) -> Result<ExecuteResult, DriverError> {
        if self.state == ProtocolState::Autosample {
            self.engine.soft_break().await?;
        }
        self.engine.send_command(InstrumentCommand::PowerDown).await?;
        let next_state = self.enter(ProtocolState::Unknown).await?;
        Ok(changed(next_state))
    }

    async fn scheduled_clock_sync(&mut self) -> Result<ExecuteResult, DriverError> {
        self.engine.soft_break().await?;
        let synced = self.engine.sync_clock(self.family).await;
        self.engine
            .send_command(InstrumentCommand::StartMeasurement)
            .await?;
        synced?;
        Ok(done(Outcome::Done))
    }

    async fn clock_sync(&mut self) -> Result<ExecuteResult, DriverError> {
        self.engine.sync_clock(self.family).await?;
        Ok(done(Outcome::Done))
    }

    /// One sample; the data itself arrives through the chunker.
    async fn acquire_sample(&mut self) -> Result<ExecuteResult, DriverError> {
        self.engine.send_command(InstrumentCommand::AcquireData).await?;
        Ok(done(Outcome::Done))
    }

    async fn read_short(
        &mut self,
        command: InstrumentCommand,
        kind: ShortAckKind,
    ) -> Result<ExecuteResult, DriverError> {
        let frame = self.short_frame(command, kind).await?;
        Ok(done(Outcome::Frame(frame)))
    }

    async fn read_mode(&mut self) -> Result<ExecuteResult, DriverError> {
        let (_, reply) = self.engine.what_mode().await?;
        Ok(done(Outcome::Mode(ModeSentinel::find_in(&reply))))
    }

    async fn read_config(&mut self, kind: ConfigKind) -> Result<ExecuteResult, DriverError> {
        let frame = match kind {
            ConfigKind::User => self.read_user_config().await?,
            ConfigKind::Hardware | ConfigKind::Head => self.config_frame(kind).await?,
        };
        Ok(done(Outcome::Frame(frame)))
    }

    /// Validates every value on a scratch copy of the registry, then writes
    /// the resulting block.  Nothing is sent if any value is rejected.
    async fn set(&mut self, values: ConfigSnapshot) -> Result<ExecuteResult, DriverError> {
        let mut scratch = self.registry.clone();
        for (name, value) in values {
            scratch.set_from_value(&name, value)?;
        }
        self.write_configuration(&scratch).await?;
        Ok(done(Outcome::Done))
    }

    async fn set_configuration(&mut self, blob: &str) -> Result<ExecuteResult, DriverError> {
        let bytes = STANDARD
            .decode(blob.trim())
            .map_err(|e| DriverError::InvalidBlob(e.to_string()))?;
        let block = validate_block(&bytes, &USER_CONFIG, self.family.checksum_seed)?;
        self.write_block(block).await?;
        Ok(done(Outcome::Done))
    }

    /// Writes init values that differ from what the instrument reported.
    async fn apply_startup_params(&mut self) -> Result<ExecuteResult, DriverError> {
        let pending = self.registry.pending_startup_values();
        if pending.is_empty() {
            debug!("startup parameters already match the instrument");
            return Ok(done(Outcome::Done));
        }
        info!(count = pending.len(), "applying startup parameters");
        let mut scratch = self.registry.clone();
        for (name, value) in pending {
            scratch.stage_startup(&name, value)?;
        }
        self.write_configuration(&scratch).await?;
        Ok(done(Outcome::Done))
    }

    async fn start_direct_access(&mut self) -> Result<ExecuteResult, DriverError> {
        let next_state = self.enter(ProtocolState::DirectAccess).await?;
        Ok(changed(next_state))
    }

    async fn execute_direct(&mut self, bytes: Vec<u8>) -> Result<ExecuteResult, DriverError> {
        self.engine.write(&bytes).await?;
        if self.echoes.len() == MAX_ECHOES {
            self.echoes.pop_front();
        }
        self.echoes.push_back(bytes);
        Ok(done(Outcome::Done))
    }

    /// Leaves direct access for whatever state the instrument was left in.
    /// An unrecognisable instrument lands in UNKNOWN.
    async fn stop_direct_access(&mut self) -> Result<ExecuteResult, DriverError> {
        let next = match self.probe_state().await {
            Ok(next) => next,
            Err(DriverError::UnknownInstrumentState) => ProtocolState::Unknown,
            Err(e) => return Err(e),
        };
        let next_state = self.enter(next).await?;
        Ok(changed(next_state))
    }

    // ── Exchanges ─────────────────────────────────────────────────────────────

    async fn short_frame(
        &mut self,
        command: InstrumentCommand,
        kind: ShortAckKind,
    ) -> Result<Frame, DriverError> {
        let reply = self.engine.read_reply(command, kind).await?;
        Ok(decode_short_ack(kind, &reply, self.family)?)
    }

    async fn config_frame(&mut self, kind: ConfigKind) -> Result<Frame, DriverError> {
        let spec = kind.spec();
        let block = self.engine.read_block(read_command(kind), &spec).await?;
        Ok(decode_frame(&spec, &block[..spec.length], self.family.checksum_seed)?)
    }

    /// Reads `GC` into the live registry.  A bad checksum leaves the registry
    /// untouched and fails.
    async fn read_user_config(&mut self) -> Result<Frame, DriverError> {
        let block = self
            .engine
            .read_block(InstrumentCommand::ReadUserConfig, &USER_CONFIG)
            .await?;
        let change = self.registry.update_from_block(&block)?;
        self.notify_config(change);
        Ok(decode_frame(
            &USER_CONFIG,
            &block[..USER_CONFIG.length],
            self.family.checksum_seed,
        )?)
    }

    async fn write_configuration(&mut self, staged: &ParameterRegistry) -> Result<(), DriverError> {
        let block = staged.build_configuration_block()?;
        self.write_block(&block).await
    }

    /// `CC` + block, then a fresh `GC` so the registry reflects what the
    /// instrument accepted.
    async fn write_block(&mut self, block: &[u8]) -> Result<(), DriverError> {
        let timeout = self.engine.timing().command_timeout;
        self.engine
            .send_and_wait(&InstrumentCommand::Configure.with_payload(block), ACK, timeout)
            .await?;
        info!("user configuration written");
        self.read_user_config().await?;
        Ok(())
    }

    // ── Publication ───────────────────────────────────────────────────────────

    fn publish_chunks(&mut self) {
        for chunk in self.engine.take_chunks() {
            match self.decode_chunk(&chunk) {
                Ok(frame) => {
                    self.sink.on_sample(&frame);
                    if let ChunkKind::Fixed(spec) = chunk.kind {
                        if spec == USER_CONFIG {
                            self.absorb_user_block(&chunk.bytes);
                        }
                    }
                }
                Err(e) => warn!("dropping undecodable frame: {e}"),
            }
        }
    }

    fn decode_chunk(&self, chunk: &Chunk) -> Result<Frame, DriverError> {
        let frame = match chunk.kind {
            ChunkKind::Fixed(spec) => decode_frame(&spec, &chunk.bytes, self.family.checksum_seed)?,
            ChunkKind::Pending(kind) => decode_short_ack(kind, &chunk.bytes, self.family)?,
        };
        Ok(frame)
    }

    /// A user block seen in the stream (e.g. a `GC` typed in direct access).
    fn absorb_user_block(&mut self, bytes: &[u8]) {
        match self.registry.update_from_block(bytes) {
            Ok(change) => self.notify_config(change),
            Err(e) => warn!("ignoring user configuration block from stream: {e}"),
        }
    }

    fn notify_config(&self, change: Option<ConfigChange>) {
        if let Some(change) = change {
            debug!(changed = ?change.changed_names(), "configuration changed");
            self.sink.on_config_change(&change.old, &change.new);
        }
    }

    fn strip_echoes(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut output = bytes.to_vec();
        while let Some(sent) = self.echoes.front() {
            match find(&output, sent) {
                Some(at) => {
                    output.drain(at..at + sent.len());
                    self.echoes.pop_front();
                }
                None => break,
            }
        }
        output
    }
}

fn read_command(kind: ConfigKind) -> InstrumentCommand {
    match kind {
        ConfigKind::Hardware => InstrumentCommand::ReadHardwareConfig,
        ConfigKind::Head => InstrumentCommand::ReadHeadConfig,
        ConfigKind::User => InstrumentCommand::ReadUserConfig,
    }
}

fn changed(next_state: Option<ProtocolState>) -> ExecuteResult {
    ExecuteResult {
        next_state,
        outcome: Outcome::Done,
    }
}

fn done(outcome: Outcome) -> ExecuteResult {
    ExecuteResult {
        next_state: None,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Timing;
    use crate::infrastructure::notify::MockNotificationSink;
    use crate::infrastructure::scheduler::TokioScheduler;
    use crate::infrastructure::transport::{MockHandle, MockTransport};
    use nortek_core::params::user_config::nortek_registry;
    use nortek_core::VECTOR;
    use tokio::sync::watch;

    fn protocol_with<F>(
        sink: MockNotificationSink,
        responder: F,
    ) -> (Protocol, MockHandle, watch::Sender<bool>)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let (transport, handle, inbound) = MockTransport::with_responder(responder);
        let (tx, rx) = watch::channel(false);
        let engine = CommandEngine::new(Box::new(transport), inbound, rx, &VECTOR, Timing::default());
        let (scheduler, _fired) = TokioScheduler::new();
        let protocol = Protocol::new(
            engine,
            nortek_registry(&VECTOR).unwrap(),
            &VECTOR,
            Box::new(scheduler),
            Arc::new(sink),
        );
        (protocol, handle, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_event_writes_nothing() {
        // Arrange
        let mut sink = MockNotificationSink::new();
        sink.expect_on_state_change().never();
        let (mut protocol, handle, _tx) = protocol_with(sink, |_| Vec::new());

        // Act
        let result = protocol.execute(ProtocolEvent::StartAutosample).await;

        // Assert
        assert!(matches!(
            result,
            Err(DriverError::InvalidTransition {
                state: ProtocolState::Unknown,
                event: "START_AUTOSAMPLE"
            })
        ));
        assert!(handle.writes().is_empty());
        assert_eq!(protocol.state(), ProtocolState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_into_autosample_notifies_once() {
        // Arrange
        let mut sink = MockNotificationSink::new();
        sink.expect_on_state_change()
            .withf(|state| *state == ProtocolState::Autosample)
            .times(1)
            .return_const(());
        sink.expect_on_sample().return_const(());
        let (mut protocol, _handle, _tx) =
            protocol_with(sink, |_| vec![b"\x01\x00\x06\x06".to_vec()]);

        // Act
        let result = protocol.execute(ProtocolEvent::Discover).await.unwrap();

        // Assert
        assert_eq!(result.next_state, Some(ProtocolState::Autosample));
        assert_eq!(protocol.state(), ProtocolState::Autosample);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovered_state_stands_when_config_read_fails() {
        // Arrange
        let mut sink = MockNotificationSink::new();
        sink.expect_on_state_change()
            .withf(|state| *state == ProtocolState::Command)
            .times(1)
            .return_const(());
        let (mut protocol, handle, _tx) = protocol_with(sink, |bytes| match bytes {
            b"II" => vec![b"\x02\x00\x06\x06".to_vec()],
            _ => vec![b"\x15\x15".to_vec()],
        });

        // Act
        let result = protocol.execute(ProtocolEvent::Discover).await;

        // Assert
        assert!(matches!(result, Err(DriverError::Timeout { .. })));
        assert_eq!(protocol.state(), ProtocolState::Command);
        assert!(handle.was_sent(b"GC"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecognised_mode_reply_is_unknown_state() {
        let mut sink = MockNotificationSink::new();
        sink.expect_on_state_change().never();
        let (mut protocol, _handle, _tx) =
            protocol_with(sink, |_| vec![b"\x09\x09\x06\x06".to_vec()]);

        let result = protocol.execute(ProtocolEvent::Discover).await;

        assert!(matches!(result, Err(DriverError::UnknownInstrumentState)));
        assert_eq!(protocol.state(), ProtocolState::Unknown);
    }

    #[test]
    fn test_strip_echoes_removes_sent_commands_in_order() {
        let (mut protocol, _handle, _tx) = protocol_with(MockNotificationSink::new(), |_| Vec::new());
        protocol.echoes.push_back(b"BV".to_vec());
        protocol.echoes.push_back(b"RC".to_vec());

        let output = protocol.strip_echoes(b"BV\xe8\x2e\x06\x06");

        assert_eq!(output, b"\xe8\x2e\x06\x06".to_vec());
        assert_eq!(protocol.echoes.len(), 1);
    }
}
