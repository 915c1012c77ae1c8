//! Notifications from the protocol session to its owner.
//!
//! The session reports three things as they happen: state transitions,
//! configuration changes (with the snapshot before and after), and every
//! frame extracted from the instrument's output.  [`ChannelSink`] turns these
//! into [`DriverEvent`]s on a Tokio channel, mirroring how the rest of the
//! driver hands events upward.

use tokio::sync::mpsc;
use tracing::warn;

use nortek_core::{ConfigSnapshot, Frame};

use crate::application::ProtocolState;

/// Receiver of session notifications.
///
/// Called from inside the session task, so implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn on_state_change(&self, state: ProtocolState);

    fn on_config_change(&self, old: &ConfigSnapshot, new: &ConfigSnapshot);

    fn on_sample(&self, frame: &Frame);

    /// Raw instrument output while a direct-access client is attached,
    /// with echoes of the client's own commands removed.
    fn on_direct_access_output(&self, _bytes: &[u8]) {}
}

/// Events emitted by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    StateChanged(ProtocolState),
    ConfigChanged {
        old: ConfigSnapshot,
        new: ConfigSnapshot,
    },
    Sample(Frame),
    DirectAccessOutput(Vec<u8>),
}

/// Forwards notifications as [`DriverEvent`]s.
///
/// Events are dropped (with a warning) if the receiver falls `capacity`
/// events behind; the session never waits on its consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DriverEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver its events arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn emit(&self, event: DriverEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("event receiver lagging, dropped {event:?}");
            }
            // Nobody is listening any more.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl NotificationSink for ChannelSink {
    fn on_state_change(&self, state: ProtocolState) {
        self.emit(DriverEvent::StateChanged(state));
    }

    fn on_config_change(&self, old: &ConfigSnapshot, new: &ConfigSnapshot) {
        self.emit(DriverEvent::ConfigChanged {
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn on_sample(&self, frame: &Frame) {
        self.emit(DriverEvent::Sample(frame.clone()));
    }

    fn on_direct_access_output(&self, bytes: &[u8]) {
        self.emit(DriverEvent::DirectAccessOutput(bytes.to_vec()));
    }
}
