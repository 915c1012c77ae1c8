//! The session task and its public handle.
//!
//! One Tokio task owns the [`Protocol`].  Callers talk to it through a
//! cloneable [`SessionHandle`]; every request is a message with a oneshot
//! reply, so exchanges with the instrument never overlap and `get` always
//! sees a consistent snapshot.  Between requests the task pumps unsolicited
//! instrument output and runs scheduled jobs.
//!
//! ```text
//!  SessionHandle ──Request──┐
//!  TokioScheduler ─JobFired─┼──▶ session task ──▶ Protocol ──▶ CommandEngine
//!  transport ────bytes──────┘
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use nortek_core::{ConfigSnapshot, InstrumentFamily, ParameterRegistry};

use super::{CommandEngine, DriverError, ExecuteResult, Protocol, ProtocolEvent, ProtocolState, Timing};
use crate::infrastructure::notify::NotificationSink;
use crate::infrastructure::scheduler::{JobFired, TokioScheduler};
use crate::infrastructure::transport::{ByteStream, Transport};

const REQUEST_CAPACITY: usize = 32;

enum Request {
    Execute {
        event: ProtocolEvent,
        reply: oneshot::Sender<Result<ExecuteResult, DriverError>>,
    },
    Get {
        names: Option<Vec<String>>,
        reply: oneshot::Sender<Result<ConfigSnapshot, DriverError>>,
    },
    State {
        reply: oneshot::Sender<ProtocolState>,
    },
    ExportRawConfig {
        reply: oneshot::Sender<Option<String>>,
    },
    ImportRawConfig {
        blob: String,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    requests: mpsc::Sender<Request>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// Starts a session over an open transport.
///
/// The registry is sealed.  The session starts in
/// [`ProtocolState::Unknown`]; call [`SessionHandle::discover`] first.
pub fn start_session(
    transport: Box<dyn Transport>,
    inbound: ByteStream,
    family: &'static InstrumentFamily,
    registry: ParameterRegistry,
    timing: Timing,
    sink: Arc<dyn NotificationSink>,
) -> (SessionHandle, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (scheduler, fired) = TokioScheduler::new();
    let engine = CommandEngine::new(transport, inbound, shutdown_rx.clone(), family, timing);
    let protocol = Protocol::new(engine, registry, family, Box::new(scheduler), sink);

    let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
    let id = Uuid::new_v4();
    let task = tokio::spawn(
        run(protocol, rx, fired, shutdown_rx).instrument(info_span!("session", %id, family = family.name)),
    );
    info!(%id, family = family.name, "session started");

    (
        SessionHandle {
            id,
            requests: tx,
            shutdown: Arc::new(shutdown_tx),
        },
        task,
    )
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| DriverError::SessionClosed)?;
        rx.await.map_err(|_| DriverError::SessionClosed)
    }

    /// Runs one protocol event.
    ///
    /// # Errors
    ///
    /// Whatever the event's handler returns, or [`DriverError::SessionClosed`].
    pub async fn execute(&self, event: ProtocolEvent) -> Result<ExecuteResult, DriverError> {
        self.request(|reply| Request::Execute { event, reply }).await?
    }

    /// Probes the instrument and returns the state it was found in.
    ///
    /// # Errors
    ///
    /// [`DriverError::UnknownInstrumentState`] if the instrument could not be
    /// classified; [`DriverError::InvalidTransition`] unless the session is
    /// in UNKNOWN.
    pub async fn discover(&self) -> Result<ProtocolState, DriverError> {
        self.execute(ProtocolEvent::Discover).await?;
        self.state().await
    }

    /// Values of the named parameters.  Unset parameters are omitted.
    ///
    /// # Errors
    ///
    /// [`DriverError::Registry`] with `UnknownParameter` for an unknown name.
    pub async fn get(&self, names: &[&str]) -> Result<ConfigSnapshot, DriverError> {
        let names = Some(names.iter().map(|n| n.to_string()).collect());
        self.request(|reply| Request::Get { names, reply }).await?
    }

    /// Every parameter that has a value.
    ///
    /// # Errors
    ///
    /// [`DriverError::SessionClosed`] if the session has ended.
    pub async fn get_all(&self) -> Result<ConfigSnapshot, DriverError> {
        self.request(|reply| Request::Get { names: None, reply }).await?
    }

    /// Validates `values`, writes the resulting block, and re-reads it.
    ///
    /// # Errors
    ///
    /// A registry error before anything is written, or an exchange failure.
    pub async fn set(&self, values: ConfigSnapshot) -> Result<(), DriverError> {
        self.execute(ProtocolEvent::Set(values)).await.map(|_| ())
    }

    /// # Errors
    ///
    /// [`DriverError::SessionClosed`] if the session has ended.
    pub async fn state(&self) -> Result<ProtocolState, DriverError> {
        self.request(|reply| Request::State { reply }).await
    }

    /// The last user configuration block as base64, once one has been read.
    ///
    /// # Errors
    ///
    /// [`DriverError::SessionClosed`] if the session has ended.
    pub async fn export_raw_config(&self) -> Result<Option<String>, DriverError> {
        self.request(|reply| Request::ExportRawConfig { reply }).await
    }

    /// Loads a base64 block into the registry without writing to the instrument.
    ///
    /// # Errors
    ///
    /// [`DriverError::Registry`] if the blob is not a valid block.
    pub async fn import_raw_config(&self, blob: impl Into<String>) -> Result<(), DriverError> {
        let blob = blob.into();
        self.request(|reply| Request::ImportRawConfig { blob, reply })
            .await?
    }

    /// Stops the session.  An exchange in progress fails with
    /// [`DriverError::Cancelled`].
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

enum Wake {
    Request(Request),
    Fired(JobFired),
    Output(Vec<u8>),
    LinkClosed,
    Shutdown,
}

async fn run(
    mut protocol: Protocol,
    mut requests: mpsc::Receiver<Request>,
    mut fired: mpsc::Receiver<JobFired>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let wake = tokio::select! {
            biased;
            _ = shutdown.changed() => Wake::Shutdown,
            request = requests.recv() => match request {
                Some(request) => Wake::Request(request),
                None => Wake::Shutdown,
            },
            Some(job) = fired.recv() => Wake::Fired(job),
            output = protocol.next_output() => match output {
                Some(bytes) => Wake::Output(bytes),
                None => Wake::LinkClosed,
            },
        };

        match wake {
            Wake::Request(request) => handle_request(&mut protocol, request).await,
            Wake::Fired(job) => {
                if !protocol.is_current(&job) {
                    debug!(?job, "dropping stale scheduled firing");
                    continue;
                }
                if let Err(e) = protocol.execute(job.job.event()).await {
                    warn!(?job, "scheduled job failed: {e}");
                }
            }
            Wake::Output(bytes) => protocol.handle_output(&bytes),
            Wake::LinkClosed => {
                warn!("instrument link closed, ending session");
                break;
            }
            Wake::Shutdown => break,
        }
    }
    protocol.teardown();
    info!("session stopped");
}

async fn handle_request(protocol: &mut Protocol, request: Request) {
    // A requester that gave up waiting is not an error.
    match request {
        Request::Execute { event, reply } => {
            let result = protocol.execute(event).await;
            let _ = reply.send(result);
        }
        Request::Get { names, reply } => {
            let registry = protocol.registry();
            let result = match names {
                Some(names) => {
                    let names: Vec<&str> = names.iter().map(String::as_str).collect();
                    registry.get(&names).map_err(DriverError::from)
                }
                None => Ok(registry.get_config()),
            };
            let _ = reply.send(result);
        }
        Request::State { reply } => {
            let _ = reply.send(protocol.state());
        }
        Request::ExportRawConfig { reply } => {
            let _ = reply.send(protocol.registry().export_raw_config());
        }
        Request::ImportRawConfig { blob, reply } => {
            let _ = reply.send(protocol.import_raw_config(&blob));
        }
    }
}
