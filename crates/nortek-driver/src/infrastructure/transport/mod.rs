//! Byte transports to the instrument.
//!
//! A transport is split in two: a [`Transport`] half that the protocol
//! session writes commands to, and a [`ByteStream`] of received chunks
//! filled by a background reader task.  The reader never interprets bytes;
//! framing is the chunker's job.
//!
//! ```text
//!  Protocol ──write()──▶ Transport ──▶ serial / TCP ──▶ instrument
//!  Protocol ◀─recv()─── ByteStream ◀── reader task ◀──┘
//! ```

pub mod mock;
pub mod stream;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use mock::{MockHandle, MockTransport};
pub use stream::{connect_tcp, open_serial, StreamTransport};

/// Received byte chunks, in arrival order.  Closed when the link drops.
pub type ByteStream = mpsc::Receiver<Vec<u8>>;

/// Capacity of the reader-to-session channel, in chunks.
pub const INBOUND_CAPACITY: usize = 256;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("could not open serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("transport closed")]
    Closed,
}

/// Write half of an instrument link.
#[async_trait]
pub trait Transport: Send {
    /// Writes all of `bytes` to the instrument.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Write`] or [`TransportError::Closed`].
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes).await
    }
}
