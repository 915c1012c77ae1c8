//! Mock transport for unit and integration testing.
//!
//! Lets tests script an instrument without a serial port: every write is
//! recorded and handed to an optional responder closure whose replies are
//! fed back into the session's [`ByteStream`].  Unsolicited output (samples,
//! late replies) can be injected through the [`MockHandle`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ByteStream, Transport, TransportError, INBOUND_CAPACITY};

/// Produces the instrument's reply chunks for one write.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// A [`Transport`] backed by in-memory channels.
pub struct MockTransport {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound: mpsc::Sender<Vec<u8>>,
    responder: Option<Responder>,
}

/// Test-side view of a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound: mpsc::Sender<Vec<u8>>,
}

impl MockTransport {
    /// Creates a silent mock: writes are recorded and nothing is answered.
    pub fn new() -> (Self, MockHandle, ByteStream) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let writes = Arc::new(Mutex::new(Vec::new()));
        let handle = MockHandle {
            writes: Arc::clone(&writes),
            inbound: tx.clone(),
        };
        (
            Self {
                writes,
                inbound: tx,
                responder: None,
            },
            handle,
            rx,
        )
    }

    /// Creates a mock that answers each write with `responder(bytes)`.
    pub fn with_responder<F>(responder: F) -> (Self, MockHandle, ByteStream)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let (mut transport, handle, rx) = Self::new();
        transport.responder = Some(Box::new(responder));
        (transport, handle, rx)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());

        let replies = match self.responder.as_mut() {
            Some(responder) => responder(bytes),
            None => Vec::new(),
        };
        for reply in replies {
            self.inbound
                .send(reply)
                .await
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }
}

impl MockHandle {
    /// Every write so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `true` if some write was exactly `bytes`.
    pub fn was_sent(&self, bytes: &[u8]) -> bool {
        self.writes().iter().any(|w| w == bytes)
    }

    /// Delivers `bytes` as if the instrument sent them unprompted.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the session has dropped its stream.
    pub async fn inject(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.inbound
            .send(bytes.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_writes() {
        // Arrange
        let (mut transport, handle, _rx) = MockTransport::new();

        // Act
        transport.write(b"II").await.unwrap();
        transport.write(b"BV").await.unwrap();

        // Assert
        assert_eq!(handle.writes(), vec![b"II".to_vec(), b"BV".to_vec()]);
        assert!(handle.was_sent(b"BV"));
        assert!(!handle.was_sent(b"ST"));
    }

    #[tokio::test]
    async fn test_responder_replies_arrive_on_stream() {
        // Arrange
        let (mut transport, _handle, mut rx) =
            MockTransport::with_responder(|bytes| vec![bytes.to_vec(), b"\x06\x06".to_vec()]);

        // Act
        transport.write(b"PD").await.unwrap();

        // Assert
        assert_eq!(rx.recv().await.unwrap(), b"PD".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"\x06\x06".to_vec());
    }

    #[tokio::test]
    async fn test_inject_delivers_unsolicited_bytes() {
        let (_transport, handle, mut rx) = MockTransport::new();
        handle.inject(b"\xa5\x10").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"\xa5\x10".to_vec());
    }
}
