//! TCP and serial transports over any Tokio byte stream.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::{ByteStream, Transport, TransportError, INBOUND_CAPACITY};

const READ_CHUNK: usize = 1024;

/// Write half of a split Tokio stream.
pub struct StreamTransport<W> {
    writer: W,
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(TransportError::Write)?;
        self.writer.flush().await.map_err(TransportError::Write)?;
        debug!(bytes = bytes.len(), "TX");
        Ok(())
    }
}

/// Splits `stream` and spawns a reader task feeding the returned [`ByteStream`].
///
/// The reader stops when the peer closes, on a read error, or once the
/// receiving side is dropped.
pub fn attach<S>(stream: S) -> (StreamTransport<WriteHalf<S>>, ByteStream)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("instrument link closed by peer");
                    break;
                }
                Ok(n) => {
                    debug!(bytes = n, "RX");
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("instrument link read error: {e}");
                    break;
                }
            }
        }
    });

    (StreamTransport { writer }, rx)
}

/// Connects to a serial-to-Ethernet bridge (or simulator) over TCP.
///
/// # Errors
///
/// Returns [`TransportError::Connect`] or [`TransportError::ConnectTimeout`].
pub async fn connect_tcp(
    addr: &str,
    timeout: Duration,
) -> Result<(StreamTransport<WriteHalf<TcpStream>>, ByteStream), TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            addr: addr.to_string(),
        })?
        .map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("could not disable Nagle on {addr}: {e}");
    }
    info!("connected to instrument at {addr}");
    Ok(attach(stream))
}

/// Opens a local serial port at 8-N-1.
///
/// # Errors
///
/// Returns [`TransportError::Serial`] if the port cannot be opened.
pub fn open_serial(
    port: &str,
    baud_rate: u32,
) -> Result<(StreamTransport<WriteHalf<SerialStream>>, ByteStream), TransportError> {
    let stream = tokio_serial::new(port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
        .map_err(|source| TransportError::Serial {
            port: port.to_string(),
            source,
        })?;
    info!("opened serial port {port} at {baud_rate} baud");
    Ok(attach(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_attach_forwards_reads_and_writes() {
        // Arrange
        let (ours, mut theirs) = duplex(64);
        let (mut transport, mut inbound) = attach(ours);

        // Act
        transport.write(b"II").await.unwrap();
        theirs.write_all(b"\x02\x00\x06\x06").await.unwrap();

        // Assert
        let mut sent = [0u8; 2];
        theirs.read_exact(&mut sent).await.unwrap();
        assert_eq!(&sent, b"II");
        assert_eq!(inbound.recv().await.unwrap(), b"\x02\x00\x06\x06".to_vec());
    }

    #[tokio::test]
    async fn test_stream_closes_when_peer_drops() {
        let (ours, theirs) = duplex(64);
        let (_transport, mut inbound) = attach(ours);
        drop(theirs);
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_tcp_reports_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect_tcp(&addr, Duration::from_secs(1)).await;

        assert!(matches!(
            result,
            Err(TransportError::Connect { .. }) | Err(TransportError::ConnectTimeout { .. })
        ));
    }
}
