//! Physical links: the byte pipes a [`crate::DeviceLink`] drives.
//!
//! A transport opens and closes the physical connection and writes bytes.
//! Everything it observes asynchronously (arriving bytes, I/O failures, the
//! peer going away) is reported as a [`TransportEvent`] on the channel handed
//! to [`Transport::open`]. Arriving bytes carry no message boundaries; the
//! codec reassembles them.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

/// Size of the read buffer used by stream-backed transports
pub const READ_BUFFER_SIZE: usize = 256;

/// Failure reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// Port or socket is not open
    #[error("port not open")]
    NotOpen,
    /// Peer closed the connection
    #[error("connection closed by peer")]
    Closed,
    /// Any other I/O failure
    #[error("{0}")]
    Io(String),
}

impl TransportFault {
    /// Whether this fault is the expected side effect of closing the link
    #[must_use]
    pub const fn is_close_side_effect(&self) -> bool {
        matches!(self, Self::NotOpen | Self::Closed)
    }
}

impl From<std::io::Error> for TransportFault {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotConnected => Self::NotOpen,
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(error.to_string()),
        }
    }
}

/// Asynchronous notification from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// New bytes arrived
    Data(Bytes),
    /// I/O failure not tied to a caller-initiated operation
    Error(TransportFault),
    /// Peer closed the connection
    Closed,
}

/// Sending half of a transport event channel
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport event channel
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// A physical connection to one device
#[async_trait]
pub trait Transport: Send {
    /// Short description used in logs
    fn name(&self) -> &str;

    /// Open the connection and start reporting events on `events`
    ///
    /// Resolving `Ok` means the transport is open.
    async fn open(&mut self, events: EventSender) -> Result<(), TransportFault>;

    /// Write bytes to the device
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportFault>;

    /// Flush and close the connection
    async fn close(&mut self) -> Result<(), TransportFault>;
}

/// Pump bytes from `reader` into `events` until EOF or failure
pub(crate) fn spawn_reader<R>(name: String, mut reader: R, events: EventSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("{name}: end of stream");
                    let _ = events.send(TransportEvent::Closed);
                    break;
                }
                Ok(n) => {
                    debug!("{name}: received {:02X?}", &buf[..n]);
                    if events
                        .send(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{name}: read failed: {e}");
                    let fault = TransportFault::from(e);
                    let closed = fault == TransportFault::Closed;
                    let _ = events.send(TransportEvent::Error(fault));
                    if closed {
                        let _ = events.send(TransportEvent::Closed);
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_from_io_error() {
        let fault = TransportFault::from(std::io::Error::from(std::io::ErrorKind::NotConnected));
        assert_eq!(fault, TransportFault::NotOpen);
        assert!(fault.is_close_side_effect());

        let fault = TransportFault::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(fault, TransportFault::Closed);

        let fault = TransportFault::from(std::io::Error::other("framing error"));
        assert_eq!(fault, TransportFault::Io("framing error".to_string()));
        assert!(!fault.is_close_side_effect());
    }

    #[tokio::test]
    async fn test_reader_reports_data_then_close() {
        let (mut client, server) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_reader("duplex".to_string(), server, tx);

        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x10, 0x00, 0x01])
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Data(Bytes::from_static(&[0x10, 0x00, 0x01])))
        );

        drop(client);
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed));
        handle.await.unwrap();
    }
}
