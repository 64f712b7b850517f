//! TCP transport for networked cockpits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::{tcp::OwnedWriteHalf, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info};

use super::{spawn_reader, EventSender, Transport, TransportFault};

/// TCP port of the Daum 8i network interface
pub const DAUM_PREMIUM_TCP_PORT: u16 = 51955;

/// Raw TCP socket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl TcpConfig {
    /// Configuration for a host on the given port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Daum 8i reachable on its default port
    pub fn daum_premium(host: impl Into<String>) -> Self {
        Self::new(host, DAUM_PREMIUM_TCP_PORT)
    }
}

/// Transport over a raw TCP socket
pub struct TcpTransport {
    config: TcpConfig,
    name: String,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Create an unopened TCP transport
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        let name = format!("tcp://{}:{}", config.host, config.port);
        Self {
            config,
            name,
            writer: None,
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, events: EventSender) -> Result<(), TransportFault> {
        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        if let Some(previous) = self.reader.take() {
            previous.abort();
        }
        self.reader = Some(spawn_reader(self.name.clone(), read_half, events));
        self.writer = Some(write_half);

        info!("{}: socket open", self.name);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportFault> {
        let writer = self.writer.as_mut().ok_or(TransportFault::NotOpen)?;
        debug!("{}: sending {:02X?}", self.name, data);
        writer.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportFault> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let mut writer = self.writer.take().ok_or(TransportFault::NotOpen)?;
        writer.flush().await?;
        writer.shutdown().await?;
        info!("{}: socket closed", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;
    use tokio::{io::AsyncReadExt, net::TcpListener, sync::mpsc};

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&[buf[0], buf[1], 0x01]).await.unwrap();
        });

        let mut transport = TcpTransport::new(TcpConfig::new("127.0.0.1", port));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        transport.write(&[0x10, 0x00]).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            match rx.recv().await {
                Some(TransportEvent::Data(bytes)) => received.extend_from_slice(&bytes),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(received, vec![0x10, 0x00, 0x01]);

        server.await.unwrap();
        if let Err(fault) = transport.close().await {
            assert!(fault.is_close_side_effect(), "unexpected close failure {fault}");
        }
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let mut transport = TcpTransport::new(TcpConfig::daum_premium("127.0.0.1"));
        assert_eq!(transport.name(), "tcp://127.0.0.1:51955");
        assert_eq!(
            transport.write(&[0x01]).await,
            Err(TransportFault::NotOpen)
        );
        assert_eq!(transport.close().await, Err(TransportFault::NotOpen));
    }
}
