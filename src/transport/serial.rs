//! RS-232 transport over `tokio-serial`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncWriteExt, WriteHalf},
    task::JoinHandle,
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::{spawn_reader, EventSender, Transport, TransportFault};

/// RS-232 port configuration (8N1, no flow control)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub path: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl SerialConfig {
    /// Daum 8008 Classic cockpits talk at 9600 baud
    pub fn daum_classic(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: 9_600,
        }
    }

    /// Daum 8i Premium cockpits talk at 19200 baud
    pub fn daum_premium(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: 19_200,
        }
    }

    /// Kettler ergometers talk at 9600 baud
    pub fn kettler(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: 9_600,
        }
    }
}

/// Transport over a serial port
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Create an unopened serial transport
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.path
    }

    async fn open(&mut self, events: EventSender) -> Result<(), TransportFault> {
        let stream = tokio_serial::new(&self.config.path, self.config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportFault::Io(e.to_string()))?;
        let (read_half, write_half) = tokio::io::split(stream);

        if let Some(previous) = self.reader.take() {
            previous.abort();
        }
        self.reader = Some(spawn_reader(self.config.path.clone(), read_half, events));
        self.writer = Some(write_half);

        info!(
            "{}: port open at {} baud",
            self.config.path, self.config.baud_rate
        );
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportFault> {
        let writer = self.writer.as_mut().ok_or(TransportFault::NotOpen)?;
        debug!("{}: sending {:02X?}", self.config.path, data);
        writer.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportFault> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let mut writer = self.writer.take().ok_or(TransportFault::NotOpen)?;
        writer.flush().await?;
        info!("{}: port closed", self.config.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_family_baud_rates() {
        assert_eq!(SerialConfig::daum_classic("COM1").baud_rate, 9_600);
        assert_eq!(SerialConfig::daum_premium("COM1").baud_rate, 19_200);
        assert_eq!(SerialConfig::kettler("/dev/ttyUSB0").baud_rate, 9_600);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport =
            SerialTransport::new(SerialConfig::daum_classic("/dev/ergolink-missing-port"));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            transport.open(tx).await,
            Err(TransportFault::Io(_))
        ));
        assert_eq!(transport.write(&[0x10]).await, Err(TransportFault::NotOpen));
    }
}
