//! Serial port transport on top of `tokio-serial`.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace, warn};

use super::{Transport, TransportSettings};
use crate::error::{BusError, BusResult};

/// 8N1 serial link without flow control.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    /// Describe a port; nothing is opened until [`Transport::open`].
    pub fn new(path: &str, settings: &TransportSettings) -> Self {
        Self {
            path: path.to_string(),
            baud_rate: settings.baud_rate,
            stream: None,
        }
    }

    fn stream(&mut self) -> BusResult<&mut SerialStream> {
        self.stream.as_mut().ok_or_else(|| {
            BusError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port is not open",
            ))
        })
    }

    /// Drop the port handle on a link fault so the next `open` starts over.
    fn check<T>(&mut self, result: io::Result<T>) -> BusResult<T> {
        result.map_err(|err| {
            if self.stream.take().is_some() {
                warn!(path = %self.path, error = %err, "Serial link fault, port dropped");
            }
            err.into()
        })
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> BusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;
        debug!(path = %self.path, baud = self.baud_rate, "Serial port opened");
        self.stream = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, bytes: &[u8]) -> BusResult<usize> {
        let stream = self.stream()?;
        let result = async {
            let written = stream.write(bytes).await?;
            stream.flush().await?;
            Ok::<_, io::Error>(written)
        }
        .await;
        let written = self.check(result)?;
        trace!(bytes = written, "Serial write");
        Ok(written)
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> BusResult<Vec<u8>> {
        let stream = self.stream()?;
        let mut buf = vec![0u8; max.max(1)];
        let result = match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(err)) if err.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(Vec::new()),
        };
        self.check(result)
    }

    async fn reset_input_buffer(&mut self) -> BusResult<()> {
        let stream = self.stream()?;
        let result = stream.clear(ClearBuffer::Input).map_err(io::Error::from);
        self.check(result)
    }

    async fn close(&mut self) -> BusResult<()> {
        if self.stream.take().is_some() {
            debug!(path = %self.path, "Serial port closed");
        }
        Ok(())
    }
}
