//! TCP transport for serial-to-Ethernet converters.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{Transport, TransportSettings};
use crate::error::{BusError, BusResult};

/// Raw TCP link to a `host:port`.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Describe a socket; nothing is connected until [`Transport::open`].
    pub fn new(addr: &str, settings: &TransportSettings) -> Self {
        Self {
            addr: addr.to_string(),
            connect_timeout: settings.connect_timeout,
            stream: None,
        }
    }

    fn stream(&mut self) -> BusResult<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| {
            BusError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not connected",
            ))
        })
    }

    /// Drop the socket on a link fault so the next `open` reconnects.
    fn check<T>(&mut self, result: io::Result<T>) -> BusResult<T> {
        result.map_err(|err| {
            if self.stream.take().is_some() {
                warn!(addr = %self.addr, error = %err, "TCP link fault, socket dropped");
            }
            err.into()
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&mut self) -> BusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| BusError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "TCP link connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, bytes: &[u8]) -> BusResult<usize> {
        let stream = self.stream()?;
        let result = stream.write(bytes).await;
        self.check(result)
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> BusResult<Vec<u8>> {
        let stream = self.stream()?;
        let mut buf = vec![0u8; max.max(1)];
        let result = match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(Vec::new()),
        };
        self.check(result)
    }

    async fn reset_input_buffer(&mut self) -> BusResult<()> {
        let stream = self.stream()?;
        let mut scratch = [0u8; 256];
        let result = loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ))
                }
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.check(result)
    }

    async fn close(&mut self) -> BusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(addr = %self.addr, error = %err, "Shutdown after peer close");
            }
            debug!(addr = %self.addr, "TCP link closed");
        }
        Ok(())
    }
}
