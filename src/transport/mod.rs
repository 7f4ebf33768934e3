//! Byte links to instruments and the shared, lock-protected wrapper sessions use.
//!
//! A [`Transport`] is a raw link: serial port, TCP socket, or an in-process emulation.
//! Several device sessions may sit on one link (RS-485 multidrop), so links are always
//! accessed through a [`SharedTransport`]. Its async mutex is held for a complete
//! request/response exchange, and it caches which device address the link currently has
//! selected.

pub mod mock;
#[cfg(feature = "serial")]
mod serial;
mod tcp;

pub use mock::{MockEvent, MockTransport};
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};

/// Raw byte link.
///
/// `read` returns between zero and `max` bytes and must not block past `timeout`;
/// an empty read is a normal outcome, not an error. Once the underlying handle is unusable
/// the link must report closed, so the next [`open`](Transport::open) reconnects instead of
/// reusing a dead handle. The serial and TCP links drop their handle on every non-timeout
/// I/O error.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Open the link. Must be idempotent.
    async fn open(&mut self) -> BusResult<()>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Write bytes, returning how many were accepted.
    async fn write(&mut self, bytes: &[u8]) -> BusResult<usize>;

    /// Read up to `max` bytes, waiting at most `timeout`.
    async fn read(&mut self, max: usize, timeout: Duration) -> BusResult<Vec<u8>>;

    /// Discard any bytes received but not yet read.
    async fn reset_input_buffer(&mut self) -> BusResult<()>;

    /// Close the link.
    async fn close(&mut self) -> BusResult<()>;
}

/// Where a link goes.
///
/// Parsed from strings such as `/dev/ttyUSB0`, `COM3`, `tcp://10.0.0.5:4001`,
/// `10.0.0.5:4001` or `virtual://bench`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// Serial device path or port name.
    Serial(String),
    /// `host:port` of a serial-to-Ethernet converter.
    Tcp(String),
    /// Named in-process link; the transport must be attached to the registry.
    Virtual(String),
}

impl Endpoint {
    fn looks_like_socket(s: &str) -> bool {
        !s.starts_with('/')
            && s.rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
    }
}

impl FromStr for Endpoint {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || BusError::InvalidEndpoint(s.to_string());

        if let Some(addr) = s.strip_prefix("tcp://") {
            return if Self::looks_like_socket(addr) {
                Ok(Endpoint::Tcp(addr.to_string()))
            } else {
                Err(invalid())
            };
        }
        if let Some(name) = s.strip_prefix("virtual://") {
            return if name.is_empty() {
                Err(invalid())
            } else {
                Ok(Endpoint::Virtual(name.to_string()))
            };
        }
        let path = s.strip_prefix("serial://").unwrap_or(s);
        if path.is_empty() {
            return Err(invalid());
        }
        if Self::looks_like_socket(path) && !s.starts_with("serial://") {
            return Ok(Endpoint::Tcp(path.to_string()));
        }
        Ok(Endpoint::Serial(path.to_string()))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(value: Endpoint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial(path) => f.write_str(path),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Virtual(name) => write!(f, "virtual://{name}"),
        }
    }
}

/// Link parameters used when a transport is created for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Serial baud rate (ignored for TCP).
    pub baud_rate: u32,
    /// Upper bound on establishing the link.
    pub connect_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Build an unopened transport for `endpoint`.
pub fn connect_transport(
    endpoint: &Endpoint,
    settings: &TransportSettings,
) -> BusResult<Box<dyn Transport>> {
    match endpoint {
        #[cfg(feature = "serial")]
        Endpoint::Serial(path) => Ok(Box::new(SerialTransport::new(path, settings))),
        #[cfg(not(feature = "serial"))]
        Endpoint::Serial(_) => Err(BusError::SerialFeatureDisabled),
        Endpoint::Tcp(addr) => Ok(Box::new(TcpTransport::new(addr, settings))),
        Endpoint::Virtual(_) => Err(BusError::TransportNotReady(format!(
            "{endpoint} has no attached transport"
        ))),
    }
}

/// Exclusive view of a link, held for one exchange.
#[derive(Debug)]
pub struct Link {
    endpoint: Endpoint,
    io: Box<dyn Transport>,
    addressed: Option<u16>,
}

impl Link {
    /// Open the link if needed.
    pub async fn ensure_open(&mut self) -> BusResult<()> {
        if !self.io.is_open() {
            debug!(endpoint = %self.endpoint, "Opening transport");
            self.addressed = None;
            self.io.open().await?;
        }
        Ok(())
    }

    /// Whether the underlying link is open.
    pub fn is_open(&self) -> bool {
        self.io.is_open()
    }

    /// Device address currently selected on the link, if known.
    pub fn addressed(&self) -> Option<u16> {
        self.addressed
    }

    /// Record which device the link has selected.
    pub fn set_addressed(&mut self, address: Option<u16>) {
        self.addressed = address;
    }

    /// Write the whole buffer; a short write is an error.
    pub async fn write_all(&mut self, bytes: &[u8]) -> BusResult<()> {
        let written = self.io.write(bytes).await?;
        if written != bytes.len() {
            return Err(BusError::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        Ok(())
    }

    /// Read up to `max` bytes within `timeout`.
    pub async fn read(&mut self, max: usize, timeout: Duration) -> BusResult<Vec<u8>> {
        self.io.read(max, timeout).await
    }

    /// Drop stale input.
    pub async fn reset_input_buffer(&mut self) -> BusResult<()> {
        self.io.reset_input_buffer().await
    }
}

/// A link shared by every session on one endpoint.
#[derive(Debug)]
pub struct SharedTransport {
    endpoint: Endpoint,
    link: Mutex<Link>,
}

impl SharedTransport {
    /// Wrap an unopened transport.
    pub fn new(endpoint: Endpoint, io: Box<dyn Transport>) -> Self {
        Self {
            link: Mutex::new(Link {
                endpoint: endpoint.clone(),
                io,
                addressed: None,
            }),
            endpoint,
        }
    }

    /// Endpoint this link goes to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Acquire the link for a full exchange.
    pub async fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().await
    }

    /// Open the link if needed and report whether it is ready.
    pub async fn open(&self) -> bool {
        let mut link = self.link.lock().await;
        match link.ensure_open().await {
            Ok(()) => true,
            Err(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "Transport not ready");
                false
            }
        }
    }

    /// Write outside of a session exchange, reporting success as a flag.
    pub async fn write(&self, bytes: &[u8]) -> bool {
        let mut link = self.link.lock().await;
        match link.write_all(bytes).await {
            Ok(()) => true,
            Err(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "Write failed");
                false
            }
        }
    }

    /// Device address the link currently has selected.
    pub async fn addressed(&self) -> Option<u16> {
        self.link.lock().await.addressed
    }

    /// Close the link and forget the selected address.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        link.addressed = None;
        if let Err(err) = link.io.close().await {
            warn!(endpoint = %self.endpoint, error = %err, "Error closing transport");
        } else {
            debug!(endpoint = %self.endpoint, "Transport closed");
        }
    }
}
