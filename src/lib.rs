//! Core library for the instrument bus.
//!
//! Laboratory instruments (programmable supplies, remote I/O modules, thermostats, Modbus
//! slaves) are driven through one request/response engine. Several devices may share a
//! serial line or a serial-to-Ethernet converter; the engine serialises their exchanges,
//! selects each device's address before talking to it, validates framing and checksums,
//! retries failed exchanges a bounded number of times and suspends devices that stop
//! answering so the rest of the bus keeps working.
//!
//! The pieces, leaves first:
//! - [`transport`]: byte links (serial, TCP, emulated) and the shared, locked wrapper.
//! - [`protocol`]: framing policies per instrument family.
//! - [`registry`]: who owns which (endpoint, address), plus the transport pool.
//! - [`session`]: the device state machine, async and blocking.
//! - [`devices`]: typed accessors per family.
//! - [`config`] and [`logging`]: file/env configuration and tracing setup.
//!
//! ```no_run
//! use std::sync::Arc;
//! use instrument_bus::devices::{connect, TdkLambda};
//! use instrument_bus::{Registry, SessionOptions};
//!
//! # async fn demo() -> instrument_bus::BusResult<()> {
//! let registry = Arc::new(Registry::new());
//! let mut psu: TdkLambda =
//!     connect(registry, "/dev/ttyUSB0".parse()?, 6, SessionOptions::default()).await;
//! let volts = psu.read_voltage().await;
//! # let _ = volts;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{BusConfig, ConfigError, DeviceDefinition};
pub use error::{BusError, BusResult};
pub use protocol::{Protocol, ProtocolKind};
pub use registry::Registry;
pub use session::blocking::{BlockingBus, Session};
pub use session::{AsyncSession, SessionOptions, SessionState};
pub use transport::{Endpoint, MockTransport, SharedTransport, Transport};
