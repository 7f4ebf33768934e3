//! Typed accessors for the supported instrument families.
//!
//! Each driver wraps an [`AsyncSession`] configured with its family's framing and turns raw
//! exchanges into typed reads and writes. Failures never surface as errors: reads return
//! `NaN` or `None`, writes return `false`, and the cause is kept in
//! [`AsyncSession::last_error`].
//!
//! | Driver             | Family                      | Framing                |
//! |--------------------|-----------------------------|------------------------|
//! | [`TdkLambda`]      | TDK-Lambda GEN supplies     | [`GenProtocol`]        |
//! | [`It6900`]         | ITECH IT6900 supplies       | [`ScpiProtocol`]       |
//! | [`Adam`]           | Advantech Adam-4000 modules | [`AdamProtocol`]       |
//! | [`Lauda`]          | Lauda thermostats           | [`LaudaProtocol`]      |
//! | [`ModbusDevice`]   | Generic Modbus-RTU slaves   | [`ModbusRtu`]          |
//!
//! [`GenProtocol`]: crate::protocol::GenProtocol
//! [`ScpiProtocol`]: crate::protocol::ScpiProtocol
//! [`AdamProtocol`]: crate::protocol::AdamProtocol
//! [`LaudaProtocol`]: crate::protocol::LaudaProtocol
//! [`ModbusRtu`]: crate::protocol::ModbusRtu

mod adam;
mod it6900;
mod lauda;
mod modbus;
mod tdk_lambda;

pub use adam::Adam;
pub use it6900::It6900;
pub use lauda::Lauda;
pub use modbus::ModbusDevice;
pub use tdk_lambda::TdkLambda;

use std::sync::Arc;

use crate::protocol::Protocol;
use crate::registry::Registry;
use crate::session::{AsyncSession, SessionOptions};
use crate::transport::Endpoint;

/// An instrument driver built on one session.
pub trait Device: Sized + Send {
    /// Framing policy for this family.
    fn protocol(options: &SessionOptions) -> Arc<dyn Protocol>;

    /// Wrap an already constructed session.
    fn from_session(session: AsyncSession) -> Self;

    /// Underlying session.
    fn session(&self) -> &AsyncSession;

    /// Underlying session, mutably.
    fn session_mut(&mut self) -> &mut AsyncSession;

    /// Whether commands will be attempted.
    fn is_ready(&self) -> bool {
        self.session().is_ready()
    }
}

/// Create and initialise a driver. Check [`Device::is_ready`] afterwards.
pub async fn connect<D: Device>(
    registry: Arc<Registry>,
    endpoint: Endpoint,
    address: u16,
    options: SessionOptions,
) -> D {
    let protocol = D::protocol(&options);
    D::from_session(AsyncSession::connect(registry, endpoint, address, protocol, options).await)
}

macro_rules! impl_device {
    ($ty:ty, |$options:ident| $protocol:expr) => {
        impl $crate::devices::Device for $ty {
            fn protocol(
                options: &$crate::session::SessionOptions,
            ) -> ::std::sync::Arc<dyn $crate::protocol::Protocol> {
                let $options = options;
                ::std::sync::Arc::new($protocol)
            }

            fn from_session(session: $crate::session::AsyncSession) -> Self {
                Self { session }
            }

            fn session(&self) -> &$crate::session::AsyncSession {
                &self.session
            }

            fn session_mut(&mut self) -> &mut $crate::session::AsyncSession {
                &mut self.session
            }
        }
    };
}
pub(crate) use impl_device;

/// Parse the leading hex digits of `text` into a `u16`.
fn parse_hex_u16(text: &str, digits: usize) -> Option<u16> {
    text.get(..digits)
        .and_then(|hex| u16::from_str_radix(hex, 16).ok())
}
