//! Lauda circulating thermostats.

use super::impl_device;
use crate::protocol::LaudaProtocol;
use crate::session::AsyncSession;

/// A Lauda thermostat.
#[derive(Debug)]
pub struct Lauda {
    session: AsyncSession,
}

impl_device!(Lauda, |_options| LaudaProtocol);

impl Lauda {
    /// Device type reported at initialisation.
    pub fn device_type(&self) -> Option<&str> {
        self.session.identity()
    }

    /// Bath temperature in °C.
    pub async fn read_bath_temperature(&mut self) -> f64 {
        self.session.query_f64(b"IN_PV_00").await
    }

    /// Temperature setpoint in °C.
    pub async fn read_setpoint(&mut self) -> f64 {
        self.session.query_f64(b"IN_SP_00").await
    }

    /// Change the setpoint. The thermostat acknowledges with `ACK`.
    pub async fn write_setpoint(&mut self, celsius: f64) -> bool {
        if !celsius.is_finite() {
            self.session.reject(crate::error::BusError::Conversion(format!(
                "cannot program setpoint {celsius}"
            )));
            return false;
        }
        self.session
            .command_expect(format!("OUT_SP_00 {celsius:.2}").as_bytes(), b"")
            .await
    }

    /// Start circulation.
    pub async fn start(&mut self) -> bool {
        self.session.command_expect(b"START", b"").await
    }

    /// Stop circulation.
    pub async fn stop(&mut self) -> bool {
        self.session.command_expect(b"STOP", b"").await
    }
}
