//! ITECH IT6900 series supplies over SCPI.
//!
//! Point-to-point links only, so there is no address select. Setting commands are chained
//! with `*OPC?` so every write gets a `1` back and failures are visible.

use super::impl_device;
use crate::error::BusError;
use crate::protocol::ScpiProtocol;
use crate::session::AsyncSession;

/// An IT6900 supply.
#[derive(Debug)]
pub struct It6900 {
    session: AsyncSession,
}

impl_device!(It6900, |_options| ScpiProtocol::default());

impl It6900 {
    /// `*IDN?` reply: manufacturer, model, serial, firmware.
    pub async fn read_device_id(&mut self) -> Option<String> {
        self.session.query(b"*IDN?").await
    }

    /// Serial number field of the identity.
    pub async fn read_serial_number(&mut self) -> Option<String> {
        let id = self.read_device_id().await?;
        id.split(',').nth(2).map(|s| s.trim().to_string())
    }

    /// Measured voltage.
    pub async fn read_voltage(&mut self) -> f64 {
        self.session.query_f64(b"MEAS:VOLT?").await
    }

    /// Measured current.
    pub async fn read_current(&mut self) -> f64 {
        self.session.query_f64(b"MEAS:CURR?").await
    }

    /// Programmed voltage.
    pub async fn read_programmed_voltage(&mut self) -> f64 {
        self.session.query_f64(b"VOLT?").await
    }

    /// Programmed current.
    pub async fn read_programmed_current(&mut self) -> f64 {
        self.session.query_f64(b"CURR?").await
    }

    /// Program the voltage.
    pub async fn write_voltage(&mut self, volts: f64) -> bool {
        if !self.check_finite(volts) {
            return false;
        }
        self.set(format!("VOLT {volts:.4}")).await
    }

    /// Program the current.
    pub async fn write_current(&mut self, amps: f64) -> bool {
        if !self.check_finite(amps) {
            return false;
        }
        self.set(format!("CURR {amps:.4}")).await
    }

    /// Output state.
    pub async fn read_output(&mut self) -> Option<bool> {
        let reply = self.session.query(b"OUTP?").await?;
        match reply.as_str() {
            "1" | "ON" => Some(true),
            "0" | "OFF" => Some(false),
            other => {
                self.session.reject(BusError::Conversion(format!(
                    "unexpected output state {other:?}"
                )));
                None
            }
        }
    }

    /// Switch the output.
    pub async fn write_output(&mut self, on: bool) -> bool {
        self.set(format!("OUTP {}", if on { "ON" } else { "OFF" }))
            .await
    }

    fn check_finite(&mut self, value: f64) -> bool {
        if value.is_finite() {
            return true;
        }
        self.session
            .reject(BusError::Conversion(format!("cannot program {value}")));
        false
    }

    async fn set(&mut self, command: String) -> bool {
        self.session
            .command_expect(format!("{command};*OPC?").as_bytes(), b"1")
            .await
    }
}
