//! TDK-Lambda GEN programmable DC supplies.
//!
//! Up to 30 supplies share one RS-485 link; the session selects each one with `ADR n`
//! before talking to it. The model code in the identity (`GEN10-100`) gives the voltage
//! and current limits that writes are checked against.

use super::impl_device;
use crate::error::BusError;
use crate::protocol::GenProtocol;
use crate::session::AsyncSession;

/// A GEN series supply.
#[derive(Debug)]
pub struct TdkLambda {
    session: AsyncSession,
}

impl_device!(TdkLambda, |options| GenProtocol::new(options.checksum));

impl TdkLambda {
    /// Identity string, e.g. `LAMBDA,GEN10-100`.
    pub async fn read_device_id(&mut self) -> Option<String> {
        self.session.query(b"IDN?").await
    }

    /// Serial number.
    pub async fn read_serial_number(&mut self) -> Option<String> {
        self.session.query(b"SN?").await
    }

    /// Measured output voltage.
    pub async fn read_voltage(&mut self) -> f64 {
        self.session.query_f64(b"MV?").await
    }

    /// Measured output current.
    pub async fn read_current(&mut self) -> f64 {
        self.session.query_f64(b"MC?").await
    }

    /// Programmed voltage setpoint.
    pub async fn read_programmed_voltage(&mut self) -> f64 {
        self.session.query_f64(b"PV?").await
    }

    /// Programmed current setpoint.
    pub async fn read_programmed_current(&mut self) -> f64 {
        self.session.query_f64(b"PC?").await
    }

    /// Program the voltage setpoint. Values outside `0..=max_voltage` are refused locally.
    pub async fn write_voltage(&mut self, volts: f64) -> bool {
        if !self.check_range(volts, self.max_voltage()) {
            return false;
        }
        self.session
            .command_expect(format!("PV {volts:.3}").as_bytes(), b"OK")
            .await
    }

    /// Program the current setpoint. Values outside `0..=max_current` are refused locally.
    pub async fn write_current(&mut self, amps: f64) -> bool {
        if !self.check_range(amps, self.max_current()) {
            return false;
        }
        self.session
            .command_expect(format!("PC {amps:.3}").as_bytes(), b"OK")
            .await
    }

    /// Output state; `None` when the supply did not answer sensibly.
    pub async fn read_output(&mut self) -> Option<bool> {
        let reply = self.session.query(b"OUT?").await?;
        match reply.as_str() {
            "ON" | "1" => Some(true),
            "OFF" | "0" => Some(false),
            other => {
                self.session.reject(BusError::Conversion(format!(
                    "unexpected output state {other:?}"
                )));
                None
            }
        }
    }

    /// Switch the output on or off.
    pub async fn write_output(&mut self, on: bool) -> bool {
        let command: &[u8] = if on { b"OUT ON" } else { b"OUT OFF" };
        self.session.command_expect(command, b"OK").await
    }

    /// Rated voltage from the model code.
    pub fn max_voltage(&self) -> f64 {
        self.session.limits().max_voltage
    }

    /// Rated current from the model code.
    pub fn max_current(&self) -> f64 {
        self.session.limits().max_current
    }

    fn check_range(&mut self, value: f64, limit: f64) -> bool {
        if value.is_finite() && (0.0..=limit).contains(&value) {
            return true;
        }
        self.session.reject(BusError::OutOfRange { value, limit });
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{connect, Device};
    use crate::registry::Registry;
    use crate::session::SessionOptions;
    use crate::transport::{Endpoint, MockTransport};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn fake_supply() -> MockTransport {
        let output = Arc::new(Mutex::new(false));
        MockTransport::new().with_responder(move |frame| {
            let text = String::from_utf8_lossy(frame);
            let cmd = text.trim_end_matches('\r');
            let reply = match cmd {
                c if c.starts_with("ADR ") => "OK".to_string(),
                "IDN?" => "FAKELAMBDA GEN10-100".to_string(),
                "SN?" => "123A456-7890".to_string(),
                "MV?" => "4.998".to_string(),
                "MC?" => "0.250".to_string(),
                "OUT?" => (if *output.lock() { "ON" } else { "OFF" }).to_string(),
                "OUT ON" => {
                    *output.lock() = true;
                    "OK".to_string()
                }
                c if c.starts_with("PV ") => "OK".to_string(),
                _ => "C01".to_string(),
            };
            Some(format!("{reply}\r").into_bytes())
        })
    }

    async fn supply(mock: &MockTransport) -> TdkLambda {
        let registry = Arc::new(Registry::new());
        let endpoint = Endpoint::Virtual("gen".into());
        registry.attach_transport(endpoint.clone(), mock.clone());
        connect::<TdkLambda>(registry, endpoint, 6, SessionOptions::default()).await
    }

    #[tokio::test]
    async fn identity_and_limits() {
        let mock = fake_supply();
        let mut psu = supply(&mock).await;
        assert!(psu.is_ready());
        assert_eq!(
            psu.read_device_id().await.as_deref(),
            Some("FAKELAMBDA GEN10-100")
        );
        assert_eq!(psu.max_voltage(), 10.0);
        assert_eq!(psu.max_current(), 100.0);
        assert_eq!(psu.read_serial_number().await.as_deref(), Some("123A456-7890"));
    }

    #[tokio::test]
    async fn measurements_and_output() {
        let mock = fake_supply();
        let mut psu = supply(&mock).await;
        assert_eq!(psu.read_voltage().await, 4.998);
        assert_eq!(psu.read_current().await, 0.25);
        assert_eq!(psu.read_output().await, Some(false));
        assert!(psu.write_output(true).await);
        assert_eq!(psu.read_output().await, Some(true));
    }

    #[tokio::test]
    async fn out_of_range_write_never_reaches_the_bus() {
        let mock = fake_supply();
        let mut psu = supply(&mock).await;
        mock.clear_events();

        assert!(!psu.write_voltage(12.0).await);
        assert!(!psu.write_voltage(-1.0).await);
        assert!(mock.writes().is_empty());
        assert!(psu.is_ready());
        assert!(matches!(
            psu.session().last_error(),
            Some(BusError::OutOfRange { .. })
        ));

        assert!(psu.write_voltage(5.0).await);
        assert_eq!(mock.writes(), vec![b"PV 5.000\r".to_vec()]);
    }

    #[tokio::test]
    async fn refused_command_gives_sentinel() {
        let mock = fake_supply();
        let mut psu = supply(&mock).await;
        assert!(psu.read_programmed_voltage().await.is_nan());
        assert!(matches!(
            psu.session().last_error(),
            Some(BusError::DeviceError(code)) if code == "C01"
        ));
        assert!(psu.is_ready());
    }
}
