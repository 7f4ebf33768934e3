//! Advantech Adam-4000 remote I/O modules.
//!
//! `$` configuration commands answer `!AA...` (address echoed), `#` data commands answer
//! `>...`. The framing layer strips only the lead character, so replies that echo the
//! address are trimmed here.

use super::{impl_device, parse_hex_u16};
use crate::error::BusError;
use crate::protocol::AdamProtocol;
use crate::session::AsyncSession;

/// An Adam-4000 module.
#[derive(Debug)]
pub struct Adam {
    session: AsyncSession,
}

impl_device!(Adam, |options| AdamProtocol::new(options.checksum));

impl Adam {
    /// Module name, e.g. `4017`.
    pub async fn read_module_name(&mut self) -> Option<String> {
        self.query_echoed(b"$M").await
    }

    /// Firmware version.
    pub async fn read_firmware_version(&mut self) -> Option<String> {
        self.query_echoed(b"$F").await
    }

    /// One analog input channel in engineering units.
    pub async fn read_analog_input(&mut self, channel: u8) -> f64 {
        if channel > 7 {
            self.session
                .reject(BusError::InvalidCommand(format!("no analog channel {channel}")));
            return f64::NAN;
        }
        self.session
            .query_f64(format!("#{channel}").as_bytes())
            .await
    }

    /// Every analog input channel; empty when the module did not answer.
    pub async fn read_analog_inputs(&mut self) -> Vec<f64> {
        let Some(reply) = self.session.query(b"#").await else {
            return Vec::new();
        };
        match split_signed_values(&reply) {
            Some(values) => values,
            None => {
                self.session.reject(BusError::Conversion(format!(
                    "unexpected analog data {reply:?}"
                )));
                Vec::new()
            }
        }
    }

    /// Digital I/O status word: output byte high, input byte low.
    pub async fn read_digital_io(&mut self) -> Option<u16> {
        let reply = self.session.query(b"$6").await?;
        let word = parse_hex_u16(&reply, 4);
        if word.is_none() {
            self.session.reject(BusError::Conversion(format!(
                "unexpected digital status {reply:?}"
            )));
        }
        word
    }

    /// Set one digital output channel.
    pub async fn write_digital_output(&mut self, channel: u8, on: bool) -> bool {
        if channel > 0x0F {
            self.session
                .reject(BusError::InvalidCommand(format!("no digital channel {channel}")));
            return false;
        }
        let command = format!("#1{channel:X}{:02X}", u8::from(on));
        self.session.command_expect(command.as_bytes(), b"").await
    }

    async fn query_echoed(&mut self, command: &[u8]) -> Option<String> {
        let reply = self.session.query(command).await?;
        let echo = crate::protocol::hex_address(self.session.address());
        Some(
            reply
                .strip_prefix(echo.as_str())
                .unwrap_or(&reply)
                .to_string(),
        )
    }
}

/// Split `+07.5000-01.2500` into its signed fields.
fn split_signed_values(text: &str) -> Option<Vec<f64>> {
    let mut values = Vec::new();
    let mut start = 0;
    for (idx, c) in text.char_indices().skip(1) {
        if c == '+' || c == '-' {
            values.push(text[start..idx].parse().ok()?);
            start = idx;
        }
    }
    if start < text.len() {
        values.push(text[start..].parse().ok()?);
    }
    Some(values)
}
