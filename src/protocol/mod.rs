//! Wire framing policies.
//!
//! Every instrument family on the bus speaks a request/response dialect that differs only in
//! how a command is wrapped (address token, checksum, terminator) and how a reply is
//! validated. The session engine is written once against the [`Protocol`] trait; each
//! dialect is a small strategy value injected at construction time.
//!
//! | Family            | Type                | Frame                                              |
//! |-------------------|---------------------|----------------------------------------------------|
//! | TDK-Lambda GEN    | [`GenProtocol`]     | `CMD[$CS]\r`, multidrop via `ADR n`                |
//! | Adam-4000         | [`AdamProtocol`]    | `$AACMD[CS]\r`, replies `!AA…` / `>…` / `?AA`      |
//! | Modbus-RTU        | [`ModbusRtu`]       | `addr fn data crc_lo crc_hi`                       |
//! | Lauda thermostats | [`LaudaProtocol`]   | `STX AA payload ETX BCC`, `ACK` / `NAK` replies    |
//! | SCPI (IT6900)     | [`ScpiProtocol`]    | `CMD\n`                                            |

mod adam;
mod gen;
mod lauda;
mod modbus;
mod scpi;

pub use adam::AdamProtocol;
pub(crate) use adam::hex_address;
pub use gen::GenProtocol;
pub use lauda::LaudaProtocol;
pub use modbus::{crc16, ModbusRtu};
pub use scpi::ScpiProtocol;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{BusError, BusResult};

/// Upper bound on a single response frame.
pub const MAX_RESPONSE_LEN: usize = 512;

/// Numeric limits learned from a device's identity string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Maximum programmable voltage.
    pub max_voltage: f64,
    /// Maximum programmable current.
    pub max_current: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_voltage: f64::INFINITY,
            max_current: f64::INFINITY,
        }
    }
}

/// Address-select request for multidrop links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSelect {
    /// Command payload, framed like any other command.
    pub request: Vec<u8>,
    /// Decoded payload the device answers with on success.
    pub ack: Vec<u8>,
}

/// Framing strategy for one instrument dialect.
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Highest address the dialect can express.
    fn max_address(&self) -> u16 {
        u16::MAX
    }

    /// Frame a command payload for the given device address.
    ///
    /// Fails with [`BusError::InvalidCommand`] for payloads the framing cannot carry
    /// (empty, or containing the terminator).
    fn encode(&self, address: u16, command: &[u8]) -> BusResult<Vec<u8>>;

    /// Whether `buf` holds a complete response frame.
    fn is_complete(&self, buf: &[u8]) -> bool;

    /// Validate a complete frame and return its payload.
    fn decode(&self, address: u16, frame: &[u8]) -> BusResult<Vec<u8>>;

    /// Address-select exchange for links where the device must be selected first.
    ///
    /// `None` means every frame already carries the address.
    fn select_address(&self, _address: u16) -> Option<AddressSelect> {
        None
    }

    /// Identity query sent during initialisation.
    fn identify_command(&self) -> Option<Vec<u8>> {
        None
    }

    /// Parse numeric limits out of an identity reply.
    ///
    /// [`BusError::UnrecognizedIdentity`] rejects the device; any other error leaves the
    /// session without limits.
    fn parse_limits(&self, _identity: &str) -> BusResult<Limits> {
        Ok(Limits::default())
    }
}

/// Protocol tag used in configuration and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// TDK-Lambda GEN power supplies.
    Gen,
    /// Adam-4000 I/O modules.
    Adam,
    /// Modbus-RTU devices.
    ModbusRtu,
    /// Lauda thermostats.
    Lauda,
    /// Terminator-only SCPI devices such as the IT6900 series.
    Scpi,
}

impl ProtocolKind {
    /// Build the framing policy for this tag.
    pub fn build(self, checksum: bool) -> Arc<dyn Protocol> {
        match self {
            ProtocolKind::Gen => Arc::new(GenProtocol::new(checksum)),
            ProtocolKind::Adam => Arc::new(AdamProtocol::new(checksum)),
            ProtocolKind::ModbusRtu => Arc::new(ModbusRtu),
            ProtocolKind::Lauda => Arc::new(LaudaProtocol),
            ProtocolKind::Scpi => Arc::new(ScpiProtocol::default()),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Gen => "gen",
            ProtocolKind::Adam => "adam",
            ProtocolKind::ModbusRtu => "modbus_rtu",
            ProtocolKind::Lauda => "lauda",
            ProtocolKind::Scpi => "scpi",
        };
        f.write_str(name)
    }
}

/// 8-bit additive checksum as two uppercase hex digits.
pub fn additive_checksum(bytes: &[u8]) -> String {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    format!("{sum:02X}")
}

/// Reject payloads an ASCII framing cannot carry.
pub(crate) fn check_ascii_command(command: &[u8], terminator: &[u8]) -> BusResult<()> {
    if command.is_empty() {
        return Err(BusError::InvalidCommand("empty command".into()));
    }
    if terminator
        .iter()
        .any(|t| command.contains(t))
    {
        return Err(BusError::InvalidCommand(format!(
            "command {:?} contains the frame terminator",
            String::from_utf8_lossy(command)
        )));
    }
    Ok(())
}

/// Return the bytes before the first `terminator` in `frame`.
///
/// Anything after the terminator is ignored.
pub(crate) fn take_line<'a>(frame: &'a [u8], terminator: &[u8]) -> BusResult<&'a [u8]> {
    find_subslice(frame, terminator)
        .map(|end| &frame[..end])
        .ok_or_else(|| BusError::MissingTerminator(String::from_utf8_lossy(frame).into_owned()))
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
