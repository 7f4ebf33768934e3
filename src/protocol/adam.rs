//! Adam-4000 module framing.
//!
//! A command starts with one of the lead characters `$ # % @ ~`, followed by the module
//! address as two hex digits and the command body: `$01M\r`. Replies start with `!`
//! (acknowledge), `>` (data) or `?` (rejected). With checksum mode enabled the two hex digits
//! of the additive checksum follow the body directly, without a delimiter.
//!
//! The decoded payload is the reply with its lead character removed. Most acknowledgements
//! echo the address (`!01…`); accessors strip it where the command defines it.

use super::{additive_checksum, check_ascii_command, take_line, Protocol};
use crate::error::{BusError, BusResult};

const TERMINATOR: &[u8] = b"\r";
const LEAD_CHARS: &[u8] = b"$#%@~";

/// Framing for Adam-4000 series I/O modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdamProtocol {
    checksum: bool,
}

impl AdamProtocol {
    /// Create the policy, optionally with trailing checksums.
    pub fn new(checksum: bool) -> Self {
        Self { checksum }
    }
}

/// Two-digit hex form of a module address.
pub(crate) fn hex_address(address: u16) -> String {
    format!("{address:02X}")
}

impl Protocol for AdamProtocol {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn max_address(&self) -> u16 {
        0xFF
    }

    fn encode(&self, address: u16, command: &[u8]) -> BusResult<Vec<u8>> {
        check_ascii_command(command, TERMINATOR)?;

        let (lead, body) = match command.split_first() {
            Some((first, rest)) if LEAD_CHARS.contains(first) => (*first, rest),
            _ => (b'$', command),
        };

        let mut frame = Vec::with_capacity(body.len() + 6);
        frame.push(lead);
        frame.extend_from_slice(hex_address(address).as_bytes());
        frame.extend_from_slice(body);
        if self.checksum {
            let cs = additive_checksum(&frame);
            frame.extend_from_slice(cs.as_bytes());
        }
        frame.extend_from_slice(TERMINATOR);
        Ok(frame)
    }

    fn is_complete(&self, buf: &[u8]) -> bool {
        buf.contains(&b'\r')
    }

    fn decode(&self, address: u16, frame: &[u8]) -> BusResult<Vec<u8>> {
        let mut line = take_line(frame, TERMINATOR)?;

        if self.checksum {
            let split = line.len().checked_sub(2).filter(|&at| at > 0).ok_or_else(|| {
                BusError::MalformedResponse(format!(
                    "reply {:?} too short for a checksum",
                    String::from_utf8_lossy(line)
                ))
            })?;
            let (body, tail) = line.split_at(split);
            let expected = additive_checksum(body);
            let found = String::from_utf8_lossy(tail).into_owned();
            if !expected.eq_ignore_ascii_case(&found) {
                return Err(BusError::ChecksumMismatch { expected, found });
            }
            line = body;
        }

        match line.split_first() {
            Some((b'!' | b'>', rest)) => Ok(rest.to_vec()),
            Some((b'?', rest)) => Err(BusError::DeviceError(format!(
                "module {} rejected the command (reply ?{})",
                hex_address(address),
                String::from_utf8_lossy(rest)
            ))),
            _ => Err(BusError::MalformedResponse(format!(
                "unexpected Adam reply {:?}",
                String::from_utf8_lossy(line)
            ))),
        }
    }

    fn identify_command(&self) -> Option<Vec<u8>> {
        Some(b"$M".to_vec())
    }
}
