//! Terminator-only framing for SCPI instruments (ITECH IT6900 and similar).

use super::{check_ascii_command, take_line, Protocol};
use crate::error::{BusError, BusResult};

/// Framing for point-to-point SCPI links.
#[derive(Debug, Clone)]
pub struct ScpiProtocol {
    terminator: Vec<u8>,
}

impl Default for ScpiProtocol {
    fn default() -> Self {
        Self::new(b"\n")
    }
}

impl ScpiProtocol {
    /// Create the policy with a custom line terminator.
    pub fn new(terminator: &[u8]) -> Self {
        Self {
            terminator: terminator.to_vec(),
        }
    }
}

impl Protocol for ScpiProtocol {
    fn name(&self) -> &'static str {
        "scpi"
    }

    fn encode(&self, _address: u16, command: &[u8]) -> BusResult<Vec<u8>> {
        let command = command.trim_ascii();
        check_ascii_command(command, &self.terminator)?;
        let mut frame = command.to_vec();
        frame.extend_from_slice(&self.terminator);
        Ok(frame)
    }

    fn is_complete(&self, buf: &[u8]) -> bool {
        super::find_subslice(buf, &self.terminator).is_some()
    }

    fn decode(&self, _address: u16, frame: &[u8]) -> BusResult<Vec<u8>> {
        let line = take_line(frame, &self.terminator)?;
        // Some firmware sends CR LF even when configured for LF.
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return Err(BusError::MalformedResponse("empty reply".into()));
        }
        Ok(line.to_vec())
    }

    fn identify_command(&self) -> Option<Vec<u8>> {
        Some(b"*IDN?".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_framing() {
        let proto = ScpiProtocol::default();
        assert_eq!(proto.encode(1, b"MEAS:VOLT?").unwrap(), b"MEAS:VOLT?\n");
        assert_eq!(proto.decode(1, b"12.000\r\n").unwrap(), b"12.000");
        assert!(proto.is_complete(b"1\n"));
        assert!(!proto.is_complete(b"1"));
    }

    #[test]
    fn custom_terminator() {
        let proto = ScpiProtocol::new(b"\r\n");
        assert_eq!(proto.encode(1, b"*IDN?").unwrap(), b"*IDN?\r\n");
        assert!(matches!(
            proto.encode(1, b"VOLT 1\nOUTP ON"),
            Err(BusError::InvalidCommand(_))
        ));
    }
}
