//! Lauda thermostat framing (RS-485 block protocol).
//!
//! Request and data reply: `STX | AA | payload | ETX | BCC` where `AA` is the two-digit decimal
//! address and `BCC` is the XOR of every byte from the address up to and including `ETX`.
//! Write commands are acknowledged by a lone `ACK`; a lone `NAK` means the thermostat
//! rejected the frame.

use super::Protocol;
use crate::error::{BusError, BusResult};

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

/// XOR block check over `bytes`.
fn block_check(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Framing for Lauda thermostats.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaudaProtocol;

impl Protocol for LaudaProtocol {
    fn name(&self) -> &'static str {
        "lauda"
    }

    fn max_address(&self) -> u16 {
        99
    }

    fn encode(&self, address: u16, command: &[u8]) -> BusResult<Vec<u8>> {
        if command.is_empty() {
            return Err(BusError::InvalidCommand("empty command".into()));
        }
        if command.iter().any(|b| matches!(*b, STX | ETX | ACK | NAK)) {
            return Err(BusError::InvalidCommand(format!(
                "command {:?} contains a control byte",
                String::from_utf8_lossy(command)
            )));
        }

        let mut frame = Vec::with_capacity(command.len() + 5);
        frame.push(STX);
        frame.extend_from_slice(format!("{address:02}").as_bytes());
        frame.extend_from_slice(command);
        frame.push(ETX);
        frame.push(block_check(&frame[1..]));
        Ok(frame)
    }

    fn is_complete(&self, buf: &[u8]) -> bool {
        match buf.first() {
            Some(&ACK | &NAK) => true,
            Some(_) => buf
                .iter()
                .position(|b| *b == ETX)
                .is_some_and(|etx| buf.len() > etx + 1),
            None => false,
        }
    }

    fn decode(&self, address: u16, frame: &[u8]) -> BusResult<Vec<u8>> {
        match frame.first() {
            Some(&ACK) => return Ok(Vec::new()),
            Some(&NAK) => return Err(BusError::DeviceError("thermostat answered NAK".into())),
            Some(&STX) => {}
            _ => {
                return Err(BusError::MalformedResponse(format!(
                    "reply does not start with STX: {frame:02X?}"
                )))
            }
        }

        let etx = frame
            .iter()
            .position(|b| *b == ETX)
            .ok_or_else(|| BusError::MissingTerminator(format!("{frame:02X?}")))?;
        let received = *frame
            .get(etx + 1)
            .ok_or_else(|| BusError::MissingTerminator(format!("{frame:02X?} lacks BCC")))?;

        let computed = block_check(&frame[1..=etx]);
        if computed != received {
            return Err(BusError::ChecksumMismatch {
                expected: format!("{computed:02X}"),
                found: format!("{received:02X}"),
            });
        }

        let body = &frame[1..etx];
        if body.len() < 2 {
            return Err(BusError::MalformedResponse("reply lacks address".into()));
        }
        let (echoed, payload) = body.split_at(2);
        if echoed != format!("{address:02}").as_bytes() {
            return Err(BusError::MalformedResponse(format!(
                "reply addressed to {} while talking to {address:02}",
                String::from_utf8_lossy(echoed)
            )));
        }

        Ok(payload.to_vec())
    }

    fn identify_command(&self) -> Option<Vec<u8>> {
        Some(b"TYPE".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_reply(address: &str, payload: &str) -> Vec<u8> {
        let mut frame = vec![STX];
        frame.extend_from_slice(address.as_bytes());
        frame.extend_from_slice(payload.as_bytes());
        frame.push(ETX);
        frame.push(block_check(&frame[1..]));
        frame
    }

    #[test]
    fn frames_request() {
        let frame = LaudaProtocol.encode(5, b"IN_PV_00").unwrap();
        assert_eq!(frame[0], STX);
        assert_eq!(&frame[1..3], b"05");
        assert_eq!(&frame[3..11], b"IN_PV_00");
        assert_eq!(frame[11], ETX);
        assert_eq!(frame[12], block_check(&frame[1..12]));
    }

    #[test]
    fn ack_and_nak() {
        assert!(LaudaProtocol.is_complete(&[ACK]));
        assert_eq!(LaudaProtocol.decode(5, &[ACK]).unwrap(), Vec::<u8>::new());
        assert!(matches!(
            LaudaProtocol.decode(5, &[NAK]),
            Err(BusError::DeviceError(_))
        ));
    }

    #[test]
    fn data_reply_round() {
        let frame = data_reply("05", "  21.43");
        assert!(!LaudaProtocol.is_complete(&frame[..frame.len() - 1]));
        assert!(LaudaProtocol.is_complete(&frame));
        assert_eq!(LaudaProtocol.decode(5, &frame).unwrap(), b"  21.43");
    }

    #[test]
    fn corrupted_block_check() {
        let mut frame = data_reply("05", "21.43");
        frame[4] ^= 0x02;
        assert!(matches!(
            LaudaProtocol.decode(5, &frame),
            Err(BusError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn control_bytes_rejected() {
        assert!(matches!(
            LaudaProtocol.encode(5, &[b'A', ETX]),
            Err(BusError::InvalidCommand(_))
        ));
    }
}
