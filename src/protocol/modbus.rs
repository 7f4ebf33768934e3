//! Modbus-RTU framing.
//!
//! Frame: `addr | function | data… | crc_lo crc_hi`, CRC-16/MODBUS (reflected polynomial
//! 0xA001, initial value 0xFFFF). Commands and decoded payloads are the PDU: function code
//! plus data. RTU has no terminator, so completeness is judged from the function code.

use crc::{Crc, CRC_16_MODBUS};

use super::Protocol;
use crate::error::{BusError, BusResult};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS of `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    MODBUS_CRC.checksum(bytes)
}

/// Framing for Modbus-RTU slaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusRtu;

impl ModbusRtu {
    /// Length of the frame `buf` starts with, once the header is in.
    fn expected_len(buf: &[u8]) -> Option<usize> {
        let function = *buf.get(1)?;
        if function & 0x80 != 0 {
            return Some(5);
        }
        match function {
            0x01..=0x04 => buf.get(2).map(|count| 5 + usize::from(*count)),
            0x05 | 0x06 | 0x0F | 0x10 => Some(8),
            _ => None,
        }
    }
}

impl Protocol for ModbusRtu {
    fn name(&self) -> &'static str {
        "modbus_rtu"
    }

    fn max_address(&self) -> u16 {
        247
    }

    fn encode(&self, address: u16, command: &[u8]) -> BusResult<Vec<u8>> {
        if command.is_empty() {
            return Err(BusError::InvalidCommand("empty PDU".into()));
        }
        let unit = u8::try_from(address).map_err(|_| BusError::InvalidAddress {
            address,
            reason: "Modbus unit ids are a single byte".into(),
        })?;

        let mut frame = Vec::with_capacity(command.len() + 3);
        frame.push(unit);
        frame.extend_from_slice(command);
        frame.extend_from_slice(&crc16(&frame).to_le_bytes());
        Ok(frame)
    }

    fn is_complete(&self, buf: &[u8]) -> bool {
        match Self::expected_len(buf) {
            Some(len) => buf.len() >= len,
            // Unknown function: accept once a CRC-valid frame has arrived.
            None => buf.len() >= 4 && {
                let (body, tail) = buf.split_at(buf.len() - 2);
                crc16(body).to_le_bytes() == tail
            },
        }
    }

    fn decode(&self, address: u16, frame: &[u8]) -> BusResult<Vec<u8>> {
        let len = Self::expected_len(frame).unwrap_or(frame.len());
        if len < 4 || frame.len() < len {
            return Err(BusError::MalformedResponse(format!(
                "RTU frame too short ({} bytes)",
                frame.len()
            )));
        }
        let (body, tail) = frame[..len].split_at(len - 2);

        let computed = crc16(body);
        let received = u16::from_le_bytes([tail[0], tail[1]]);
        if computed != received {
            return Err(BusError::ChecksumMismatch {
                expected: format!("{computed:04X}"),
                found: format!("{received:04X}"),
            });
        }

        if u16::from(body[0]) != address {
            return Err(BusError::MalformedResponse(format!(
                "reply from unit {} while talking to {address}",
                body[0]
            )));
        }

        let function = body[1];
        if function & 0x80 != 0 {
            return Err(BusError::DeviceError(format!(
                "exception 0x{:02X} for function 0x{:02X}",
                body[2],
                function & 0x7F
            )));
        }

        Ok(body[1..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_crc_vector() {
        let pdu = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert_eq!(crc16(&pdu), 0x8776);

        let frame = ModbusRtu.encode(0x11, &pdu[1..]).unwrap();
        assert_eq!(frame, [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]);
    }

    fn reply(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        frame.extend_from_slice(&crc16(bytes).to_le_bytes());
        frame
    }

    #[test]
    fn completeness_follows_function_code() {
        let full = reply(&[0x11, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        assert!(!ModbusRtu.is_complete(&full[..3]));
        assert!(!ModbusRtu.is_complete(&full[..full.len() - 1]));
        assert!(ModbusRtu.is_complete(&full));

        let echo = reply(&[0x11, 0x06, 0x00, 0x01, 0x00, 0x03]);
        assert!(!ModbusRtu.is_complete(&echo[..7]));
        assert!(ModbusRtu.is_complete(&echo));

        let exception = reply(&[0x11, 0x83, 0x02]);
        assert!(ModbusRtu.is_complete(&exception));
    }

    #[test]
    fn decodes_pdu() {
        let full = reply(&[0x11, 0x03, 0x02, 0x12, 0x34]);
        assert_eq!(
            ModbusRtu.decode(0x11, &full).unwrap(),
            vec![0x03, 0x02, 0x12, 0x34]
        );
    }

    #[test]
    fn exception_reply_is_device_error() {
        let exception = reply(&[0x11, 0x83, 0x02]);
        assert!(matches!(
            ModbusRtu.decode(0x11, &exception),
            Err(BusError::DeviceError(msg)) if msg.contains("0x02")
        ));
    }

    #[test]
    fn corrupted_frame_fails_crc() {
        let mut full = reply(&[0x11, 0x03, 0x02, 0x12, 0x34]);
        full[3] ^= 0x40;
        assert!(matches!(
            ModbusRtu.decode(0x11, &full),
            Err(BusError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_unit_is_rejected() {
        let full = reply(&[0x12, 0x03, 0x02, 0x12, 0x34]);
        assert!(matches!(
            ModbusRtu.decode(0x11, &full),
            Err(BusError::MalformedResponse(_))
        ));
    }
}
