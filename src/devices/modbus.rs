//! Generic Modbus-RTU slaves.
//!
//! Register accessors build the PDU (function code + data) and let the framing add the unit
//! id and CRC. Replies come back as the PDU with the function code first.

use super::impl_device;
use crate::error::BusError;
use crate::protocol::ModbusRtu;
use crate::session::AsyncSession;

const READ_HOLDING_REGISTERS: u8 = 0x03;
const READ_INPUT_REGISTERS: u8 = 0x04;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Most registers one read may request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Most registers one write may carry.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// A Modbus-RTU slave.
#[derive(Debug)]
pub struct ModbusDevice {
    session: AsyncSession,
}

impl_device!(ModbusDevice, |_options| ModbusRtu);

impl ModbusDevice {
    /// Read `count` holding registers from `start` (function 3).
    pub async fn read_holding_registers(&mut self, start: u16, count: u16) -> Option<Vec<u16>> {
        self.read_registers(READ_HOLDING_REGISTERS, start, count)
            .await
    }

    /// Read `count` input registers from `start` (function 4).
    pub async fn read_input_registers(&mut self, start: u16, count: u16) -> Option<Vec<u16>> {
        self.read_registers(READ_INPUT_REGISTERS, start, count).await
    }

    /// Read one holding register.
    pub async fn read_register(&mut self, register: u16) -> Option<u16> {
        self.read_holding_registers(register, 1)
            .await
            .and_then(|values| values.first().copied())
    }

    /// Write one holding register (function 6). The slave echoes the request.
    pub async fn write_register(&mut self, register: u16, value: u16) -> bool {
        let mut pdu = vec![WRITE_SINGLE_REGISTER];
        pdu.extend_from_slice(&register.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        self.exchange_expect(&pdu, &pdu).await
    }

    /// Write consecutive holding registers (function 16).
    pub async fn write_registers(&mut self, start: u16, values: &[u16]) -> bool {
        let count = match u16::try_from(values.len()) {
            Ok(n) if (1..=MAX_WRITE_REGISTERS).contains(&n) => n,
            _ => {
                self.session.reject(BusError::InvalidCommand(format!(
                    "cannot write {} registers",
                    values.len()
                )));
                return false;
            }
        };

        let mut pdu = vec![WRITE_MULTIPLE_REGISTERS];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        // count <= 123, so the byte count fits
        pdu.push((count * 2) as u8);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }

        let mut expected = vec![WRITE_MULTIPLE_REGISTERS];
        expected.extend_from_slice(&start.to_be_bytes());
        expected.extend_from_slice(&count.to_be_bytes());
        self.exchange_expect(&pdu, &expected).await
    }

    async fn read_registers(&mut self, function: u8, start: u16, count: u16) -> Option<Vec<u16>> {
        if !(1..=MAX_READ_REGISTERS).contains(&count) {
            self.session.reject(BusError::InvalidCommand(format!(
                "cannot read {count} registers"
            )));
            return None;
        }

        let mut pdu = vec![function];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        if !self.session.send_command(&pdu).await {
            return None;
        }

        let parsed = match self.session.response() {
            [fc, byte_count, data @ ..]
                if *fc == function
                    && usize::from(*byte_count) == data.len()
                    && data.len() == usize::from(count) * 2 =>
            {
                Some(
                    data.chunks_exact(2)
                        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                        .collect(),
                )
            }
            _ => None,
        };
        if parsed.is_none() {
            let err = BusError::MalformedResponse(format!(
                "unexpected register reply {:02X?}",
                self.session.response()
            ));
            self.session.reject(err);
        }
        parsed
    }

    async fn exchange_expect(&mut self, pdu: &[u8], expected: &[u8]) -> bool {
        if !self.session.send_command(pdu).await {
            return false;
        }
        if self.session.response() == expected {
            return true;
        }
        let err = BusError::MalformedResponse(format!(
            "unexpected write reply {:02X?}",
            self.session.response()
        ));
        self.session.reject(err);
        false
    }
}
