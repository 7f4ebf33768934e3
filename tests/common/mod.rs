//! Emulated GEN multidrop bus shared by the integration tests.

#![allow(dead_code)]

use instrument_bus::protocol::additive_checksum;
use instrument_bus::MockTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One emulated supply on the bus.
#[derive(Clone, Debug)]
pub struct FakeSupply {
    pub identity: String,
    pub voltage: f64,
}

/// Several GEN supplies behind one RS-485 link.
///
/// Tracks which address the link has selected, like real hardware: only the selected
/// supply answers, and only after `ADR n`.
pub fn gen_bus(supplies: &[(u16, &str, f64)], checksum: bool) -> MockTransport {
    let table: HashMap<u16, FakeSupply> = supplies
        .iter()
        .map(|(address, identity, voltage)| {
            (
                *address,
                FakeSupply {
                    identity: identity.to_string(),
                    voltage: *voltage,
                },
            )
        })
        .collect();
    let selected: Arc<Mutex<Option<u16>>> = Arc::new(Mutex::new(None));

    MockTransport::new().with_responder(move |frame| {
        let text = String::from_utf8_lossy(frame);
        let line = text.trim_end_matches('\r');
        let command = if checksum {
            line.rsplit_once('$').map(|(body, _)| body).unwrap_or(line)
        } else {
            line
        };

        if let Some(n) = command.strip_prefix("ADR ") {
            let address: u16 = n.trim().parse().ok()?;
            if !table.contains_key(&address) {
                *selected.lock() = None;
                return None;
            }
            *selected.lock() = Some(address);
            return Some(frame_reply("OK", checksum));
        }

        let address = (*selected.lock())?;
        let supply = table.get(&address)?;
        let reply = match command {
            "IDN?" => supply.identity.clone(),
            "MV?" => format!("{:.3}", supply.voltage),
            _ => "C01".to_string(),
        };
        Some(frame_reply(&reply, checksum))
    })
}

/// Frame a GEN reply, with checksum when requested.
pub fn frame_reply(body: &str, checksum: bool) -> Vec<u8> {
    if checksum {
        format!("{body}${}\r", additive_checksum(body.as_bytes())).into_bytes()
    } else {
        format!("{body}\r").into_bytes()
    }
}
