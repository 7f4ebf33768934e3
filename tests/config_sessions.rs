//! Building sessions from a configuration file.

mod common;

use instrument_bus::{AsyncSession, BusConfig, Registry};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
[logging]
level = "debug"

[defaults]
read_timeout = "300ms"
read_retries = 1
suspend_delay = "2s"

[[devices]]
id = "psu_a"
protocol = "gen"
endpoint = "virtual://bench"
address = 1
poll_command = "MV?"

[[devices]]
id = "psu_b"
protocol = "gen"
endpoint = "virtual://bench"
address = 2
poll_command = "MV?"

[devices.options]
read_retries = 4

[[devices]]
id = "spare"
protocol = "gen"
endpoint = "virtual://bench"
address = 3
enabled = false
"#;

#[tokio::test]
async fn configured_devices_share_the_bench_line() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = BusConfig::load_from(file.path()).unwrap();

    let registry = Arc::new(Registry::new());
    let mock = common::gen_bus(&[(1, "LAMBDA GEN10-100", 1.25), (2, "LAMBDA GEN20-50", 2.5)], false);
    registry.attach_transport("virtual://bench".parse().unwrap(), mock.clone());

    let mut sessions = Vec::new();
    for device in config.enabled_devices() {
        let options = device.session_options(&config.defaults);
        let protocol = device.protocol.build(options.checksum);
        let session = AsyncSession::connect(
            Arc::clone(&registry),
            device.endpoint.clone(),
            device.address,
            protocol,
            options,
        )
        .await;
        sessions.push((device.clone(), session));
    }

    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].1.options().read_retries, 1);
    assert_eq!(sessions[1].1.options().read_retries, 4);
    assert_eq!(sessions[1].1.options().read_timeout, Duration::from_millis(300));

    let mut readings = Vec::new();
    for (device, session) in &mut sessions {
        assert!(session.poll().await);
        let command = device.poll_command.as_deref().unwrap();
        readings.push(session.query_f64(command.as_bytes()).await);
    }
    assert_eq!(readings, vec![1.25, 2.5]);
    assert_eq!(registry.sessions_on(&"virtual://bench".parse().unwrap()), 2);
}

#[test]
fn shipped_sample_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/instrument_bus.toml");
    let config = BusConfig::load_from(path).unwrap();

    assert_eq!(config.devices.len(), 5);
    assert_eq!(config.enabled_devices().count(), 4);
    let heater = config.devices.iter().find(|d| d.id == "heater_psu").unwrap();
    assert!(heater.session_options(&config.defaults).checksum);
    let flow = config.devices.iter().find(|d| d.id == "flow_meter").unwrap();
    assert_eq!(
        flow.session_options(&config.defaults).read_timeout,
        Duration::from_millis(200)
    );
}
