//! Several device sessions on one shared transport.
//!
//! Covers exchange serialisation on the link lock and coherence of the link's cached
//! device address across sessions.

mod common;

use instrument_bus::protocol::GenProtocol;
use instrument_bus::transport::MockEvent;
use instrument_bus::{AsyncSession, BusError, Endpoint, Registry, SessionOptions, SessionState};
use tokio::time::Instant;
use std::sync::Arc;

fn endpoint() -> Endpoint {
    "virtual://rs485".parse().unwrap()
}

fn gen_session(registry: &Arc<Registry>, address: u16) -> AsyncSession {
    AsyncSession::new(
        Arc::clone(registry),
        endpoint(),
        address,
        Arc::new(GenProtocol::new(false)),
        SessionOptions::default(),
    )
}

#[tokio::test]
async fn address_select_happens_once_per_switch() {
    let registry = Arc::new(Registry::new());
    let mock = common::gen_bus(&[(1, "LAMBDA GEN10-100", 1.5), (2, "LAMBDA GEN20-50", 2.5)], false);
    registry.attach_transport(endpoint(), mock.clone());

    let mut a = gen_session(&registry, 1);
    let mut b = gen_session(&registry, 2);
    assert!(a.init().await);
    assert!(b.init().await);
    assert_eq!(registry.sessions_on(&endpoint()), 2);

    mock.clear_events();
    assert_eq!(a.query_f64(b"MV?").await, 1.5);
    assert_eq!(a.query_f64(b"MV?").await, 1.5);
    assert_eq!(b.query_f64(b"MV?").await, 2.5);
    assert_eq!(b.query_f64(b"MV?").await, 2.5);
    assert_eq!(a.query_f64(b"MV?").await, 1.5);

    let writes: Vec<String> = mock
        .writes()
        .into_iter()
        .map(|w| String::from_utf8(w).unwrap())
        .collect();
    assert_eq!(
        writes,
        vec![
            "ADR 1\r", "MV?\r", "MV?\r", "ADR 2\r", "MV?\r", "MV?\r", "ADR 1\r", "MV?\r"
        ]
    );
}

#[tokio::test]
async fn reopened_link_forgets_selection() {
    let registry = Arc::new(Registry::new());
    let mock = common::gen_bus(&[(1, "LAMBDA GEN10-100", 1.5), (2, "LAMBDA GEN20-50", 2.5)], false);
    let shared = registry.attach_transport(endpoint(), mock.clone());

    let mut a = gen_session(&registry, 1);
    let mut b = gen_session(&registry, 2);
    assert!(a.init().await);
    assert!(b.init().await);
    assert_eq!(shared.addressed().await, Some(2));

    shared.close().await;
    assert_eq!(shared.addressed().await, None);

    mock.clear_events();
    assert_eq!(b.query_f64(b"MV?").await, 2.5);
    assert_eq!(mock.events()[0], MockEvent::Open);
    assert_eq!(mock.writes()[0], b"ADR 2\r".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_never_interleave() {
    let registry = Arc::new(Registry::new());
    let supplies: Vec<(u16, String, f64)> = (1..=4)
        .map(|a| (a, format!("LAMBDA GEN{a}0-10"), f64::from(a) + 0.25))
        .collect();
    let table: Vec<(u16, &str, f64)> = supplies
        .iter()
        .map(|(a, id, v)| (*a, id.as_str(), *v))
        .collect();
    let mock = common::gen_bus(&table, false);
    registry.attach_transport(endpoint(), mock.clone());

    let mut sessions = Vec::new();
    for address in 1..=4u16 {
        let mut session = gen_session(&registry, address);
        assert!(session.init().await);
        sessions.push(session);
    }

    let mut tasks = Vec::new();
    for mut session in sessions {
        let address = session.address();
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                // A reply for any other supply would mean a foreign exchange slipped in.
                assert_eq!(session.query_f64(b"MV?").await, f64::from(address) + 0.25);
            }
            session.close().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every write is answered before the next write goes out.
    let events = mock.events();
    for (i, event) in events.iter().enumerate() {
        if let MockEvent::Write(_) = event {
            assert!(
                matches!(events.get(i + 1), Some(MockEvent::Read(bytes)) if !bytes.is_empty()),
                "write at {i} not followed by its reply"
            );
        }
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn rejected_select_fails_the_command_and_suspends() {
    let registry = Arc::new(Registry::new());
    let mock = common::gen_bus(&[(1, "LAMBDA GEN10-100", 1.5), (2, "LAMBDA GEN20-50", 2.5)], false);
    let shared = registry.attach_transport(endpoint(), mock.clone());

    let mut a = gen_session(&registry, 1);
    let mut b = gen_session(&registry, 2);
    assert!(a.init().await);
    assert!(b.init().await);
    assert_eq!(a.query_f64(b"MV?").await, 1.5);

    mock.clear_events();
    mock.push_reply(b"C03\r".to_vec());
    assert!(!b.send_command(b"MV?").await);

    assert_eq!(b.state(), SessionState::Suspended);
    assert!(matches!(
        b.last_error(),
        Some(BusError::AddressNotAcknowledged { address: 2, reply }) if reply == "C03"
    ));
    assert_eq!(mock.writes(), vec![b"ADR 2\r".to_vec()]);
    assert_eq!(shared.addressed().await, None);

    // The other device re-selects itself and carries on.
    assert_eq!(a.query_f64(b"MV?").await, 1.5);
}

#[tokio::test(start_paused = true)]
async fn rejected_select_during_init_suspends() {
    let registry = Arc::new(Registry::new());
    let mock = common::gen_bus(&[(1, "LAMBDA GEN10-100", 1.5)], false);
    registry.attach_transport(endpoint(), mock.clone());
    mock.push_reply(b"C03\r".to_vec());

    let options = SessionOptions::default();
    let mut a = gen_session(&registry, 1);
    let before = Instant::now();
    assert!(!a.init().await);

    assert_eq!(a.state(), SessionState::Suspended);
    assert!(matches!(
        a.last_error(),
        Some(BusError::AddressNotAcknowledged { address: 1, .. })
    ));
    assert_eq!(a.suspend_until(), Some(before + options.suspend_delay));
    assert_eq!(mock.writes(), vec![b"ADR 1\r".to_vec()]);
}
