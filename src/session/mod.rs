//! Device session state machine.
//!
//! An [`AsyncSession`] is one device at one address on a shared transport. It owns the
//! lifecycle (claim the address, open the link, select the device, identify it), runs
//! command exchanges with retries and an adaptive read timeout, and suspends itself after
//! failures so a dead device does not stall the bus.
//!
//! ```text
//! PreInit ──init ok──▶ Initialized ──retries exhausted──▶ Suspended
//!    │                      ▲                               │
//!    └──init failed──▶ Suspended ◀──── re-init failed ──────┘
//!                           └──── poll() after deadline, re-init ok
//! ```
//!
//! Command methods never return errors. They report success as a flag (or a sentinel value
//! for typed reads) and keep the cause in [`AsyncSession::last_error`].
//!
//! Blocking callers use [`blocking::BlockingBus`], which drives the same state machine on an
//! owned runtime.

pub mod blocking;
mod options;

pub use options::SessionOptions;

use bytes::BytesMut;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{BusError, BusResult};
use crate::protocol::{Limits, Protocol, MAX_RESPONSE_LEN};
use crate::registry::{Registry, SessionId};
use crate::transport::{Endpoint, Link, SharedTransport};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never initialised.
    PreInit,
    /// Ready for commands.
    Initialized,
    /// Cooling down until the suspend deadline passes.
    Suspended,
    /// Closed for good.
    Closed,
}

/// One device on a shared transport.
pub struct AsyncSession {
    id: SessionId,
    endpoint: Endpoint,
    address: u16,
    protocol: Arc<dyn Protocol>,
    options: SessionOptions,
    registry: Arc<Registry>,
    transport: Option<Arc<SharedTransport>>,
    claimed: bool,
    state: SessionState,
    suspend_until: Option<Instant>,
    read_timeout: Duration,
    command: Vec<u8>,
    raw_response: Vec<u8>,
    response: Vec<u8>,
    identity: Option<String>,
    limits: Limits,
    last_error: Option<BusError>,
}

impl std::fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("address", &self.address)
            .field("protocol", &self.protocol.name())
            .field("state", &self.state)
            .finish()
    }
}

impl AsyncSession {
    /// Create a session without touching the bus. Call [`init`](Self::init) or
    /// [`poll`](Self::poll) to bring it up.
    pub fn new(
        registry: Arc<Registry>,
        endpoint: Endpoint,
        address: u16,
        protocol: Arc<dyn Protocol>,
        options: SessionOptions,
    ) -> Self {
        Self {
            id: registry.next_session_id(),
            endpoint,
            address,
            protocol,
            read_timeout: options.read_timeout,
            options,
            registry,
            transport: None,
            claimed: false,
            state: SessionState::PreInit,
            suspend_until: None,
            command: Vec::new(),
            raw_response: Vec::new(),
            response: Vec::new(),
            identity: None,
            limits: Limits::default(),
            last_error: None,
        }
    }

    /// Create and initialise in one step. Check [`is_ready`](Self::is_ready) afterwards.
    pub async fn connect(
        registry: Arc<Registry>,
        endpoint: Endpoint,
        address: u16,
        protocol: Arc<dyn Protocol>,
        options: SessionOptions,
    ) -> Self {
        let mut session = Self::new(registry, endpoint, address, protocol, options);
        session.init().await;
        session
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Registry-assigned id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Endpoint of the shared transport.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Device address on the link.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Framing policy name.
    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    /// Options the session was built with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether commands will be attempted. Pure query; see [`poll`](Self::poll) for retrying.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Initialized
    }

    /// End of the current suspend window.
    pub fn suspend_until(&self) -> Option<Instant> {
        self.suspend_until
    }

    /// Cause of the most recent failure, cleared by the next success.
    pub fn last_error(&self) -> Option<&BusError> {
        self.last_error.as_ref()
    }

    /// Current adaptive read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Identity reported during initialisation.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Limits parsed from the identity; unbounded when unknown.
    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Framed bytes of the last command sent.
    pub fn command(&self) -> &[u8] {
        &self.command
    }

    /// Decoded payload of the last successful command.
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Last response as trimmed text.
    pub fn response_text(&self) -> String {
        String::from_utf8_lossy(&self.response).trim().to_string()
    }

    /// Raw bytes of the last frame received, framing included.
    pub fn raw_response(&self) -> &[u8] {
        &self.raw_response
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Run the initialisation sequence.
    ///
    /// Does nothing while a suspend window is still open or after close. On failure the
    /// session is suspended (long delay for bad or duplicate addresses) and `false` is
    /// returned.
    pub async fn init(&mut self) -> bool {
        match self.state {
            SessionState::Closed => return false,
            SessionState::Suspended if self.suspend_pending() => return false,
            _ => {}
        }

        let outcome = AssertUnwindSafe(self.try_init()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                self.state = SessionState::Initialized;
                self.suspend_until = None;
                self.last_error = None;
                info!(
                    endpoint = %self.endpoint,
                    address = self.address,
                    session = self.id,
                    identity = self.identity.as_deref().unwrap_or(""),
                    "Device initialised"
                );
                true
            }
            Ok(Err(err)) => {
                let delay = if err.is_permanent() {
                    self.options.long_suspend_delay
                } else {
                    self.options.suspend_delay
                };
                warn!(
                    endpoint = %self.endpoint,
                    address = self.address,
                    session = self.id,
                    error = %err,
                    "Initialisation failed"
                );
                self.suspend(Some(delay));
                self.last_error = Some(err);
                false
            }
            Err(panic) => {
                self.record_panic(panic);
                false
            }
        }
    }

    /// Bring the session up if it is due: re-runs [`init`](Self::init) when never
    /// initialised or when the suspend window has expired. Returns readiness.
    pub async fn poll(&mut self) -> bool {
        match self.state {
            SessionState::Initialized => true,
            SessionState::Closed => false,
            SessionState::Suspended if self.suspend_pending() => false,
            SessionState::PreInit | SessionState::Suspended => self.init().await,
        }
    }

    /// Alias of [`poll`](Self::poll).
    pub async fn ensure_ready(&mut self) -> bool {
        self.poll().await
    }

    /// Suspend for `delay` (default: the configured suspend delay).
    ///
    /// The deadline only ever moves later; a shorter request leaves it unchanged.
    pub fn suspend(&mut self, delay: Option<Duration>) {
        if self.state == SessionState::Closed {
            return;
        }
        let delay = delay.unwrap_or(self.options.suspend_delay);
        let candidate = Instant::now() + delay;
        let deadline = match self.suspend_until {
            Some(current) if current >= candidate => current,
            _ => candidate,
        };
        self.suspend_until = Some(deadline);
        self.state = SessionState::Suspended;
        debug!(
            endpoint = %self.endpoint,
            address = self.address,
            session = self.id,
            delay = ?delay,
            "Session suspended"
        );
    }

    /// Release the address claim and, if this was the last session on the endpoint, close
    /// the transport.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(shared) = self.release() {
            shared.close().await;
        }
        self.state = SessionState::Closed;
        self.suspend_until = None;
        info!(
            endpoint = %self.endpoint,
            address = self.address,
            session = self.id,
            "Session closed"
        );
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Send one command and wait for its response.
    ///
    /// Returns `false` without touching the transport when the session is not ready or the
    /// command cannot be framed. Link failures are retried; once retries are exhausted the
    /// session suspends. The decoded reply is available from [`response`](Self::response).
    pub async fn send_command(&mut self, command: &[u8]) -> bool {
        if !self.is_ready() {
            debug!(
                endpoint = %self.endpoint,
                address = self.address,
                "Command skipped: session not ready"
            );
            return false;
        }

        let outcome = AssertUnwindSafe(self.try_send(command)).catch_unwind().await;
        match outcome {
            Ok(Ok(payload)) => {
                self.response = payload;
                self.last_error = None;
                true
            }
            Ok(Err(err)) => {
                self.response.clear();
                if err.is_local() || matches!(err, BusError::DeviceError(_)) {
                    debug!(
                        endpoint = %self.endpoint,
                        address = self.address,
                        error = %err,
                        "Command rejected"
                    );
                } else {
                    warn!(
                        endpoint = %self.endpoint,
                        address = self.address,
                        session = self.id,
                        error = %err,
                        "Command failed, suspending"
                    );
                    self.suspend(None);
                }
                self.last_error = Some(err);
                false
            }
            Err(panic) => {
                self.response.clear();
                self.record_panic(panic);
                false
            }
        }
    }

    /// Send a command and return the reply as trimmed text.
    pub async fn query(&mut self, command: &[u8]) -> Option<String> {
        self.send_command(command)
            .await
            .then(|| self.response_text())
    }

    /// Send a command and parse the reply as a number; `NaN` on any failure.
    pub async fn query_f64(&mut self, command: &[u8]) -> f64 {
        match self.query(command).await {
            Some(text) => self.parse_or_nan(&text),
            None => f64::NAN,
        }
    }

    /// Send a command and require an exact reply, e.g. `OK`.
    pub async fn command_expect(&mut self, command: &[u8], expected: &[u8]) -> bool {
        if !self.send_command(command).await {
            return false;
        }
        if self.response.trim_ascii() == expected {
            true
        } else {
            self.last_error = Some(BusError::MalformedResponse(format!(
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&self.response)
            )));
            false
        }
    }

    /// Record a local failure without suspending.
    pub fn reject(&mut self, err: BusError) {
        debug!(endpoint = %self.endpoint, address = self.address, error = %err, "Rejected");
        self.last_error = Some(err);
    }

    /// Parse `text` as `f64`, recording a conversion failure as `NaN`.
    pub fn parse_or_nan(&mut self, text: &str) -> f64 {
        match text.trim().parse::<f64>() {
            Ok(value) => value,
            Err(err) => {
                self.reject(BusError::Conversion(format!("{text:?}: {err}")));
                f64::NAN
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn suspend_pending(&self) -> bool {
        self.suspend_until
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    fn record_panic(&mut self, panic: Box<dyn Any + Send>) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(
            endpoint = %self.endpoint,
            address = self.address,
            session = self.id,
            panic = %message,
            "Exchange panicked, suspending"
        );
        self.suspend(None);
        self.last_error = Some(BusError::Panicked(message));
    }

    fn release(&mut self) -> Option<Arc<SharedTransport>> {
        if self.claimed {
            self.registry
                .unregister(&self.endpoint, self.address, self.id);
            self.claimed = false;
        }
        self.transport
            .take()
            .and_then(|_| self.registry.release_transport(&self.endpoint))
    }

    fn shared_transport(&mut self) -> BusResult<Arc<SharedTransport>> {
        if let Some(existing) = &self.transport {
            return Ok(Arc::clone(existing));
        }
        let shared = self
            .registry
            .transport(&self.endpoint, &self.options.transport_settings())?;
        self.transport = Some(Arc::clone(&shared));
        Ok(shared)
    }

    async fn try_init(&mut self) -> BusResult<()> {
        if self.address == 0 {
            return Err(BusError::InvalidAddress {
                address: self.address,
                reason: "addresses start at 1".into(),
            });
        }
        if self.address > self.protocol.max_address() {
            return Err(BusError::InvalidAddress {
                address: self.address,
                reason: format!(
                    "{} addresses end at {}",
                    self.protocol.name(),
                    self.protocol.max_address()
                ),
            });
        }

        if !self.claimed {
            self.registry
                .register(&self.endpoint, self.address, self.id)?;
            self.claimed = true;
        }

        let transport = self.shared_transport()?;
        let mut link = transport.lock().await;
        link.ensure_open()
            .await
            .map_err(|err| BusError::TransportNotReady(format!("{}: {err}", self.endpoint)))?;

        self.select_address(&mut link).await?;

        if let Some(query) = self.protocol.identify_command() {
            let frame = self.protocol.encode(self.address, &query)?;
            let payload = self.exchange(&mut link, &frame).await?;
            let identity = String::from_utf8_lossy(&payload).trim().to_string();
            self.limits = match self.protocol.parse_limits(&identity) {
                Ok(limits) => limits,
                Err(err @ BusError::UnrecognizedIdentity(_)) => return Err(err),
                Err(err) => {
                    warn!(identity = %identity, error = %err, "No limits in identity");
                    Limits::default()
                }
            };
            self.identity = Some(identity);
        }
        Ok(())
    }

    async fn try_send(&mut self, command: &[u8]) -> BusResult<Vec<u8>> {
        let frame = self.protocol.encode(self.address, command)?;
        let transport = self.shared_transport()?;

        let mut link = transport.lock().await;
        link.ensure_open()
            .await
            .map_err(|err| BusError::TransportNotReady(format!("{}: {err}", self.endpoint)))?;

        if link.addressed() != Some(self.address) {
            self.select_address(&mut link).await?;
        }

        self.command = frame.clone();
        self.exchange(&mut link, &frame).await
    }

    /// Select this device on the link and update the address cache.
    async fn select_address(&mut self, link: &mut Link) -> BusResult<()> {
        let Some(select) = self.protocol.select_address(self.address) else {
            link.set_addressed(Some(self.address));
            return Ok(());
        };

        debug!(
            endpoint = %self.endpoint,
            address = self.address,
            previous = ?link.addressed(),
            "Selecting device"
        );
        link.set_addressed(None);

        let frame = self.protocol.encode(self.address, &select.request)?;
        let reply = match self.exchange(link, &frame).await {
            Ok(reply) => reply,
            Err(BusError::DeviceError(code)) => {
                return Err(BusError::AddressNotAcknowledged {
                    address: self.address,
                    reply: code,
                })
            }
            Err(err) => return Err(err),
        };
        if reply.trim_ascii() != select.ack.as_slice() {
            return Err(BusError::AddressNotAcknowledged {
                address: self.address,
                reply: String::from_utf8_lossy(&reply).into_owned(),
            });
        }

        link.set_addressed(Some(self.address));
        Ok(())
    }

    /// Run one framed exchange with up to `read_retries` extra attempts.
    async fn exchange(&mut self, link: &mut Link, frame: &[u8]) -> BusResult<Vec<u8>> {
        let attempts = self.options.read_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.attempt(link, frame).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    debug!(
                        endpoint = %self.endpoint,
                        address = self.address,
                        attempt,
                        attempts,
                        error = %err,
                        "Exchange attempt failed, retrying"
                    );
                    self.read_timeout = self.options.read_timeout;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        self.read_timeout = self.options.read_timeout;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(&mut self, link: &mut Link, frame: &[u8]) -> BusResult<Vec<u8>> {
        link.reset_input_buffer().await?;

        let started = Instant::now();
        link.write_all(frame).await?;
        let raw = self.read_frame(link).await?;
        let round_trip = started.elapsed();

        trace!(
            endpoint = %self.endpoint,
            address = self.address,
            sent = ?String::from_utf8_lossy(frame),
            received = ?String::from_utf8_lossy(&raw),
            round_trip = ?round_trip,
            "Exchange"
        );

        let decoded = self.protocol.decode(self.address, &raw);
        self.raw_response = raw;
        let payload = decoded?;
        self.read_timeout = self.options.adaptive_timeout(round_trip);
        Ok(payload)
    }

    /// Read until the protocol sees a complete frame or the read timeout expires.
    async fn read_frame(&self, link: &mut Link) -> BusResult<Vec<u8>> {
        let timeout = self.read_timeout;
        let deadline = Instant::now() + timeout;
        let mut buf = BytesMut::with_capacity(64);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = link
                .read(MAX_RESPONSE_LEN.saturating_sub(buf.len()), remaining)
                .await?;
            buf.extend_from_slice(&chunk);

            if self.protocol.is_complete(&buf) {
                return Ok(buf.to_vec());
            }
            if buf.len() >= MAX_RESPONSE_LEN {
                return Err(BusError::MalformedResponse(format!(
                    "no frame end within {MAX_RESPONSE_LEN} bytes"
                )));
            }
        }

        if buf.is_empty() {
            Err(BusError::Timeout(timeout))
        } else {
            Err(BusError::MissingTerminator(
                String::from_utf8_lossy(&buf).into_owned(),
            ))
        }
    }
}

impl Drop for AsyncSession {
    fn drop(&mut self) {
        // No async close here; the link shuts when its last handle is dropped.
        drop(self.release());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GenProtocol;
    use crate::transport::{MockEvent, MockTransport};
    use tracing_test::traced_test;

    fn gen_device(identity: &'static str) -> MockTransport {
        MockTransport::new().with_responder(move |frame| {
            let text = String::from_utf8_lossy(frame);
            let cmd = text.trim_end_matches('\r');
            let reply = if cmd.starts_with("ADR ") {
                "OK".to_string()
            } else if cmd == "IDN?" {
                identity.to_string()
            } else if cmd == "MV?" {
                "5.012".to_string()
            } else if cmd == "BOOM" {
                panic!("responder exploded");
            } else {
                "C01".to_string()
            };
            Some(format!("{reply}\r").into_bytes())
        })
    }

    fn session(registry: &Arc<Registry>, address: u16, options: SessionOptions) -> AsyncSession {
        AsyncSession::new(
            Arc::clone(registry),
            Endpoint::Virtual("bench".into()),
            address,
            Arc::new(GenProtocol::new(false)),
            options,
        )
    }

    #[tokio::test]
    async fn init_selects_identifies_and_parses_limits() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let mut psu = session(&registry, 6, SessionOptions::default());
        assert_eq!(psu.state(), SessionState::PreInit);
        assert!(psu.init().await);
        assert!(psu.is_ready());
        assert_eq!(psu.identity(), Some("FAKELAMBDA GEN10-100"));
        assert_eq!(psu.limits().max_voltage, 10.0);
        assert_eq!(psu.limits().max_current, 100.0);
        assert_eq!(psu.suspend_until(), None);
        assert_eq!(mock.writes(), vec![b"ADR 6\r".to_vec(), b"IDN?\r".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognised_identity_suspends_for_long_delay() {
        let registry = Arc::new(Registry::new());
        registry.attach_transport(Endpoint::Virtual("bench".into()), gen_device("ACME 3000"));

        let options = SessionOptions::default();
        let mut psu = session(&registry, 1, options.clone());
        let before = Instant::now();
        assert!(!psu.init().await);
        assert!(matches!(
            psu.last_error(),
            Some(BusError::UnrecognizedIdentity(id)) if id == "ACME 3000"
        ));
        assert_eq!(
            psu.suspend_until(),
            Some(before + options.long_suspend_delay)
        );
        assert_eq!(psu.identity(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_address_suspends_for_long_delay() {
        let registry = Arc::new(Registry::new());
        let options = SessionOptions::default();
        let mut psu = session(&registry, 0, options.clone());

        let before = Instant::now();
        assert!(!psu.init().await);
        assert_eq!(psu.state(), SessionState::Suspended);
        assert_eq!(
            psu.suspend_until(),
            Some(before + options.long_suspend_delay)
        );
        assert!(matches!(
            psu.last_error(),
            Some(BusError::InvalidAddress { .. })
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_deadline_is_monotonic() {
        let registry = Arc::new(Registry::new());
        let mut psu = session(&registry, 1, SessionOptions::default());

        let start = Instant::now();
        psu.suspend(Some(Duration::from_secs(10)));
        psu.suspend(Some(Duration::from_secs(2)));
        assert_eq!(psu.suspend_until(), Some(start + Duration::from_secs(10)));

        psu.suspend(Some(Duration::from_secs(30)));
        assert_eq!(psu.suspend_until(), Some(start + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_waits_for_deadline_before_reinit() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        mock.fail_open(true);
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let options = SessionOptions::default();
        let mut psu = session(&registry, 3, options.clone());
        let before = Instant::now();
        assert!(!psu.poll().await);
        assert!(matches!(
            psu.last_error(),
            Some(BusError::TransportNotReady(_))
        ));
        assert_eq!(psu.suspend_until(), Some(before + options.suspend_delay));

        mock.fail_open(false);
        tokio::time::advance(options.suspend_delay - Duration::from_secs(1)).await;
        assert!(!psu.poll().await, "window still open");
        assert!(!psu.is_ready());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(psu.poll().await);
        assert!(psu.is_ready());
    }

    #[tokio::test]
    async fn not_ready_session_never_touches_transport() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let mut psu = session(&registry, 2, SessionOptions::default());
        assert!(!psu.send_command(b"MV?").await);
        assert!(mock.events().is_empty());
    }

    #[tokio::test]
    async fn invalid_command_is_rejected_locally() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let mut psu = session(&registry, 2, SessionOptions::default());
        assert!(psu.init().await);
        mock.clear_events();

        assert!(!psu.send_command(b"").await);
        assert!(!psu.send_command(b"PV 1\rOUT 1").await);
        assert!(psu.is_ready());
        assert!(mock.events().is_empty());
        assert!(matches!(
            psu.last_error(),
            Some(BusError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn device_error_reply_does_not_suspend() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let mut psu = session(&registry, 2, SessionOptions::default());
        assert!(psu.init().await);
        mock.clear_events();

        assert!(!psu.send_command(b"XYZ").await);
        assert!(psu.is_ready());
        assert_eq!(mock.writes().len(), 1);
        assert!(matches!(psu.last_error(), Some(BusError::DeviceError(_))));
    }

    #[tokio::test]
    async fn stale_input_is_discarded() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let mut psu = session(&registry, 2, SessionOptions::default());
        assert!(psu.init().await);

        mock.push_unsolicited(b"9.999\r");
        assert!(psu.send_command(b"MV?").await);
        assert_eq!(psu.response(), b"5.012");
        assert_eq!(psu.command(), b"MV?\r");
    }

    #[tokio::test]
    async fn chunked_reply_is_reassembled() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100").with_chunk_size(1);
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let mut psu = session(&registry, 2, SessionOptions::default());
        assert!(psu.init().await);
        assert_eq!(psu.query_f64(b"MV?").await, 5.012);
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_adapts_to_round_trip() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100").with_latency(Duration::from_millis(60));
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let options = SessionOptions::default()
            .with_read_timeout(Duration::from_millis(500))
            .with_min_read_timeout(Duration::from_millis(50));
        let mut psu = session(&registry, 2, options.clone());
        assert_eq!(psu.read_timeout(), Duration::from_millis(500));
        assert!(psu.init().await);
        assert_eq!(psu.read_timeout(), Duration::from_millis(120));

        mock.set_silent(true);
        assert!(!psu.send_command(b"MV?").await);
        assert_eq!(psu.read_timeout(), options.read_timeout);
    }

    #[tokio::test]
    #[traced_test]
    async fn panic_inside_exchange_suspends() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        registry.attach_transport(Endpoint::Virtual("bench".into()), mock.clone());

        let mut psu = session(&registry, 2, SessionOptions::default());
        assert!(psu.init().await);

        assert!(!psu.send_command(b"BOOM").await);
        assert_eq!(psu.state(), SessionState::Suspended);
        assert!(matches!(psu.last_error(), Some(BusError::Panicked(_))));
        assert!(logs_contain("Exchange panicked"));
    }

    #[tokio::test]
    async fn close_releases_claim_and_transport() {
        let registry = Arc::new(Registry::new());
        let mock = gen_device("FAKELAMBDA GEN10-100");
        let endpoint = Endpoint::Virtual("bench".into());
        registry.attach_transport(endpoint.clone(), mock.clone());

        let mut psu = session(&registry, 4, SessionOptions::default());
        assert!(psu.init().await);
        assert_eq!(registry.find_by(&endpoint, 4), Some(psu.id()));

        psu.close().await;
        assert_eq!(psu.state(), SessionState::Closed);
        assert!(registry.is_empty());
        assert!(!registry.has_transport(&endpoint));
        assert!(!mock.is_open());
        assert_eq!(mock.events().last(), Some(&MockEvent::Close));
        assert!(!psu.poll().await);
    }

    #[tokio::test]
    async fn drop_releases_claim() {
        let registry = Arc::new(Registry::new());
        let endpoint = Endpoint::Virtual("bench".into());
        registry.attach_transport(endpoint.clone(), gen_device("FAKELAMBDA GEN10-100"));

        {
            let mut psu = session(&registry, 4, SessionOptions::default());
            assert!(psu.init().await);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
