//! In-process transport for tests and emulated devices.
//!
//! `MockTransport` is a cheap clone handle: keep one copy to script behaviour and inspect
//! the event trace, and hand another to the registry. It provides:
//! - A responder closure mapping each written frame to an optional reply
//! - Queued one-shot replies that take precedence over the responder
//! - Silence, open-failure, write-failure and disconnect injection
//! - An ordered trace of every open/write/read/reset/close

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use super::Transport;
use crate::error::{BusError, BusResult};

/// Reply generator: written frame in, reply bytes out (`None` stays silent).
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// One observed transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Link opened.
    Open,
    /// Frame written.
    Write(Vec<u8>),
    /// Bytes returned by a read (empty on timeout).
    Read(Vec<u8>),
    /// Input buffer discarded.
    Reset,
    /// Link closed.
    Close,
}

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    silent: bool,
    fail_next_write: bool,
    disconnect_next_write: bool,
    short_next_write: bool,
    chunk_size: Option<usize>,
    latency: Duration,
    responder: Option<Responder>,
    scripted: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    events: Vec<MockEvent>,
}

/// Scriptable emulated link.
///
/// # Example
///
/// ```
/// use instrument_bus::transport::MockTransport;
///
/// let mock = MockTransport::new().with_responder(|frame| {
///     (frame == b"IDN?\r").then(|| b"FAKE GEN10-100\r".to_vec())
/// });
/// assert_eq!(mock.writes().len(), 0);
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("open", &state.open)
            .field("silent", &state.silent)
            .field("events", &state.events.len())
            .finish()
    }
}

impl MockTransport {
    /// Create a closed, silent-free mock with no responder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every write through `responder`.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
        self
    }

    /// Deliver replies in chunks of at most `size` bytes per read.
    pub fn with_chunk_size(self, size: usize) -> Self {
        self.state.lock().chunk_size = Some(size.max(1));
        self
    }

    /// Delay every read by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Queue a reply for the next write, ahead of the responder.
    pub fn push_reply(&self, reply: impl Into<Vec<u8>>) {
        self.state.lock().scripted.push_back(reply.into());
    }

    /// Place bytes in the input buffer as if they arrived unprompted.
    pub fn push_unsolicited(&self, bytes: &[u8]) {
        self.state.lock().pending.extend(bytes.iter().copied());
    }

    /// Stop answering writes (or resume).
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Make `open` fail until cleared.
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Fail the next write with an I/O error.
    pub fn inject_write_failure(&self) {
        self.state.lock().fail_next_write = true;
    }

    /// Fail the next write and drop the link, as an unplugged adapter would.
    pub fn inject_disconnect(&self) {
        self.state.lock().disconnect_next_write = true;
    }

    /// Accept one byte less than requested on the next write.
    pub fn inject_short_write(&self) {
        self.state.lock().short_next_write = true;
    }

    /// Whether the link is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Full event trace.
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// Every frame written so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                MockEvent::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget the event trace.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> BusResult<()> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "injected open failure",
            )));
        }
        if !state.open {
            state.open = true;
            state.events.push(MockEvent::Open);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn write(&mut self, bytes: &[u8]) -> BusResult<usize> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "mock transport is closed",
            )));
        }
        state.events.push(MockEvent::Write(bytes.to_vec()));

        if std::mem::take(&mut state.fail_next_write) {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected write failure",
            )));
        }
        if std::mem::take(&mut state.disconnect_next_write) {
            state.open = false;
            state.pending.clear();
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected disconnect",
            )));
        }
        if std::mem::take(&mut state.short_next_write) {
            return Ok(bytes.len().saturating_sub(1));
        }

        if state.silent {
            return Ok(bytes.len());
        }
        if let Some(reply) = state.scripted.pop_front() {
            state.pending.extend(reply);
            return Ok(bytes.len());
        }
        let responder = state.responder.clone();
        drop(state);

        // Responder runs unlocked so it may inspect other mocks.
        if let Some(reply) = responder.and_then(|respond| respond(bytes)) {
            self.state.lock().pending.extend(reply);
        }
        Ok(bytes.len())
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> BusResult<Vec<u8>> {
        let (latency, has_data) = {
            let state = self.state.lock();
            (state.latency, !state.pending.is_empty())
        };

        if !has_data {
            tokio::time::sleep(timeout).await;
            self.state.lock().events.push(MockEvent::Read(Vec::new()));
            return Ok(Vec::new());
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency.min(timeout)).await;
        }

        let mut state = self.state.lock();
        let take = state
            .chunk_size
            .unwrap_or(usize::MAX)
            .min(max)
            .min(state.pending.len());
        let chunk: Vec<u8> = state.pending.drain(..take).collect();
        state.events.push(MockEvent::Read(chunk.clone()));
        Ok(chunk)
    }

    async fn reset_input_buffer(&mut self) -> BusResult<()> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.events.push(MockEvent::Reset);
        Ok(())
    }

    async fn close(&mut self) -> BusResult<()> {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.pending.clear();
            state.events.push(MockEvent::Close);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responder_and_script() {
        let mut mock = MockTransport::new().with_responder(|frame| Some(frame.to_vec()));
        mock.open().await.unwrap();

        mock.push_reply(b"first\r".to_vec());
        mock.write(b"x\r").await.unwrap();
        assert_eq!(
            mock.read(64, Duration::from_millis(10)).await.unwrap(),
            b"first\r"
        );

        mock.write(b"echo\r").await.unwrap();
        assert_eq!(
            mock.read(64, Duration::from_millis(10)).await.unwrap(),
            b"echo\r"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_read_waits_for_timeout() {
        let mut mock = MockTransport::new().with_responder(|_| Some(b"OK\r".to_vec()));
        mock.open().await.unwrap();
        mock.set_silent(true);
        mock.write(b"MV?\r").await.unwrap();

        let start = tokio::time::Instant::now();
        let bytes = mock.read(64, Duration::from_millis(250)).await.unwrap();
        assert!(bytes.is_empty());
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn chunked_delivery_and_reset() {
        let mut mock = MockTransport::new().with_chunk_size(2);
        mock.open().await.unwrap();
        mock.push_unsolicited(b"abcde");

        assert_eq!(mock.read(64, Duration::from_millis(1)).await.unwrap(), b"ab");
        mock.reset_input_buffer().await.unwrap();
        assert!(mock
            .read(64, Duration::from_millis(1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn write_requires_open_link() {
        let mut mock = MockTransport::new();
        assert!(mock.write(b"x").await.is_err());
        mock.open().await.unwrap();
        mock.inject_write_failure();
        assert!(mock.write(b"x").await.is_err());
        assert!(mock.write(b"x").await.is_ok());

        mock.inject_disconnect();
        assert!(mock.write(b"x").await.is_err());
        assert!(!mock.is_open());
        assert!(mock.write(b"x").await.is_err());
    }
}
