//! Blocking front end for scripts and plain threads.
//!
//! [`BlockingBus`] owns a multi-threaded tokio runtime and drives async sessions to
//! completion on it, so synchronous callers get the same state machine, the same shared
//! transports and the same registry as async callers.
//!
//! Do not call into these types from inside an async context; `block_on` panics there.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use super::{AsyncSession, SessionOptions, SessionState};
use crate::devices::Device;
use crate::error::{BusError, BusResult};
use crate::protocol::Protocol;
use crate::registry::Registry;
use crate::transport::Endpoint;

/// Synchronous entry point: a registry plus the runtime that drives its sessions.
///
/// Cloning is cheap; clones share the registry and runtime.
#[derive(Debug, Clone)]
pub struct BlockingBus {
    registry: Arc<Registry>,
    runtime: Arc<Runtime>,
}

impl BlockingBus {
    /// Create a bus with a fresh registry.
    pub fn new() -> BusResult<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a bus over an existing registry.
    pub fn with_registry(registry: Arc<Registry>) -> BusResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("instrument-bus")
            .enable_all()
            .build()
            .map_err(BusError::Io)?;
        Ok(Self {
            registry,
            runtime: Arc::new(runtime),
        })
    }

    /// Registry shared by every session created here.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run a future to completion on the bus runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Create and initialise a raw session. Check [`Session::is_ready`] afterwards.
    pub fn session(
        &self,
        endpoint: Endpoint,
        address: u16,
        protocol: Arc<dyn Protocol>,
        options: SessionOptions,
    ) -> Session {
        let inner = self.block_on(AsyncSession::connect(
            Arc::clone(&self.registry),
            endpoint,
            address,
            protocol,
            options,
        ));
        Blocking::new(inner, Arc::clone(&self.runtime))
    }

    /// Create and initialise a typed device.
    pub fn device<D: Device>(
        &self,
        endpoint: Endpoint,
        address: u16,
        options: SessionOptions,
    ) -> Blocking<D> {
        let inner = self.block_on(crate::devices::connect::<D>(
            Arc::clone(&self.registry),
            endpoint,
            address,
            options,
        ));
        Blocking::new(inner, Arc::clone(&self.runtime))
    }
}

/// A session or device paired with the runtime that drives it.
#[derive(Debug)]
pub struct Blocking<T> {
    inner: T,
    runtime: Arc<Runtime>,
}

/// Blocking raw session.
pub type Session = Blocking<AsyncSession>;

impl<T> Blocking<T> {
    fn new(inner: T, runtime: Arc<Runtime>) -> Self {
        Self { inner, runtime }
    }

    /// Run an async method of the wrapped value to completion.
    ///
    /// ```no_run
    /// # use instrument_bus::session::blocking::BlockingBus;
    /// # use instrument_bus::devices::TdkLambda;
    /// # fn demo() -> instrument_bus::BusResult<()> {
    /// let bus = BlockingBus::new()?;
    /// let mut psu = bus.device::<TdkLambda>("COM3".parse()?, 6, Default::default());
    /// let volts = psu.call(|psu| psu.read_voltage());
    /// # let _ = volts;
    /// # Ok(())
    /// # }
    /// ```
    pub fn call<'a, F, Fut, R>(&'a mut self, f: F) -> R
    where
        F: FnOnce(&'a mut T) -> Fut,
        Fut: Future<Output = R> + 'a,
    {
        let runtime = &self.runtime;
        runtime.block_on(f(&mut self.inner))
    }

    /// Borrow the wrapped value.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Take the wrapped value back.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl Session {
    /// See [`AsyncSession::send_command`].
    pub fn send_command(&mut self, command: &[u8]) -> bool {
        self.runtime.block_on(self.inner.send_command(command))
    }

    /// See [`AsyncSession::query`].
    pub fn query(&mut self, command: &[u8]) -> Option<String> {
        self.runtime.block_on(self.inner.query(command))
    }

    /// See [`AsyncSession::query_f64`].
    pub fn query_f64(&mut self, command: &[u8]) -> f64 {
        self.runtime.block_on(self.inner.query_f64(command))
    }

    /// See [`AsyncSession::poll`].
    pub fn poll(&mut self) -> bool {
        self.runtime.block_on(self.inner.poll())
    }

    /// See [`AsyncSession::suspend`].
    pub fn suspend(&mut self, delay: Option<Duration>) {
        self.inner.suspend(delay);
    }

    /// See [`AsyncSession::close`].
    pub fn close(&mut self) {
        self.runtime.block_on(self.inner.close());
    }

    /// Whether commands will be attempted.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Decoded payload of the last successful command.
    pub fn response(&self) -> &[u8] {
        self.inner.response()
    }

    /// Cause of the most recent failure.
    pub fn last_error(&self) -> Option<&BusError> {
        self.inner.last_error()
    }
}
