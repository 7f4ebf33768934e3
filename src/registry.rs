//! Session registry and transport pool.
//!
//! The registry is the single authority for which session owns which (endpoint, address)
//! pair, and it hands out the [`SharedTransport`] for each endpoint. Sessions receive it
//! by `Arc` at construction; nothing here is global.
//!
//! One `parking_lot` mutex guards both maps. It is held only for membership changes and
//! lookups, never across I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};
use crate::transport::{connect_transport, Endpoint, SharedTransport, Transport, TransportSettings};

/// Identifier handed to each session.
pub type SessionId = u64;

#[derive(Default)]
struct RegistryInner {
    claims: HashMap<(Endpoint, u16), SessionId>,
    transports: HashMap<Endpoint, Arc<SharedTransport>>,
}

/// Explicit registry of active sessions and their shared transports.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Registry")
            .field("sessions", &inner.claims.len())
            .field("transports", &inner.transports.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh session id.
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Claim `(endpoint, address)` for `session`.
    ///
    /// Claiming a pair the same session already holds is a no-op. Any other holder makes
    /// this fail with [`BusError::AddressInUse`].
    pub fn register(&self, endpoint: &Endpoint, address: u16, session: SessionId) -> BusResult<()> {
        let mut inner = self.inner.lock();
        let key = (endpoint.clone(), address);
        match inner.claims.get(&key) {
            Some(&owner) if owner == session => Ok(()),
            Some(&owner) => {
                warn!(
                    endpoint = %endpoint,
                    address,
                    owner,
                    requested_by = session,
                    "Address already claimed"
                );
                Err(BusError::AddressInUse {
                    endpoint: endpoint.to_string(),
                    address,
                })
            }
            None => {
                inner.claims.insert(key, session);
                debug!(endpoint = %endpoint, address, session, "Address claimed");
                Ok(())
            }
        }
    }

    /// Drop the claim on `(endpoint, address)` if `session` holds it.
    pub fn unregister(&self, endpoint: &Endpoint, address: u16, session: SessionId) -> bool {
        let mut inner = self.inner.lock();
        let key = (endpoint.clone(), address);
        if inner.claims.get(&key) == Some(&session) {
            inner.claims.remove(&key);
            debug!(endpoint = %endpoint, address, session, "Address released");
            true
        } else {
            false
        }
    }

    /// Session currently claiming `(endpoint, address)`.
    pub fn find_by(&self, endpoint: &Endpoint, address: u16) -> Option<SessionId> {
        self.inner
            .lock()
            .claims
            .get(&(endpoint.clone(), address))
            .copied()
    }

    /// Number of active claims.
    pub fn len(&self) -> usize {
        self.inner.lock().claims.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of claims on `endpoint`.
    pub fn sessions_on(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .lock()
            .claims
            .keys()
            .filter(|(ep, _)| ep == endpoint)
            .count()
    }

    /// Shared transport for `endpoint`, created on first use.
    pub fn transport(
        &self,
        endpoint: &Endpoint,
        settings: &TransportSettings,
    ) -> BusResult<Arc<SharedTransport>> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.transports.get(endpoint) {
            return Ok(Arc::clone(existing));
        }
        let io = connect_transport(endpoint, settings)?;
        let shared = Arc::new(SharedTransport::new(endpoint.clone(), io));
        inner
            .transports
            .insert(endpoint.clone(), Arc::clone(&shared));
        info!(endpoint = %endpoint, baud = settings.baud_rate, "Transport created");
        Ok(shared)
    }

    /// Use `io` as the transport for `endpoint`, replacing any idle one.
    pub fn attach_transport(
        &self,
        endpoint: Endpoint,
        io: impl Transport + 'static,
    ) -> Arc<SharedTransport> {
        let shared = Arc::new(SharedTransport::new(endpoint.clone(), Box::new(io)));
        self.inner
            .lock()
            .transports
            .insert(endpoint.clone(), Arc::clone(&shared));
        debug!(endpoint = %endpoint, "Transport attached");
        shared
    }

    /// Remove the transport for `endpoint` once no session claims it.
    ///
    /// Returns the removed transport so the caller can close it.
    pub fn release_transport(&self, endpoint: &Endpoint) -> Option<Arc<SharedTransport>> {
        let mut inner = self.inner.lock();
        if inner.claims.keys().any(|(ep, _)| ep == endpoint) {
            return None;
        }
        let removed = inner.transports.remove(endpoint);
        if removed.is_some() {
            debug!(endpoint = %endpoint, "Transport released");
        }
        removed
    }

    /// Whether a transport exists for `endpoint`.
    pub fn has_transport(&self, endpoint: &Endpoint) -> bool {
        self.inner.lock().transports.contains_key(endpoint)
    }
}
