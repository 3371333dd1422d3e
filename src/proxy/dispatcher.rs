//! Per-request backend selection and forwarding.

use crate::backend::algorithms::{SelectionExhausted, SelectionStrategy};
use crate::backend::{Backend, LoadGuard};
use crate::metrics::{EventSink, LbEvent};
use crate::proxy::body::LeasedBody;
use crate::proxy::forwarder::{ForwardError, Forwarder, ProxyBody};
use crate::proxy::headers::{append_forwarded_for, set_host, strip_hop_by_hop};
use crate::state::RegistryHandle;
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why a request could not be served by any backend.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Exhausted(#[from] SelectionExhausted),

    #[error("forwarding to {backend} failed: {source}")]
    Forward {
        backend: String,
        #[source]
        source: ForwardError,
    },
}

/// Response extension naming the backend that produced the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream(pub String);

/// A selected backend with one unit of load counted against it.
///
/// The load is released when the lease, or the response body it is moved
/// into, is dropped.
#[derive(Debug)]
pub struct Lease {
    guard: LoadGuard,
}

impl Lease {
    pub fn backend(&self) -> &Arc<Backend> {
        self.guard.backend()
    }

    /// Base URL of the selected backend.
    pub fn url(&self) -> &Uri {
        self.guard.url()
    }

    /// Rewrite `request` for delivery to the leased backend.
    ///
    /// The backend's scheme and authority replace the target's; path and
    /// query are kept. Hop-by-hop headers are removed, `Host` is set to the
    /// backend, and `client` is appended to `x-forwarded-for`.
    pub fn prepare<B>(
        &self,
        request: &mut Request<B>,
        client: Option<SocketAddr>,
    ) -> Result<(), ForwardError> {
        let target = self
            .guard
            .rewrite_uri(request.uri())
            .map_err(ForwardError::InvalidTarget)?;

        let headers = request.headers_mut();
        strip_hop_by_hop(headers);
        set_host(headers, &target);
        if let Some(client) = client {
            append_forwarded_for(headers, client.ip());
        }

        *request.uri_mut() = target;
        Ok(())
    }

    pub fn into_guard(self) -> LoadGuard {
        self.guard
    }
}

/// Selects a backend for each request and forwards it there.
///
/// Holds the registry handle, not a registry, so a reconfiguration is picked
/// up by the next request.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RegistryHandle,
    strategy: Arc<dyn SelectionStrategy>,
    forwarder: Arc<dyn Forwarder>,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        registry: RegistryHandle,
        strategy: Arc<dyn SelectionStrategy>,
        forwarder: Arc<dyn Forwarder>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            strategy,
            forwarder,
            events,
        }
    }

    pub fn strategy(&self) -> &Arc<dyn SelectionStrategy> {
        &self.strategy
    }

    /// Pick a healthy backend and count one request against it.
    ///
    /// Fails with [`SelectionExhausted`] without touching any counter when
    /// no backend is healthy.
    pub fn select(&self) -> Result<Lease, SelectionExhausted> {
        let registry = self.registry.load();
        match self.strategy.claim(registry.backends()) {
            Ok(guard) => Ok(Lease { guard }),
            Err(exhausted) => {
                self.events.emit(&LbEvent::SelectionExhausted {
                    strategy: self.strategy.name(),
                    pool_size: registry.len(),
                });
                Err(exhausted)
            }
        }
    }

    /// Select a backend, forward `request` to it, and return its response.
    ///
    /// The backend's load stays counted until the response body is finished
    /// or dropped. A failed forward is not retried elsewhere.
    pub async fn dispatch(
        &self,
        mut request: Request<ProxyBody>,
        client: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let lease = self.select()?;
        let backend = lease.backend().label().to_string();

        lease
            .prepare(&mut request, client)
            .map_err(|source| DispatchError::Forward {
                backend: backend.clone(),
                source,
            })?;

        debug!(backend = %backend, uri = %request.uri(), "forwarding request");

        let response = self
            .forwarder
            .forward(request)
            .await
            .map_err(|source| DispatchError::Forward {
                backend: backend.clone(),
                source,
            })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.extensions.insert(Upstream(backend));
        let body = LeasedBody::new(body, lease.into_guard()).boxed();
        Ok(Response::from_parts(parts, body))
    }
}
