//! Sending a prepared request to a backend.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;

/// Body type used on both sides of the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Forwarding failure for a single request. Never retried.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("cannot build upstream request: {0}")]
    InvalidTarget(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

/// Delivers a request whose URI already names the backend.
pub trait Forwarder: Send + Sync + 'static {
    fn forward(
        &self,
        request: Request<ProxyBody>,
    ) -> BoxFuture<'static, Result<Response<ProxyBody>, ForwardError>>;
}

/// HTTP/1.1 forwarder over `hyper-util`'s client.
///
/// Idle connections are not kept: every request opens a fresh connection.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, ProxyBody>,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client }
    }
}

impl Forwarder for HttpForwarder {
    fn forward(
        &self,
        request: Request<ProxyBody>,
    ) -> BoxFuture<'static, Result<Response<ProxyBody>, ForwardError>> {
        let response = self.client.request(request);
        async move {
            let response = response.await?;
            Ok(response.map(|body| body.boxed()))
        }
        .boxed()
    }
}
