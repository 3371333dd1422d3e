//! Frontend listener implementation.
//!
//! Accepts client connections, serves HTTP/1.1 on each, and hands every
//! request to the dispatcher.

use crate::metrics::MetricsCollector;
use crate::proxy::{DispatchError, Dispatcher, ProxyBody, Upstream};
use crate::util::ShutdownSignal;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

/// Accepts client connections and serves them until shutdown.
pub struct FrontendListener {
    listener: TcpListener,
    dispatcher: Dispatcher,
    metrics: MetricsCollector,
}

impl FrontendListener {
    /// Bind the listen address.
    pub async fn bind(
        address: SocketAddr,
        dispatcher: Dispatcher,
        metrics: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;

        info!(
            listen = %address,
            strategy = dispatcher.strategy().name(),
            "frontend listener bound"
        );

        Ok(Self {
            listener,
            dispatcher,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires. Open connections are asked
    /// to finish their current request and close.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!("frontend listener starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr, shutdown.clone())
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }

                _ = shutdown.cancelled() => {
                    info!("frontend listener shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        shutdown: ShutdownSignal,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let dispatcher = self.dispatcher.clone();
        let metrics = self.metrics.clone();
        metrics.connection_opened();

        tokio::spawn(async move {
            let service = {
                let metrics = metrics.clone();
                service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    let metrics = metrics.clone();
                    async move { handle_request(req, client_addr, &dispatcher, &metrics).await }
                })
            };

            let conn = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };

            metrics.connection_closed();

            match result {
                Ok(()) => debug!(client = %client_addr, "connection completed"),
                Err(e) => debug!(client = %client_addr, error = %e, "connection ended with error"),
            }
        });
    }
}

/// Serve one request through the dispatcher.
#[instrument(skip_all, fields(method = %req.method(), uri = %req.uri(), client = %client_addr))]
async fn handle_request(
    req: Request<Incoming>,
    client_addr: SocketAddr,
    dispatcher: &Dispatcher,
    metrics: &MetricsCollector,
) -> Result<Response<ProxyBody>, Infallible> {
    let timer = metrics.start_request_timer();
    let method = req.method().clone();
    let req = req.map(|body| body.boxed());

    let response = match dispatcher.dispatch(req, Some(client_addr)).await {
        Ok(response) => {
            let backend = response
                .extensions()
                .get::<Upstream>()
                .map(|u| u.0.as_str())
                .unwrap_or_default();
            debug!(
                backend,
                status = response.status().as_u16(),
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "request forwarded"
            );
            timer.record(backend, method.as_str(), response.status().as_u16());
            return Ok(response);
        }
        Err(DispatchError::Exhausted(e)) => {
            timer.record("", method.as_str(), StatusCode::SERVICE_UNAVAILABLE.as_u16());
            let mut response = error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static("1"));
            response
        }
        Err(DispatchError::Forward { backend, source }) => {
            warn!(backend = %backend, error = %source, "forwarding failed");
            timer.record(&backend, method.as_str(), StatusCode::BAD_GATEWAY.as_u16());
            error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    };

    Ok(response)
}

/// Plain-text error response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}: {}\n", status, message)))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::algorithms::Random;
    use crate::backend::BackendRegistry;
    use crate::metrics::MemorySink;
    use crate::proxy::HttpForwarder;
    use crate::state::RegistryHandle;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn listener_with_no_healthy_backend() -> (FrontendListener, MetricsCollector) {
        let registry = RegistryHandle::new(BackendRegistry::new(["http://127.0.0.1:1"]).unwrap());
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(Random::new()),
            Arc::new(HttpForwarder::new(Duration::from_secs(1))),
            Arc::new(MemorySink::new()),
        );
        let metrics = MetricsCollector::new();
        let listener =
            FrontendListener::bind("127.0.0.1:0".parse().unwrap(), dispatcher, metrics.clone())
                .await
                .unwrap();
        (listener, metrics)
    }

    #[test]
    fn test_error_response() {
        let resp = error_response(StatusCode::BAD_GATEWAY, "test error");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");
    }

    #[tokio::test]
    async fn test_exhausted_maps_to_503() {
        let (listener, metrics) = listener_with_no_healthy_backend().await;
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(listener.run(shutdown.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /anything HTTP/1.1\r\nHost: lb\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 503"), "got {}", raw);
        assert!(raw.to_ascii_lowercase().contains("retry-after: 1"));
        assert!(raw.contains("no healthy backend available"));

        shutdown.shutdown();
        task.await.unwrap();

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"glb_requests_total{backend="none",method="GET",status="503"} 1"#));
    }
}
