//! Liveness checks against a single backend.

use crate::backend::Backend;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::Empty;
use hyper::header::USER_AGENT;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const PROBE_USER_AGENT: &str = concat!("glb-health-check/", env!("CARGO_PKG_VERSION"));

/// Why a liveness check failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("invalid probe URL: {0}")]
    InvalidUri(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe cancelled")]
    Cancelled,
}

/// A single liveness check.
///
/// Implementations report only success or failure; timeouts, cancellation
/// and bookkeeping are handled by the probe loop.
pub trait LivenessCheck: Send + Sync + 'static {
    fn check(&self, backend: Arc<Backend>) -> BoxFuture<'static, Result<(), ProbeError>>;
}

/// HTTP GET against `<base URL><path>`; any 2xx status is healthy.
#[derive(Clone)]
pub struct HttpChecker {
    client: Client<HttpConnector, Empty<Bytes>>,
    path: String,
}

impl HttpChecker {
    /// Create a checker probing `path` on every backend.
    pub fn new(path: impl Into<String>, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        // A fresh connection per probe: a pooled socket could report a backend
        // as alive after its listener is gone.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl LivenessCheck for HttpChecker {
    fn check(&self, backend: Arc<Backend>) -> BoxFuture<'static, Result<(), ProbeError>> {
        let client = self.client.clone();
        let uri = backend.probe_uri(&self.path);

        async move {
            let uri = uri.map_err(ProbeError::InvalidUri)?;
            let request = Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header(USER_AGENT, PROBE_USER_AGENT)
                .body(Empty::<Bytes>::new())
                .map_err(|e| ProbeError::InvalidUri(e.to_string()))?;

            let response = client
                .request(request)
                .await
                .map_err(|e| ProbeError::Request(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(ProbeError::Status(status.as_u16()))
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a fixed status line to every connection and report the request line.
    async fn serve_status(
        status: &'static str,
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]);
                    let _ = tx.send(head.lines().next().unwrap_or_default().to_string());
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        (addr, rx)
    }

    fn backend_at(addr: SocketAddr) -> Arc<Backend> {
        let registry = BackendRegistry::new([format!("http://{}", addr)]).unwrap();
        Arc::clone(&registry.backends()[0])
    }

    #[tokio::test]
    async fn test_http_check_success() {
        let (addr, mut requests) = serve_status("200 OK").await;
        let checker = HttpChecker::new("/healthz", Duration::from_secs(1));

        assert_eq!(checker.check(backend_at(addr)).await, Ok(()));
        assert_eq!(requests.recv().await.unwrap(), "GET /healthz HTTP/1.1");
    }

    #[tokio::test]
    async fn test_http_check_accepts_any_2xx() {
        let (addr, _requests) = serve_status("204 No Content").await;
        let checker = HttpChecker::new("/", Duration::from_secs(1));
        assert!(checker.check(backend_at(addr)).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_check_non_2xx() {
        let (addr, _requests) = serve_status("503 Service Unavailable").await;
        let checker = HttpChecker::new("/health", Duration::from_secs(1));
        assert_eq!(checker.check(backend_at(addr)).await, Err(ProbeError::Status(503)));
    }

    #[tokio::test]
    async fn test_http_check_refused() {
        // Bind then drop to get a port with no listener.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let checker = HttpChecker::new("/health", Duration::from_secs(1));

        let result = checker.check(backend_at(addr)).await;
        assert!(matches!(result, Err(ProbeError::Request(_))), "got {:?}", result);
    }

    #[test]
    fn test_probe_error_display() {
        assert_eq!(ProbeError::Status(502).to_string(), "unexpected status 502");
        assert_eq!(
            ProbeError::Timeout(Duration::from_millis(1500)).to_string(),
            "timed out after 1.5s"
        );
    }
}
