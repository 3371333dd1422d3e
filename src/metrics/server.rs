//! Prometheus metrics HTTP server.

use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Serves the collector's registry over HTTP.
pub struct MetricsServer {
    listener: TcpListener,
    path: String,
    collector: MetricsCollector,
}

impl MetricsServer {
    /// Bind the metrics endpoint.
    pub async fn bind(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            path,
            collector,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!(
            address = ?self.listener.local_addr().ok(),
            path = %self.path,
            "metrics server started"
        );

        let collector = Arc::new(self.collector);
        let path: Arc<str> = Arc::from(self.path);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let collector = Arc::clone(&collector);
                            let path = Arc::clone(&path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let collector = Arc::clone(&collector);
                                    let path = Arc::clone(&path);
                                    async move { handle_request(req, &collector, &path) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.cancelled() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn handle_request<B>(
    req: Request<B>,
    collector: &MetricsCollector,
    metrics_path: &str,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    debug!(path = %path, method = %req.method(), "metrics request");

    if req.method() != Method::GET {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n"));
    }

    let response = if path == metrics_path {
        match collector.encode() {
            Ok(buffer) => {
                let mut response = text(StatusCode::OK, buffer);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n")
            }
        }
    } else if path == "/health" || path == "/healthz" {
        text(StatusCode::OK, "OK\n")
    } else {
        text(StatusCode::NOT_FOUND, "Not found\n")
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let collector = MetricsCollector::new();
        collector.record_request(
            "http://10.0.0.1",
            "GET",
            200,
            std::time::Duration::from_millis(10),
        );

        let response = handle_request(get("/metrics"), &collector, "/metrics").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("glb_requests_total"));
    }

    #[test]
    fn test_other_paths() {
        let collector = MetricsCollector::new();

        let health = handle_request(get("/health"), &collector, "/metrics").unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let missing = handle_request(get("/nope"), &collector, "/metrics").unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let post = Request::builder().method(Method::POST).uri("/metrics").body(()).unwrap();
        let rejected = handle_request(post, &collector, "/metrics").unwrap();
        assert_eq!(rejected.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let server = MetricsServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "/metrics".into(),
            MetricsCollector::new(),
        )
        .await
        .unwrap();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        shutdown.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
