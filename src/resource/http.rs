//! Managed HTTP listener with zero-downtime reload.
//!
//! The builder binds the socket at build time so a bad address or an
//! occupied port fails the reload before the running listener is
//! touched. The accept loop starts in the serve phase and drains
//! in-flight connections on retirement.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::ResourceBuilder;
use crate::error::ResourceError;
use crate::metrics::Metrics;

/// Settings for the `http` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpOptions {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Bind address.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_enabled() -> bool {
    true
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// One bound listener generation.
#[derive(Debug)]
pub struct HttpInstance {
    local_addr: SocketAddr,
    /// Held until the serve phase takes it.
    listener: Mutex<Option<TcpListener>>,
    shutdown: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
}

impl HttpInstance {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Builds HTTP listener instances serving `/healthz` and `/metrics`.
pub struct HttpBuilder {
    metrics: Arc<Metrics>,
}

impl HttpBuilder {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl ResourceBuilder for HttpBuilder {
    type Options = HttpOptions;
    type Instance = HttpInstance;

    fn section(&self) -> &'static str {
        "http"
    }

    fn enabled(&self, options: &HttpOptions) -> bool {
        options.enabled
    }

    async fn build(&self, options: &HttpOptions) -> Result<HttpInstance, ResourceError> {
        let addr = format!("{}:{}", options.addr, options.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ResourceError::BuildFailed {
                section: "http".into(),
                message: format!("failed to bind {addr}: {e}"),
            })?;

        let local_addr = listener.local_addr().map_err(|e| ResourceError::BuildFailed {
            section: "http".into(),
            message: e.to_string(),
        })?;

        let (shutdown, _) = watch::channel(false);

        info!(addr = %local_addr, "HTTP listener bound");
        Ok(HttpInstance {
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn start(&self, instance: &Arc<HttpInstance>) -> Result<(), ResourceError> {
        let listener = match instance.listener.lock().await.take() {
            Some(listener) => listener,
            // Already serving.
            None => return Ok(()),
        };

        let metrics = Arc::clone(&self.metrics);
        let in_flight = Arc::clone(&instance.in_flight);
        let mut shutdown_rx = instance.shutdown.subscribe();
        let local_addr = instance.local_addr;

        tokio::spawn(async move {
            info!(addr = %local_addr, "HTTP listener serving");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(conn) => conn,
                            Err(e) => {
                                warn!(error = %e, "Accept failed");
                                continue;
                            }
                        };

                        let io = TokioIo::new(stream);
                        let metrics = Arc::clone(&metrics);
                        let in_flight = Arc::clone(&in_flight);
                        let mut conn_shutdown = shutdown_rx.clone();

                        in_flight.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let metrics = Arc::clone(&metrics);
                                async move { handle_request(req, &metrics) }
                            });

                            let conn = http1::Builder::new().serve_connection(io, service);
                            tokio::pin!(conn);
                            let mut draining = false;
                            loop {
                                tokio::select! {
                                    res = conn.as_mut() => {
                                        if let Err(e) = res {
                                            warn!(error = %e, "Error serving connection");
                                        }
                                        break;
                                    }
                                    _ = conn_shutdown.changed(), if !draining => {
                                        // Finish any in-flight response, then close
                                        // instead of idling on keep-alive.
                                        draining = true;
                                        conn.as_mut().graceful_shutdown();
                                    }
                                }
                            }
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                }
            }
            info!(addr = %local_addr, "HTTP listener stopped accepting");
        });

        Ok(())
    }

    async fn retire(&self, instance: Arc<HttpInstance>, grace: Duration) {
        // Stop accepting; existing connections drain below.
        let _ = instance.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        while instance.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    addr = %instance.local_addr,
                    remaining = instance.in_flight.load(Ordering::SeqCst),
                    "Grace period elapsed, force-releasing HTTP listener"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(addr = %instance.local_addr, "HTTP listener drained");
    }
}

fn handle_request(
    req: Request<Incoming>,
    metrics: &Metrics,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/healthz" => Ok(Response::new(Full::new(Bytes::from_static(b"ok")))),
        "/metrics" => {
            let body = metrics.gather();
            Ok(Response::new(Full::new(Bytes::from(body))))
        }
        _ => Ok(Response::builder()
            .status(404)
            .body(Full::new(Bytes::from_static(b"Not Found")))
            .unwrap_or_default()),
    }
}
