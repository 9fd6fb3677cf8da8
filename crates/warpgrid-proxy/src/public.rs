//! Public port front ends.
//!
//! [`PublicPortManager`] owns one port server per public port address
//! on this host. Protocol `http`/`https` ports are served by the HTTP
//! reverse proxy; every other protocol is a raw TCP passthrough.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{self, HeaderValue};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use warpgrid_coord::{Shutdown, is_shutdown};
use warpgrid_registry::{ExportDetails, PublicPortHandler};

use crate::dial::{BoxedStream, Dialer};
use crate::error::{ProxyError, ProxyResult};
use crate::front::{RequestHandler, accept_loop, serve_http, splice};
use crate::reverse::{ProxyBody, ProxyCache, text_response};
use crate::round_robin::RoundRobinExports;

/// Invoked when a port cannot be served, since enabling has no return value.
pub type FailureCallback = Arc<dyn Fn(&str, &ProxyError) + Send + Sync>;

pub const HSTS_VALUE: &str = "max-age=31536000";

/// Turn a public port address into a bindable socket address.
///
/// `":9000"` and `"9000"` bind on `bind_ip`; anything else is used as given.
pub fn bind_address(bind_ip: &str, port: &str) -> String {
    if port.starts_with(':') {
        format!("{bind_ip}{port}")
    } else if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
        format!("{bind_ip}:{port}")
    } else {
        port.to_string()
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct PortServer {
    exports: Arc<RoundRobinExports>,
    running: Option<Running>,
}

impl PortServer {
    fn new() -> Self {
        Self {
            exports: Arc::new(RoundRobinExports::new()),
            running: None,
        }
    }
}

/// Serves every enabled public port on this host.
pub struct PublicPortManager {
    bind_ip: String,
    tls: Option<TlsAcceptor>,
    cache: Arc<ProxyCache>,
    mux_tls: bool,
    on_failure: Option<FailureCallback>,
    ports: Mutex<HashMap<String, PortServer>>,
}

impl PublicPortManager {
    /// `tls` is required for ports that ask for TLS; `mux_tls` controls
    /// how remote exports are dialed.
    pub fn new(bind_ip: impl Into<String>, tls: Option<TlsAcceptor>, cache: Arc<ProxyCache>, mux_tls: bool) -> Self {
        Self {
            bind_ip: bind_ip.into(),
            tls,
            cache,
            mux_tls,
            on_failure: None,
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    fn dialer(&self) -> Arc<Dialer> {
        self.cache.dialer().clone()
    }

    /// Start serving `port`. Fails if it is already being served.
    pub async fn serve(&self, port: &str, protocol: &str, use_tls: bool) -> ProxyResult<SocketAddr> {
        let mut ports = self.ports.lock().await;
        let server = ports.entry(port.to_string()).or_insert_with(PortServer::new);
        if server.running.is_some() {
            return Err(ProxyError::PortServerRunning(port.to_string()));
        }

        let tls = if use_tls {
            Some(
                self.tls
                    .clone()
                    .ok_or_else(|| ProxyError::Tls(format!("no certificate for TLS port {port}")))?,
            )
        } else {
            None
        };
        let listener = TcpListener::bind(bind_address(&self.bind_ip, port)).await?;
        let local_addr = listener.local_addr()?;
        let (stop, stop_rx) = watch::channel(false);
        let exports = server.exports.clone();

        let handle = match protocol {
            "http" | "https" => {
                let front = Arc::new(PortHttp {
                    exports,
                    cache: self.cache.clone(),
                    mux_tls: self.mux_tls,
                    protocol: protocol.to_string(),
                    hsts: use_tls,
                    closed: stop_rx.clone(),
                });
                tokio::spawn(serve_http(stop_rx, listener, tls, front))
            }
            _ => tokio::spawn(serve_tcp(
                stop_rx,
                listener,
                tls,
                exports,
                self.dialer(),
                self.mux_tls,
            )),
        };

        info!(port, %local_addr, protocol, tls = use_tls, "public port serving");
        server.running = Some(Running {
            stop,
            handle,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop serving `port` and wait for its connections to end.
    /// The port's exports are kept. Returns `false` if it was not running.
    pub async fn stop(&self, port: &str) -> bool {
        let running = {
            let mut ports = self.ports.lock().await;
            ports.get_mut(port).and_then(|s| s.running.take())
        };
        let Some(running) = running else {
            return false;
        };
        let _ = running.stop.send(true);
        if let Err(e) = running.handle.await {
            warn!(port, error = %e, "port server task failed");
        }
        info!(port, "public port stopped");
        true
    }

    /// Address a running port is bound to.
    pub async fn local_addr(&self, port: &str) -> Option<SocketAddr> {
        let ports = self.ports.lock().await;
        ports.get(port)?.running.as_ref().map(|r| r.local_addr)
    }

    /// Number of exports a port currently routes to.
    pub async fn export_count(&self, port: &str) -> usize {
        let ports = self.ports.lock().await;
        ports.get(port).map_or(0, |s| s.exports.len())
    }

    /// Stop every running port.
    pub async fn shutdown(&self) {
        let ports: Vec<String> = self.ports.lock().await.keys().cloned().collect();
        for port in ports {
            self.stop(&port).await;
        }
    }
}

#[async_trait]
impl PublicPortHandler for PublicPortManager {
    async fn enable(&self, port: &str, protocol: &str, use_tls: bool) {
        if let Err(e) = self.serve(port, protocol, use_tls).await {
            match &e {
                ProxyError::PortServerRunning(_) => debug!(port, "port already serving"),
                _ => error!(port, error = %e, "could not serve public port"),
            }
            if let Some(callback) = &self.on_failure {
                callback(port, &e);
            }
        }
    }

    async fn disable(&self, port: &str) {
        self.stop(port).await;
    }

    async fn set(&self, port: &str, exports: Vec<ExportDetails>) {
        let mut ports = self.ports.lock().await;
        let server = ports.entry(port.to_string()).or_insert_with(PortServer::new);
        debug!(port, count = exports.len(), "public port exports updated");
        server.exports.set(exports);
    }
}

/// Raw TCP passthrough: one export per accepted connection.
async fn serve_tcp(
    shutdown: Shutdown,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    exports: Arc<RoundRobinExports>,
    dialer: Arc<Dialer>,
    mux_tls: bool,
) {
    let on_conn = move |client: BoxedStream, peer: SocketAddr, mut shutdown: Shutdown| {
        let exports = exports.clone();
        let dialer = dialer.clone();
        async move {
            let Some(export) = exports.next() else {
                debug!(%peer, "no exports available, closing connection");
                return;
            };
            let backend = match dialer.get_remote_connection(mux_tls, &export).await {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(%peer, target = %export.private_address(), error = %e, "could not dial export");
                    return;
                }
            };
            splice(client, backend, &mut shutdown).await;
        }
    };
    accept_loop(shutdown, listener, tls, Arc::new(on_conn)).await;
}

struct PortHttp {
    exports: Arc<RoundRobinExports>,
    cache: Arc<ProxyCache>,
    mux_tls: bool,
    protocol: String,
    hsts: bool,
    closed: Shutdown,
}

impl PortHttp {
    /// Requests that race a stop get a 503 and the connection is closed.
    fn refuse_if_closed(&self) -> Option<Response<ProxyBody>> {
        if !is_shutdown(&self.closed) {
            return None;
        }
        let mut response = text_response(StatusCode::SERVICE_UNAVAILABLE, "endpoint not available");
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        Some(response)
    }
}

#[async_trait]
impl RequestHandler for PortHttp {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        if let Some(response) = self.refuse_if_closed() {
            return response;
        }
        let Some(export) = self.exports.next() else {
            return text_response(StatusCode::NOT_FOUND, "endpoint not available");
        };
        let proxy = self.cache.get_reverse_proxy(self.mux_tls, &export);
        let mut response = proxy.forward(req, Some(peer), &self.protocol).await;
        if self.hsts {
            response.headers_mut().insert(
                header::STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static(HSTS_VALUE),
            );
        }
        response
    }
}
