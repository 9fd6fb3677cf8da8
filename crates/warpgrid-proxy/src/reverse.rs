//! HTTP reverse proxy to exports.
//!
//! [`ProxyCache`] hands out one [`ReverseProxy`] per backend, keyed by
//! (host address, private address, TLS flag). A proxy keeps its idle
//! HTTP/1.1 connections and reuses them for later requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};
use warpgrid_registry::ExportDetails;

use crate::dial::Dialer;
use crate::error::{ProxyError, ProxyResult};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const MAX_IDLE: usize = 16;

pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Build a body from a fixed payload.
pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// A plain-text response with the given status.
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Forwards requests to a single export.
pub struct ReverseProxy {
    dialer: Arc<Dialer>,
    export: ExportDetails,
    use_tls: bool,
    idle: Mutex<Vec<SendRequest<Incoming>>>,
}

impl ReverseProxy {
    pub fn new(dialer: Arc<Dialer>, export: ExportDetails, use_tls: bool) -> Self {
        Self {
            dialer,
            export,
            use_tls,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Forward `req` and return the upstream response, or 502 on failure.
    ///
    /// `X-Forwarded-Proto` is set to `forwarded_proto` unless the client
    /// already sent one.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        client: Option<SocketAddr>,
        forwarded_proto: &str,
    ) -> Response<ProxyBody> {
        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        if !headers.contains_key(X_FORWARDED_PROTO)
            && let Ok(proto) = HeaderValue::from_str(forwarded_proto)
        {
            headers.insert(X_FORWARDED_PROTO, proto);
        }
        if let Some(client) = client {
            let ip = client.ip().to_string();
            let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {ip}"),
                None => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let mut sender = match self.checkout().await {
            Ok(sender) => sender,
            Err(e) => {
                warn!(target = %self.export.private_address(), error = %e, "could not reach export");
                return text_response(StatusCode::BAD_GATEWAY, "bad gateway");
            }
        };

        match sender.send_request(req).await {
            Ok(mut response) => {
                self.checkin(sender);
                strip_hop_by_hop(response.headers_mut());
                response.map(|body| body.boxed())
            }
            Err(e) => {
                warn!(target = %self.export.private_address(), error = %e, "upstream request failed");
                text_response(StatusCode::BAD_GATEWAY, "bad gateway")
            }
        }
    }

    async fn checkout(&self) -> ProxyResult<SendRequest<Incoming>> {
        {
            let mut idle = self.idle.lock().expect("idle lock");
            idle.retain(|s| !s.is_closed());
            if let Some(pos) = idle.iter().position(|s| s.is_ready()) {
                return Ok(idle.swap_remove(pos));
            }
        }
        let stream = self.dialer.get_remote_connection(self.use_tls, &self.export).await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        let target = self.export.private_address();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(target = %target, error = %e, "upstream connection closed");
            }
        });
        Ok(sender)
    }

    fn checkin(&self, sender: SendRequest<Incoming>) {
        let mut idle = self.idle.lock().expect("idle lock");
        if idle.len() < MAX_IDLE {
            idle.push(sender);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProxyKey {
    host_address: String,
    private_address: String,
    use_tls: bool,
}

/// One [`ReverseProxy`] per backend, built on first use.
pub struct ProxyCache {
    dialer: Arc<Dialer>,
    proxies: Mutex<HashMap<ProxyKey, Arc<ReverseProxy>>>,
}

impl ProxyCache {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self {
            dialer,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub fn dialer(&self) -> &Arc<Dialer> {
        &self.dialer
    }

    pub fn get_reverse_proxy(&self, use_tls: bool, export: &ExportDetails) -> Arc<ReverseProxy> {
        let private_address = export.private_address();
        let host_address = if self.dialer.is_local(export) {
            private_address.clone()
        } else {
            export.mux_address()
        };
        let key = ProxyKey {
            host_address,
            private_address,
            use_tls,
        };
        let mut proxies = self.proxies.lock().expect("proxy cache lock");
        proxies
            .entry(key)
            .or_insert_with(|| Arc::new(ReverseProxy::new(self.dialer.clone(), export.clone(), use_tls)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.proxies.lock().expect("proxy cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
