//! The shared virtual-host front door.
//!
//! All vhosts of a host are served from one HTTP(S) listener. The
//! subdomain is taken from the `Host` header: a configured alias suffix
//! is stripped, otherwise the first DNS label is used.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use http::header::{self, HeaderValue};
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use warpgrid_coord::Shutdown;
use warpgrid_registry::{ExportDetails, VHostHandler};

use crate::front::{RequestHandler, serve_http};
use crate::public::HSTS_VALUE;
use crate::reverse::{ProxyBody, ProxyCache, text_response};
use crate::round_robin::RoundRobinExports;

#[derive(Default)]
struct VHostEntry {
    enabled: AtomicBool,
    exports: RoundRobinExports,
}

/// Routes requests by subdomain to the exports of each enabled vhost.
pub struct VHostManager {
    cache: Arc<ProxyCache>,
    mux_tls: bool,
    host_aliases: Vec<String>,
    vhosts: RwLock<HashMap<String, Arc<VHostEntry>>>,
}

impl VHostManager {
    pub fn new(cache: Arc<ProxyCache>, mux_tls: bool, host_aliases: Vec<String>) -> Self {
        Self {
            cache,
            mux_tls,
            host_aliases: host_aliases.into_iter().map(|a| a.to_ascii_lowercase()).collect(),
            vhosts: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, subdomain: &str) -> Arc<VHostEntry> {
        let mut vhosts = self.vhosts.write().expect("vhosts lock");
        vhosts.entry(subdomain.to_string()).or_default().clone()
    }

    fn lookup(&self, subdomain: &str) -> Option<Arc<VHostEntry>> {
        self.vhosts.read().expect("vhosts lock").get(subdomain).cloned()
    }

    pub fn is_enabled(&self, subdomain: &str) -> bool {
        self.lookup(subdomain)
            .is_some_and(|e| e.enabled.load(Ordering::Acquire))
    }

    /// Subdomain addressed by a `Host` header value.
    pub fn subdomain_of(&self, host: &str) -> Option<String> {
        let host = host.trim().to_ascii_lowercase();
        let name = match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name.to_string(),
            _ => host.clone(),
        };
        for alias in &self.host_aliases {
            if name == *alias {
                return None;
            }
            if let Some(sub) = name.strip_suffix(alias.as_str()).and_then(|s| s.strip_suffix('.')) {
                if !sub.is_empty() {
                    return Some(sub.to_string());
                }
            }
        }
        name.split('.').next().filter(|s| !s.is_empty()).map(str::to_string)
    }

    /// Run the front door on `listener` until shutdown.
    pub async fn serve(self: Arc<Self>, shutdown: Shutdown, listener: TcpListener, tls: Option<TlsAcceptor>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, tls = tls.is_some(), "vhost front door listening");
        }
        let secure = tls.is_some();
        let front = Arc::new(VHostFront {
            manager: self,
            secure,
        });
        serve_http(shutdown, listener, tls, front).await;
        info!("vhost front door stopped");
    }
}

#[async_trait]
impl VHostHandler for VHostManager {
    async fn enable(&self, subdomain: &str) {
        self.entry(subdomain).enabled.store(true, Ordering::Release);
        info!(vhost = subdomain, "vhost enabled");
    }

    async fn disable(&self, subdomain: &str) {
        if let Some(entry) = self.lookup(subdomain) {
            entry.enabled.store(false, Ordering::Release);
        }
        info!(vhost = subdomain, "vhost disabled");
    }

    async fn set(&self, subdomain: &str, exports: Vec<ExportDetails>) {
        debug!(vhost = subdomain, count = exports.len(), "vhost exports updated");
        self.entry(subdomain).exports.set(exports);
    }
}

struct VHostFront {
    manager: Arc<VHostManager>,
    secure: bool,
}

#[async_trait]
impl RequestHandler for VHostFront {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();

        let Some(subdomain) = self.manager.subdomain_of(&host) else {
            return text_response(StatusCode::NOT_FOUND, "no available service for vhost");
        };
        let entry = match self.manager.lookup(&subdomain) {
            Some(entry) if entry.enabled.load(Ordering::Acquire) => entry,
            _ => {
                return text_response(
                    StatusCode::NOT_FOUND,
                    format!("no available service for vhost {subdomain}"),
                );
            }
        };
        let Some(export) = entry.exports.next() else {
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("vhost {subdomain} has no running instances"),
            );
        };

        let proto = if self.secure { "https" } else { "http" };
        let proxy = self.manager.cache.get_reverse_proxy(self.manager.mux_tls, &export);
        let mut response = proxy.forward(req, Some(peer), proto).await;
        if self.secure {
            response.headers_mut().insert(
                header::STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static(HSTS_VALUE),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use crate::dial::{Dialer, LocalAddrs};

    use super::*;

    fn manager(aliases: &[&str]) -> VHostManager {
        let dialer = Dialer::new(Arc::new(LocalAddrs::new([]))).unwrap();
        VHostManager::new(
            Arc::new(ProxyCache::new(Arc::new(dialer))),
            false,
            aliases.iter().map(|a| a.to_string()).collect(),
        )
    }

    #[test]
    fn subdomain_resolution() {
        let m = manager(&["apps.example.com"]);
        assert_eq!(m.subdomain_of("www.apps.example.com:443").as_deref(), Some("www"));
        assert_eq!(m.subdomain_of("a.b.apps.example.com").as_deref(), Some("a.b"));
        assert_eq!(m.subdomain_of("WWW.other.org").as_deref(), Some("www"));
        assert_eq!(m.subdomain_of("").as_deref(), None);
        assert_eq!(m.subdomain_of("apps.example.com").as_deref(), None);
        assert_eq!(m.subdomain_of("Apps.Example.com:8080").as_deref(), None);
    }

    #[tokio::test]
    async fn enable_and_disable_flip_the_flag() {
        let m = manager(&[]);
        assert!(!m.is_enabled("www"));
        m.enable("www").await;
        assert!(m.is_enabled("www"));
        m.disable("www").await;
        assert!(!m.is_enabled("www"));
    }
}
