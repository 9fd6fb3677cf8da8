//! Accept loops shared by every listener in this crate.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};
use warpgrid_coord::{Shutdown, shutdown_signalled};

use crate::dial::BoxedStream;
use crate::mux::is_fd_exhaustion;
use crate::reverse::ProxyBody;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept connections until shutdown, running `on_conn` for each one.
///
/// When `tls` is set every connection is handshaken first. On shutdown
/// the listener is closed and every connection task is awaited; each
/// receives its own copy of the shutdown signal.
pub(crate) async fn accept_loop<F, Fut>(
    mut shutdown: Shutdown,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    on_conn: Arc<F>,
) where
    F: Fn(BoxedStream, SocketAddr, Shutdown) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if is_fd_exhaustion(&e) {
                            warn!(error = %e, "out of file descriptors, backing off");
                        } else {
                            warn!(error = %e, "accept failed");
                        }
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let tls = tls.clone();
                let on_conn = on_conn.clone();
                let conn_shutdown = shutdown.clone();
                conns.spawn(async move {
                    let client: BoxedStream = match tls {
                        Some(acceptor) => {
                            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                                Ok(Ok(tls_stream)) => Box::new(tls_stream),
                                Ok(Err(e)) => {
                                    debug!(%peer, error = %e, "TLS handshake failed");
                                    return;
                                }
                                Err(_) => {
                                    debug!(%peer, "TLS handshake timed out");
                                    return;
                                }
                            }
                        }
                        None => Box::new(stream),
                    };
                    on_conn(client, peer, conn_shutdown).await;
                });
            }
            Some(_) = conns.join_next() => {}
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
    drop(listener);
    while conns.join_next().await.is_some() {}
}

/// Copy bytes both ways until either side closes or shutdown fires.
pub(crate) async fn splice(mut a: BoxedStream, mut b: BoxedStream, shutdown: &mut Shutdown) {
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut a, &mut b) => match copied {
            Ok((up, down)) => debug!(up, down, "connection closed"),
            Err(e) => debug!(error = %e, "connection ended with error"),
        },
        _ = shutdown_signalled(shutdown) => debug!("connection closed by shutdown"),
    }
}

/// Answers one HTTP request.
#[async_trait]
pub(crate) trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody>;
}

/// Serve HTTP/1.1 on `listener` with `handler` until shutdown.
pub(crate) async fn serve_http<H: RequestHandler>(
    shutdown: Shutdown,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<H>,
) {
    let on_conn = move |client: BoxedStream, peer: SocketAddr, mut shutdown: Shutdown| {
        let handler = handler.clone();
        async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req, peer).await) }
            });
            let conn = http1::Builder::new().serve_connection(TokioIo::new(client), svc);
            tokio::pin!(conn);
            tokio::select! {
                served = conn.as_mut() => {
                    if let Err(e) = served {
                        debug!(%peer, error = %e, "HTTP connection error");
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    conn.as_mut().graceful_shutdown();
                    if tokio::time::timeout(DRAIN_TIMEOUT, conn.as_mut()).await.is_err() {
                        debug!(%peer, "HTTP connection did not drain in time");
                    }
                }
            }
        }
    };
    accept_loop(shutdown, listener, tls, Arc::new(on_conn)).await;
}
