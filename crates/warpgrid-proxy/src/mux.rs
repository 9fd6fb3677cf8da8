//! The host multiplexer.
//!
//! One port per host (22250 by default) accepts proxied connections
//! from other hosts. Each connection starts with a fixed 6-byte header
//! naming the container address to reach: the four IPv4 octets followed
//! by the port in big-endian order. After the header the connection is
//! a plain byte stream.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use warpgrid_coord::Shutdown;

use crate::dial::{self, BoxedStream};
use crate::error::{ProxyError, ProxyResult};
use crate::front::{accept_loop, splice};

pub const MUX_HEADER_LEN: usize = 6;
pub const DEFAULT_MUX_PORT: u16 = 22250;

/// How long a peer has to send its header.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

pub fn pack(addr: SocketAddrV4) -> [u8; MUX_HEADER_LEN] {
    let mut header = [0u8; MUX_HEADER_LEN];
    header[..4].copy_from_slice(&addr.ip().octets());
    header[4..].copy_from_slice(&addr.port().to_be_bytes());
    header
}

/// Pack an `ip:port` string, rejecting anything that cannot be unpacked.
pub fn pack_address(address: &str) -> ProxyResult<[u8; MUX_HEADER_LEN]> {
    let addr: SocketAddrV4 = address
        .parse()
        .map_err(|_| ProxyError::Header(format!("{address} is not an IPv4 socket address")))?;
    validate(addr)?;
    Ok(pack(addr))
}

pub fn unpack(header: &[u8; MUX_HEADER_LEN]) -> ProxyResult<SocketAddrV4> {
    let ip = Ipv4Addr::new(header[0], header[1], header[2], header[3]);
    let port = u16::from_be_bytes([header[4], header[5]]);
    let addr = SocketAddrV4::new(ip, port);
    validate(addr)?;
    Ok(addr)
}

fn validate(addr: SocketAddrV4) -> ProxyResult<()> {
    if addr.ip().is_unspecified() || addr.port() == 0 {
        return Err(ProxyError::Header(format!("unroutable target {addr}")));
    }
    Ok(())
}

/// Read and decode a header, giving up after [`HEADER_TIMEOUT`].
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> ProxyResult<SocketAddrV4> {
    let mut header = [0u8; MUX_HEADER_LEN];
    match tokio::time::timeout(HEADER_TIMEOUT, reader.read_exact(&mut header)).await {
        Ok(read) => {
            read?;
        }
        Err(_) => {
            return Err(ProxyError::Header("timed out waiting for header".into()));
        }
    }
    unpack(&header)
}

/// Accepts mux connections and splices each to the container it names.
pub struct TcpMux {
    tls: Option<TlsAcceptor>,
}

impl TcpMux {
    pub fn new(tls: Option<TlsAcceptor>) -> Self {
        Self { tls }
    }

    /// Serve until shutdown; open connections are closed on the way out.
    pub async fn serve(&self, shutdown: Shutdown, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, tls = self.tls.is_some(), "mux listening");
        }
        accept_loop(shutdown, listener, self.tls.clone(), Arc::new(handle)).await;
        info!("mux stopped");
    }
}

async fn handle(mut client: BoxedStream, peer: SocketAddr, mut shutdown: Shutdown) {
    let target = match read_header(&mut client).await {
        Ok(target) => target,
        Err(e) => {
            warn!(%peer, error = %e, "rejecting mux connection");
            return;
        }
    };
    let backend = match dial::connect(&target.to_string()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, %target, error = %e, "mux could not reach container");
            return;
        }
    };
    debug!(%peer, %target, "mux connection established");
    splice(client, Box::new(backend), &mut shutdown).await;
}

/// True for accept errors caused by descriptor exhaustion.
pub(crate) fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::EMFILE || code == libc::ENFILE)
}
