//! Dial layer: how a front door reaches an export.
//!
//! An export on this host is dialed directly at its container address.
//! An export on another host is reached through that host's
//! multiplexer: connect to `HostIP:MuxPort` (optionally over TLS) and
//! send the 6-byte mux header naming the container address first.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use warpgrid_registry::ExportDetails;

use crate::error::{ProxyError, ProxyResult};
use crate::mux;
use crate::tls;

/// Any bidirectional byte stream the proxy can splice.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// This host's own IPv4 addresses, used to tell local exports from remote ones.
pub struct LocalAddrs {
    addrs: HashSet<IpAddr>,
}

impl LocalAddrs {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }

    /// Enumerate non-loopback IPv4 interface addresses.
    pub fn discover() -> ProxyResult<Self> {
        Ok(Self::new(interface_addrs()?))
    }

    pub fn contains(&self, ip: &str) -> bool {
        match ip.parse::<IpAddr>() {
            Ok(ip) => self.addrs.contains(&ip),
            Err(_) => false,
        }
    }

    pub fn addrs(&self) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = self.addrs.iter().copied().collect();
        out.sort();
        out
    }
}

impl FromIterator<IpAddr> for LocalAddrs {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        Self::new(iter)
    }
}

fn interface_addrs() -> ProxyResult<HashSet<IpAddr>> {
    let mut found = HashSet::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills `ifap` with a list we free below.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    let mut cursor = ifap;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned by getifaddrs.
        let ifa = unsafe { &*cursor };
        if !ifa.ifa_addr.is_null() {
            // SAFETY: non-null ifa_addr points at a sockaddr.
            let family = i32::from(unsafe { (*ifa.ifa_addr).sa_family });
            if family == libc::AF_INET {
                // SAFETY: AF_INET addresses are sockaddr_in.
                let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                if !ip.is_loopback() {
                    found.insert(IpAddr::V4(ip));
                }
            }
        }
        cursor = ifa.ifa_next;
    }
    // SAFETY: `ifap` came from a successful getifaddrs call.
    unsafe { libc::freeifaddrs(ifap) };

    if found.is_empty() {
        return Err(ProxyError::NoLocalAddress);
    }
    Ok(found)
}

/// Opens connections to exports.
pub struct Dialer {
    local: Arc<LocalAddrs>,
    connector: TlsConnector,
}

impl Dialer {
    pub fn new(local: Arc<LocalAddrs>) -> ProxyResult<Self> {
        Ok(Self {
            local,
            connector: tls::insecure_connector()?,
        })
    }

    /// True if the export runs on this host.
    pub fn is_local(&self, export: &ExportDetails) -> bool {
        self.local.contains(&export.host_ip)
    }

    /// Connect to an export, directly or through its host's multiplexer.
    pub async fn get_remote_connection(
        &self,
        use_tls: bool,
        export: &ExportDetails,
    ) -> ProxyResult<BoxedStream> {
        if export.private_ip.is_empty() {
            return Err(ProxyError::InvalidExport(format!(
                "{} has no private IP",
                export.application
            )));
        }

        if self.is_local(export) {
            let address = export.private_address();
            let stream = connect(&address).await?;
            debug!(address = %address, "dialed local export");
            return Ok(Box::new(stream));
        }

        let header = mux::pack_address(&export.private_address())?;
        let address = export.mux_address();
        let tcp = connect(&address).await?;
        let mut stream: BoxedStream = if use_tls {
            let name = ServerName::try_from(export.host_ip.clone())
                .map_err(|e| ProxyError::Tls(e.to_string()))?;
            Box::new(self.connector.connect(name, tcp).await?)
        } else {
            Box::new(tcp)
        };
        stream.write_all(&header).await?;
        debug!(mux = %address, target = %export.private_address(), tls = use_tls, "dialed export through mux");
        Ok(stream)
    }
}

/// TCP connect bounded by a fixed timeout.
pub(crate) async fn connect(address: &str) -> ProxyResult<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("connect to {address} timed out")).into()),
    }
}
