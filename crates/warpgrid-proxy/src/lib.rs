//! WarpGrid front door: public ports, vhosts, and the host multiplexer.
//!
//! Traffic from outside enters a host through a public port or the
//! shared vhost listener, is assigned an export round-robin, and is
//! forwarded either straight to a local container or through the
//! owning host's multiplexer.
//!
//! # Components
//!
//! - **`round_robin`**: shuffled round-robin pool of exports
//! - **`dial`**: local address table and the direct/mux dialer
//! - **`mux`**: 6-byte mux header codec and the `TcpMux` server
//! - **`reverse`**: HTTP reverse proxies, cached per backend
//! - **`public`**: `PublicPortManager`, the public port handler
//! - **`vhost`**: `VHostManager`, the vhost handler and front door
//! - **`tls`**: listener certificates and the mux client connector

pub mod dial;
pub mod error;
mod front;
pub mod mux;
pub mod public;
pub mod reverse;
pub mod round_robin;
pub mod tls;
pub mod vhost;

pub use dial::{BoxedStream, Dialer, LocalAddrs};
pub use error::{ProxyError, ProxyResult};
pub use mux::{DEFAULT_MUX_PORT, TcpMux};
pub use public::{FailureCallback, PublicPortManager};
pub use reverse::{ProxyCache, ReverseProxy};
pub use round_robin::RoundRobinExports;
pub use tls::TlsMaterial;
pub use vhost::VHostManager;
