//! warpgrid-registry: the network registry hosts route by.
//!
//! Running instances advertise their exports; routing records (public
//! ports and vhosts) name which application a host should front. This
//! crate keeps those two sides connected.
//!
//! # Components
//!
//! - **export**: `register_export` / `track_exports` over
//!   `/net/export/<tenant>/<application>/<seq>`
//! - **import**: regex matching of exporting applications
//! - **public / vhost**: per-record state machines that drive a
//!   `PublicPortHandler` or `VHostHandler`
//! - **records**: routing record reads, writes and per-service sync
//! - **endpoint / sync**: endpoint tree and its cross-cluster mirror

pub mod endpoint;
pub mod error;
pub mod export;
pub mod import;
pub mod paths;
pub mod public;
pub mod records;
pub mod sync;
pub mod types;
pub mod vhost;
mod watcher;

pub use endpoint::EndpointRegistry;
pub use error::{RegistryError, RegistryResult};
pub use export::{delete_exports, register_export, track_exports};
pub use import::ImportListener;
pub use public::{PublicPortHandler, PublicPortListener};
pub use records::{get_public_port, get_vhost, put_public_port, put_vhost, sync_service_registry};
pub use sync::{EndpointSynchronizer, KeySynchronizer, SyncHandler, SyncReport, Synchronizer};
pub use types::{EndpointNode, ExportDetails, KeyNode, PublicPort, PublicPortKey, VHost, VHostKey};
pub use vhost::{VHostHandler, VHostListener};
pub use watcher::ListenerState;
