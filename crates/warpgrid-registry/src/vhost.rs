//! Virtual hosts: subdomains routed by the shared HTTP(S) front door.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use warpgrid_coord::{Connection, Listener, Shutdown};

use crate::paths;
use crate::types::{ExportDetails, VHost};
use crate::watcher::{self, ListenerState, Target};

/// Receives lifecycle calls for vhosts on this host.
#[async_trait]
pub trait VHostHandler: Send + Sync {
    async fn enable(&self, subdomain: &str);
    async fn disable(&self, subdomain: &str);
    async fn set(&self, subdomain: &str, exports: Vec<ExportDetails>);
}

struct VHostTarget {
    handler: Arc<dyn VHostHandler>,
    subdomain: String,
}

#[async_trait]
impl Target for VHostTarget {
    type Record = VHost;

    async fn enable(&self, _record: &VHost) {
        self.handler.enable(&self.subdomain).await;
    }

    async fn disable(&self) {
        self.handler.disable(&self.subdomain).await;
    }

    async fn set(&self, exports: Vec<ExportDetails>) {
        self.handler.set(&self.subdomain, exports).await;
    }
}

/// Watches `/net/vhost/<hostID>` and runs one state machine per subdomain.
pub struct VHostListener {
    conn: Arc<dyn Connection>,
    host_id: String,
    handler: Arc<dyn VHostHandler>,
}

impl VHostListener {
    pub fn new(
        conn: Arc<dyn Connection>,
        host_id: impl Into<String>,
        handler: Arc<dyn VHostHandler>,
    ) -> Self {
        Self {
            conn,
            host_id: host_id.into(),
            handler,
        }
    }

    pub async fn watch_vhost(&self, shutdown: Shutdown, subdomain: String) -> ListenerState {
        let path = paths::vhost(&self.host_id, &subdomain);
        let target = VHostTarget {
            handler: self.handler.clone(),
            subdomain,
        };
        watcher::run(shutdown, &*self.conn, &path, &target).await
    }
}

#[async_trait]
impl Listener for VHostListener {
    fn path(&self) -> String {
        paths::vhosts(&self.host_id)
    }

    async fn spawn(&self, shutdown: Shutdown, node: String) {
        let state = self.watch_vhost(shutdown, node.clone()).await;
        debug!(host = %self.host_id, vhost = %node, ?state, "vhost listener exited");
    }
}
