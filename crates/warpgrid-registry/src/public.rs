//! Public ports: host ports that front an application.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use warpgrid_coord::{Connection, Listener, Shutdown};

use crate::paths;
use crate::types::{ExportDetails, PublicPort};
use crate::watcher::{self, ListenerState, Target};

/// Receives lifecycle calls for public ports on this host.
#[async_trait]
pub trait PublicPortHandler: Send + Sync {
    /// Start serving `port` for the given protocol.
    async fn enable(&self, port: &str, protocol: &str, use_tls: bool);

    /// Stop serving `port`.
    async fn disable(&self, port: &str);

    /// Replace the exports `port` routes to.
    async fn set(&self, port: &str, exports: Vec<ExportDetails>);
}

struct PortTarget {
    handler: Arc<dyn PublicPortHandler>,
    port: String,
}

#[async_trait]
impl Target for PortTarget {
    type Record = PublicPort;

    async fn enable(&self, record: &PublicPort) {
        self.handler
            .enable(&self.port, &record.protocol, record.use_tls)
            .await;
    }

    async fn disable(&self) {
        self.handler.disable(&self.port).await;
    }

    async fn set(&self, exports: Vec<ExportDetails>) {
        self.handler.set(&self.port, exports).await;
    }
}

/// Watches `/net/pub/<hostID>` and runs one state machine per port.
pub struct PublicPortListener {
    conn: Arc<dyn Connection>,
    host_id: String,
    handler: Arc<dyn PublicPortHandler>,
}

impl PublicPortListener {
    pub fn new(
        conn: Arc<dyn Connection>,
        host_id: impl Into<String>,
        handler: Arc<dyn PublicPortHandler>,
    ) -> Self {
        Self {
            conn,
            host_id: host_id.into(),
            handler,
        }
    }

    /// Run the state machine of a single port until it ends.
    pub async fn watch_port(&self, shutdown: Shutdown, port: String) -> ListenerState {
        let path = paths::public_port(&self.host_id, &port);
        let target = PortTarget {
            handler: self.handler.clone(),
            port,
        };
        watcher::run(shutdown, &*self.conn, &path, &target).await
    }
}

#[async_trait]
impl Listener for PublicPortListener {
    fn path(&self) -> String {
        paths::public_ports(&self.host_id)
    }

    async fn spawn(&self, shutdown: Shutdown, node: String) {
        let state = self.watch_port(shutdown, node.clone()).await;
        debug!(host = %self.host_id, port = %node, ?state, "public port listener exited");
    }
}
