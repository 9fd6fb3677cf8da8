//! The routing-record state machine shared by public ports and vhosts.
//!
//! # States
//!
//! - `Disabled`: record present, `Enabled == false`, nothing tracked
//! - `Enabled`: handler enabled, exports of the target application tracked
//! - `NoNode`: record deleted; terminal
//!
//! A record that cannot be decoded parks the machine in `Disabled`
//! until the node is written again.
//!
//! Each pass re-reads the record first and only then looks at exports,
//! so a data change and an export change that arrive together are
//! handled in one pass. Whatever ends the loop, an enabled handler is
//! disabled exactly once on the way out.

use async_trait::async_trait;
use tracing::{debug, error, warn};
use warpgrid_coord::{
    Connection, CoordError, Node, Shutdown, get_node_w, next_event, shutdown_signalled,
};

use crate::export::ExportCache;
use crate::paths;
use crate::types::{ExportDetails, PublicPort, VHost};

/// Where a routing record is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disabled,
    Enabled,
    NoNode,
}

/// Fields of a routing record the state machine acts on.
pub(crate) trait Routed: Node {
    fn enabled(&self) -> bool;
    fn tenant_id(&self) -> &str;
    fn application(&self) -> &str;
}

impl Routed for PublicPort {
    fn enabled(&self) -> bool {
        self.enabled
    }
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn application(&self) -> &str {
        &self.application
    }
}

impl Routed for VHost {
    fn enabled(&self) -> bool {
        self.enabled
    }
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn application(&self) -> &str {
        &self.application
    }
}

/// Adapter from one record to its handler.
#[async_trait]
pub(crate) trait Target: Send + Sync {
    type Record: Routed;

    async fn enable(&self, record: &Self::Record);
    async fn disable(&self);
    async fn set(&self, exports: Vec<ExportDetails>);
}

/// Run the state machine for the record at `path` until it is deleted,
/// an unrecoverable store error occurs, or shutdown fires.
pub(crate) async fn run<T: Target>(
    mut shutdown: Shutdown,
    conn: &dyn Connection,
    path: &str,
    target: &T,
) -> ListenerState {
    let mut state = ListenerState::Disabled;
    let mut exports: Option<ExportCache> = None;

    let last = loop {
        let (record, mut record_watch) = match get_node_w::<T::Record>(conn, path).await {
            Ok(found) => found,
            Err(CoordError::NoNode(_)) => {
                debug!(path, "routing record deleted");
                break ListenerState::NoNode;
            }
            Err(CoordError::Deserialize(e)) => {
                warn!(path, error = %e, "unreadable routing record, waiting for a rewrite");
                if state == ListenerState::Enabled {
                    target.disable().await;
                    state = ListenerState::Disabled;
                    exports = None;
                }
                let rewritten = match conn.exists_w(path).await {
                    Ok((_, watch)) => watch,
                    Err(e) => {
                        error!(path, error = %e, "could not watch routing record");
                        break state;
                    }
                };
                tokio::select! {
                    _ = rewritten => continue,
                    _ = shutdown_signalled(&mut shutdown) => break state,
                }
            }
            Err(e) => {
                error!(path, error = %e, "could not read routing record");
                break state;
            }
        };

        if record.enabled() && state == ListenerState::Disabled {
            debug!(path, "enabling");
            target.enable(&record).await;
            state = ListenerState::Enabled;
        } else if !record.enabled() && state == ListenerState::Enabled {
            debug!(path, "disabling");
            target.disable().await;
            state = ListenerState::Disabled;
            exports = None;
        }

        let mut export_watch = None;
        if state == ListenerState::Enabled {
            let wanted = paths::exports_for_application(record.tenant_id(), record.application());
            let cache = exports.get_or_insert_with(|| ExportCache::new(wanted.clone()));
            if cache.path() != wanted {
                debug!(path, exports = %wanted, "routing target changed");
                cache.retarget(wanted);
            }
            match cache.refresh(conn).await {
                Ok((changed, watch)) => {
                    if let Some(list) = changed {
                        debug!(path, count = list.len(), "pushing exports");
                        target.set(list).await;
                    }
                    export_watch = Some(watch);
                }
                Err(e) => {
                    error!(path, error = %e, "could not track exports");
                    break state;
                }
            }
        }

        tokio::select! {
            _ = &mut record_watch => {}
            _ = next_event(&mut export_watch) => {}
            _ = shutdown_signalled(&mut shutdown) => break state,
        }
    };

    if state == ListenerState::Enabled {
        target.disable().await;
    }
    last
}
