//! Export registration and tracking.
//!
//! Every running instance advertises each endpoint it exports as an
//! ephemeral, sequential node under
//! `/net/export/<tenantID>/<application>/`. Trackers watch that
//! directory and hand out complete snapshots of the live exports.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warpgrid_coord::path::join;
use warpgrid_coord::{
    Connection, CoordError, CoordResult, CreateMode, Shutdown, Watch, create_node, get_node,
    is_shutdown, shutdown_signalled,
};

use crate::error::RegistryResult;
use crate::paths;
use crate::types::ExportDetails;

/// Cached view of one application's export directory.
///
/// [`refresh`](Self::refresh) compares full membership against the
/// cache, so an instance replaced under the same count is still seen
/// as a change.
pub(crate) struct ExportCache {
    path: String,
    entries: BTreeMap<String, ExportDetails>,
    primed: bool,
}

impl ExportCache {
    pub(crate) fn new(path: String) -> Self {
        Self {
            path,
            entries: BTreeMap::new(),
            primed: false,
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// Point the cache at another directory; the next refresh always reports.
    pub(crate) fn retarget(&mut self, path: String) {
        self.path = path;
        self.reset();
    }

    /// Forget everything; the next refresh always reports.
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.primed = false;
    }

    /// Re-read the directory.
    ///
    /// Returns the full export list when membership changed (or on the
    /// first call after a reset), plus a watch for the next change.
    pub(crate) async fn refresh(
        &mut self,
        conn: &dyn Connection,
    ) -> CoordResult<(Option<Vec<ExportDetails>>, Watch)> {
        loop {
            let (found, exists_watch) = conn.exists_w(&self.path).await?;
            let (names, watch) = if found {
                match conn.children_w(&self.path).await {
                    Ok(listed) => listed,
                    Err(CoordError::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                }
            } else {
                (Vec::new(), exists_watch)
            };

            let names: BTreeSet<String> = names.into_iter().collect();
            let before = self.entries.len();
            self.entries.retain(|name, _| names.contains(name));
            let mut changed = !self.primed || self.entries.len() != before;

            for name in &names {
                if self.entries.contains_key(name) {
                    continue;
                }
                let child = join(&[self.path.as_str(), name.as_str()]);
                match get_node::<ExportDetails>(conn, &child).await {
                    Ok(details) => {
                        self.entries.insert(name.clone(), details);
                        changed = true;
                    }
                    // Gone between listing and reading; the watch will tell us.
                    Err(CoordError::NoNode(_)) => {}
                    Err(CoordError::Deserialize(e)) => {
                        warn!(path = %child, error = %e, "skipping unreadable export");
                    }
                    Err(e) => return Err(e),
                }
            }

            self.primed = true;
            let snapshot: Option<Vec<ExportDetails>> =
                changed.then(|| self.entries.values().cloned().collect());
            return Ok((snapshot, watch));
        }
    }
}

/// Advertise an export until `shutdown` fires.
///
/// The record is validated before anything is written. If the node
/// disappears while still registered, a new one is created. On
/// shutdown the node is removed and the call returns.
pub async fn register_export(
    mut shutdown: Shutdown,
    conn: Arc<dyn Connection>,
    tenant_id: String,
    details: ExportDetails,
) -> RegistryResult<()> {
    details.validate()?;
    let prefix = format!(
        "{}/",
        paths::exports_for_application(&tenant_id, &details.application)
    );

    while !is_shutdown(&shutdown) {
        let node = create_node(&*conn, &prefix, &details, CreateMode::EphemeralSequential).await?;
        info!(
            tenant = %tenant_id,
            application = %details.application,
            node = %node,
            "export registered"
        );

        let vanished = loop {
            let (found, watch) = conn.exists_w(&node).await?;
            if !found {
                break true;
            }
            tokio::select! {
                _ = watch => {}
                _ = shutdown_signalled(&mut shutdown) => break false,
            }
        };

        if vanished {
            warn!(node = %node, "export node vanished, registering again");
            continue;
        }
        match conn.delete(&node).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(node = %node, "export unregistered");
    }
    Ok(())
}

/// Stream snapshots of an application's live exports.
///
/// The first snapshot is sent immediately (empty if the application
/// has never exported). After that a snapshot is sent whenever the set
/// of exports changes. The channel closes on shutdown or failure.
pub fn track_exports(
    mut shutdown: Shutdown,
    conn: Arc<dyn Connection>,
    tenant_id: &str,
    application: &str,
) -> mpsc::Receiver<Vec<ExportDetails>> {
    let (tx, rx) = mpsc::channel(8);
    let path = paths::exports_for_application(tenant_id, application);

    tokio::spawn(async move {
        let mut cache = ExportCache::new(path);
        loop {
            let (changed, watch) = match cache.refresh(&*conn).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    warn!(path = %cache.path(), error = %e, "export tracking stopped");
                    return;
                }
            };
            if let Some(exports) = changed {
                debug!(path = %cache.path(), count = exports.len(), "exports changed");
                if tx.send(exports).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = watch => {}
                _ = tx.closed() => return,
                _ = shutdown_signalled(&mut shutdown) => return,
            }
        }
    });

    rx
}

/// Remove every export a tenant has advertised.
pub async fn delete_exports(conn: &dyn Connection, tenant_id: &str) -> RegistryResult<()> {
    match conn.delete(&paths::exports_for_tenant(tenant_id)).await {
        Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use warpgrid_coord::{MemoryStore, encode};

    use super::*;

    fn export(private_ip: &str) -> ExportDetails {
        ExportDetails {
            application: "app1".into(),
            protocol: "tcp".into(),
            port_number: 8080,
            host_ip: "10.0.0.5".into(),
            private_ip: private_ip.into(),
            mux_port: 22250,
            instance_id: 0,
            version: None,
        }
    }

    #[tokio::test]
    async fn first_refresh_reports_even_when_empty() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let mut cache = ExportCache::new("/net/export/t1/app1".into());

        let (changed, _) = cache.refresh(&*conn).await.unwrap();
        assert_eq!(changed, Some(vec![]));

        let (changed, _) = cache.refresh(&*conn).await.unwrap();
        assert_eq!(changed, None);
    }

    #[tokio::test]
    async fn replacement_under_same_count_is_a_change() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let dir = "/net/export/t1/app1";
        conn.create(&format!("{dir}/a"), encode(&export("172.17.0.2")).unwrap(), CreateMode::Persistent)
            .await
            .unwrap();

        let mut cache = ExportCache::new(dir.into());
        let (first, _) = cache.refresh(&*conn).await.unwrap();
        assert_eq!(first.unwrap().len(), 1);

        conn.delete(&format!("{dir}/a")).await.unwrap();
        conn.create(&format!("{dir}/b"), encode(&export("172.17.0.3")).unwrap(), CreateMode::Persistent)
            .await
            .unwrap();

        let (second, _) = cache.refresh(&*conn).await.unwrap();
        let second = second.expect("membership changed");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].private_ip, "172.17.0.3");
    }

    #[tokio::test]
    async fn unreadable_exports_are_skipped() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let dir = "/net/export/t1/app1";
        conn.create(&format!("{dir}/bad"), b"not json".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let mut cache = ExportCache::new(dir.into());
        let (changed, _) = cache.refresh(&*conn).await.unwrap();
        assert_eq!(changed, Some(vec![]));
    }

    #[tokio::test]
    async fn invalid_export_writes_nothing() {
        let store = MemoryStore::new();
        let conn: Arc<dyn Connection> = store.connect();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let mut bad = export("172.17.0.2");
        bad.port_number = 0;
        let err = register_export(rx, conn.clone(), "t1".into(), bad).await;
        assert!(err.is_err());
        assert!(!conn.exists("/net/export").await.unwrap());
    }

    #[tokio::test]
    async fn delete_exports_tolerates_missing_tenant() {
        let store = MemoryStore::new();
        let conn = store.connect();
        delete_exports(&*conn, "nobody").await.unwrap();
    }
}
