//! Cross-cluster key synchronizer.
//!
//! Mirrors `/endpoints/<key>/<item>` from a remote store into the local
//! one. Keys created by the mirror are flagged `IsRemote`; a key that
//! exists locally without that flag and already has items belongs to
//! this cluster and is never overwritten.
//!
//! # Architecture
//!
//! A pass reconciles one level at a time through a [`SyncHandler`]:
//! [`KeySynchronizer`] for the key level, then one
//! [`EndpointSynchronizer`] per key that was accepted. Repeating passes
//! converges on a fixed point; a pass over an unchanged remote writes
//! nothing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use warpgrid_coord::path::join;
use warpgrid_coord::{
    Connection, CoordError, CreateMode, NodeData, Shutdown, create_node, decode, get_node,
    next_event, set_node, shutdown_signalled,
};

use crate::error::{RegistryError, RegistryResult};
use crate::paths::{self, ENDPOINT_ROOT};
use crate::records::upsert;
use crate::types::{EndpointNode, KeyNode};

/// One level of the mirrored tree.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Local ids this handler owns and may delete.
    async fn get_all(&self) -> RegistryResult<Vec<String>>;

    /// Mirror one remote node. Returns `true` if anything was written.
    async fn add_update(&self, id: &str, remote: NodeData) -> RegistryResult<bool>;

    async fn delete(&self, id: &str) -> RegistryResult<()>;
}

/// Key level: `/endpoints/<key>`.
pub struct KeySynchronizer {
    local: Arc<dyn Connection>,
}

impl KeySynchronizer {
    pub fn new(local: Arc<dyn Connection>) -> Self {
        Self { local }
    }
}

#[async_trait]
impl SyncHandler for KeySynchronizer {
    async fn get_all(&self) -> RegistryResult<Vec<String>> {
        let keys = match self.local.children(ENDPOINT_ROOT).await {
            Ok(keys) => keys,
            Err(CoordError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut remote = Vec::new();
        for key in keys {
            match get_node::<KeyNode>(&*self.local, &paths::endpoint_key(&key)).await {
                Ok(node) if node.is_remote => remote.push(key),
                Ok(_) | Err(CoordError::NoNode(_)) | Err(CoordError::Deserialize(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(remote)
    }

    async fn add_update(&self, id: &str, _remote: NodeData) -> RegistryResult<bool> {
        let path = paths::endpoint_key(id);
        let mut node = match get_node::<KeyNode>(&*self.local, &path).await {
            Ok(node) => node,
            Err(CoordError::NoNode(_)) => {
                let node = KeyNode {
                    id: id.to_string(),
                    is_remote: true,
                    version: None,
                };
                create_node(&*self.local, &path, &node, CreateMode::Persistent).await?;
                debug!(key = %id, "mirrored key created");
                return Ok(true);
            }
            // A bare directory; treat it as an unflagged local key.
            Err(CoordError::Deserialize(_)) => {
                let version = self.local.get(&path).await?.version;
                KeyNode {
                    id: id.to_string(),
                    is_remote: false,
                    version: Some(version),
                }
            }
            Err(e) => return Err(e.into()),
        };

        if node.is_remote {
            return Ok(false);
        }
        let children = self.local.children(&path).await?.len();
        if children > 0 {
            return Err(RegistryError::Conflict {
                key: id.to_string(),
                children,
            });
        }
        node.id = id.to_string();
        node.is_remote = true;
        set_node(&*self.local, &path, &mut node).await?;
        debug!(key = %id, "local key taken over by mirror");
        Ok(true)
    }

    async fn delete(&self, id: &str) -> RegistryResult<()> {
        match self.local.delete(&paths::endpoint_key(id)).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Item level: `/endpoints/<key>/<item>` for one key.
pub struct EndpointSynchronizer {
    local: Arc<dyn Connection>,
    key: String,
}

impl EndpointSynchronizer {
    pub fn new(local: Arc<dyn Connection>, key: impl Into<String>) -> Self {
        Self {
            local,
            key: key.into(),
        }
    }
}

#[async_trait]
impl SyncHandler for EndpointSynchronizer {
    async fn get_all(&self) -> RegistryResult<Vec<String>> {
        match self.local.children(&paths::endpoint_key(&self.key)).await {
            Ok(items) => Ok(items),
            Err(CoordError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_update(&self, id: &str, remote: NodeData) -> RegistryResult<bool> {
        let node: EndpointNode = decode(remote)?;
        let written = upsert(&*self.local, &paths::endpoint_item(&self.key, id), &node).await?;
        Ok(written)
    }

    async fn delete(&self, id: &str) -> RegistryResult<()> {
        match self.local.delete(&paths::endpoint_item(&self.key, id)).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of one synchronization pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Nodes created or overwritten locally.
    pub written: usize,
    /// Local nodes removed because they vanished remotely.
    pub removed: usize,
    /// Keys skipped because a local key with items already exists.
    pub conflicts: Vec<(String, usize)>,
}

/// Reconcile one level; returns the remote ids that were accepted.
async fn reconcile(
    handler: &dyn SyncHandler,
    remote: &dyn Connection,
    remote_path: &str,
    report: &mut SyncReport,
) -> RegistryResult<Vec<String>> {
    let ids = match remote.children(remote_path).await {
        Ok(ids) => ids,
        Err(CoordError::NoNode(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let mut accepted = Vec::with_capacity(ids.len());
    for id in &ids {
        let data = match remote.get(&join(&[remote_path, id.as_str()])).await {
            Ok(data) => data,
            Err(CoordError::NoNode(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        match handler.add_update(id, data).await {
            Ok(written) => {
                report.written += usize::from(written);
                accepted.push(id.clone());
            }
            Err(RegistryError::Conflict { key, children }) => {
                warn!(key = %key, children, "key exists locally, not mirroring");
                report.conflicts.push((key, children));
            }
            Err(RegistryError::Coord(CoordError::Deserialize(e))) => {
                warn!(path = %remote_path, id = %id, error = %e, "skipping unreadable remote node");
            }
            Err(e) => return Err(e),
        }
    }

    let remote_ids: HashSet<&String> = ids.iter().collect();
    for local in handler.get_all().await? {
        if !remote_ids.contains(&local) {
            handler.delete(&local).await?;
            report.removed += 1;
        }
    }
    Ok(accepted)
}

/// Drives key and item synchronization between two stores.
pub struct Synchronizer {
    remote: Arc<dyn Connection>,
    local: Arc<dyn Connection>,
}

impl Synchronizer {
    pub fn new(remote: Arc<dyn Connection>, local: Arc<dyn Connection>) -> Self {
        Self { remote, local }
    }

    /// Run one full pass.
    pub async fn sync_once(&self) -> RegistryResult<SyncReport> {
        self.local.create_dir(ENDPOINT_ROOT).await?;
        let mut report = SyncReport::default();

        let keys = KeySynchronizer::new(self.local.clone());
        let accepted = reconcile(&keys, &*self.remote, ENDPOINT_ROOT, &mut report).await?;

        for key in accepted {
            let items = EndpointSynchronizer::new(self.local.clone(), key.clone());
            reconcile(&items, &*self.remote, &paths::endpoint_key(&key), &mut report).await?;
        }
        Ok(report)
    }

    /// Repeat passes every `interval` and whenever the remote key set
    /// changes, until shutdown.
    pub async fn run(&self, mut shutdown: Shutdown, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "endpoint synchronizer started");
        loop {
            let mut watch = match self.remote.children_w(ENDPOINT_ROOT).await {
                Ok((_, watch)) => Some(watch),
                Err(CoordError::NoNode(_)) => self.remote.exists_w(ENDPOINT_ROOT).await.ok().map(|(_, w)| w),
                Err(e) => {
                    warn!(error = %e, "could not watch remote endpoints");
                    None
                }
            };

            match self.sync_once().await {
                Ok(report) if report != SyncReport::default() => {
                    info!(
                        written = report.written,
                        removed = report.removed,
                        conflicts = report.conflicts.len(),
                        "endpoint sync pass"
                    );
                }
                Ok(_) => debug!("endpoint sync pass, no changes"),
                Err(e) => warn!(error = %e, "endpoint sync pass failed"),
            }

            tokio::select! {
                _ = next_event(&mut watch) => {}
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
        info!("endpoint synchronizer stopped");
    }
}

#[cfg(test)]
mod tests {
    use warpgrid_coord::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn unflagged_key_with_items_is_a_conflict() {
        let store = MemoryStore::new();
        let local: Arc<dyn Connection> = store.connect();
        let owned = KeyNode {
            id: "t1_db".into(),
            is_remote: false,
            version: None,
        };
        create_node(&*local, "/endpoints/t1_db", &owned, CreateMode::Persistent)
            .await
            .unwrap();
        local
            .create("/endpoints/t1_db/h_c", b"{}".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let keys = KeySynchronizer::new(local.clone());
        let data = NodeData {
            data: vec![],
            version: 0,
        };
        let err = keys.add_update("t1_db", data).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot update t1_db: found 1 local items");
    }

    #[tokio::test]
    async fn empty_local_key_is_taken_over() {
        let store = MemoryStore::new();
        let local: Arc<dyn Connection> = store.connect();
        local
            .create("/endpoints/t1_db", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        let keys = KeySynchronizer::new(local.clone());
        let data = NodeData {
            data: vec![],
            version: 0,
        };
        assert!(keys.add_update("t1_db", data.clone()).await.unwrap());
        assert!(!keys.add_update("t1_db", data).await.unwrap());
        assert_eq!(keys.get_all().await.unwrap(), vec!["t1_db".to_string()]);
    }
}
