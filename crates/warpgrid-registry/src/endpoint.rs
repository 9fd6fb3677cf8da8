//! Endpoint registry: `/endpoints/<tenantID_endpointID>/<hostID_containerID>`.

use std::sync::Arc;

use tracing::debug;
use warpgrid_coord::{Connection, CoordError, CreateMode, create_node, get_node};

use crate::error::RegistryResult;
use crate::paths::{self, ENDPOINT_ROOT};
use crate::records::upsert;
use crate::types::{EndpointNode, KeyNode};

/// Typed access to the endpoint tree of one coordination store.
pub struct EndpointRegistry {
    conn: Arc<dyn Connection>,
}

impl EndpointRegistry {
    /// Open the registry, creating `/endpoints` if needed.
    pub async fn create(conn: Arc<dyn Connection>) -> RegistryResult<Self> {
        conn.create_dir(ENDPOINT_ROOT).await?;
        Ok(Self { conn })
    }

    /// Make sure a key exists; a new key is marked local.
    pub async fn ensure_key(&self, key: &str) -> RegistryResult<()> {
        let node = KeyNode {
            id: key.to_string(),
            is_remote: false,
            version: None,
        };
        match create_node(&*self.conn, &paths::endpoint_key(key), &node, CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create or update an endpoint. Returns `false` if nothing changed.
    pub async fn set_item(&self, node: &EndpointNode) -> RegistryResult<bool> {
        node.validate()?;
        let key = paths::tenant_endpoint_key(&node.tenant_id, &node.endpoint_id);
        let item = paths::host_container_key(&node.host_id, &node.container_id);
        self.ensure_key(&key).await?;
        let written = upsert(&*self.conn, &paths::endpoint_item(&key, &item), node).await?;
        if written {
            debug!(key = %key, item = %item, "endpoint written");
        }
        Ok(written)
    }

    pub async fn get_item(
        &self,
        tenant_id: &str,
        endpoint_id: &str,
        host_id: &str,
        container_id: &str,
    ) -> RegistryResult<EndpointNode> {
        let path = paths::endpoint_item(
            &paths::tenant_endpoint_key(tenant_id, endpoint_id),
            &paths::host_container_key(host_id, container_id),
        );
        Ok(get_node(&*self.conn, &path).await?)
    }

    /// All endpoints under a tenant endpoint key; empty if the key is absent.
    pub async fn get_children(&self, tenant_id: &str, endpoint_id: &str) -> RegistryResult<Vec<EndpointNode>> {
        self.items(&paths::tenant_endpoint_key(tenant_id, endpoint_id)).await
    }

    /// All endpoints of one service across every endpoint key of its tenant.
    pub async fn get_service_endpoints(
        &self,
        tenant_id: &str,
        service_id: &str,
    ) -> RegistryResult<Vec<EndpointNode>> {
        let prefix = format!("{tenant_id}_");
        let mut out = Vec::new();
        for key in self.conn.children(ENDPOINT_ROOT).await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            out.extend(
                self.items(&key)
                    .await?
                    .into_iter()
                    .filter(|e| e.service_id == service_id),
            );
        }
        Ok(out)
    }

    pub async fn remove_item(
        &self,
        tenant_id: &str,
        endpoint_id: &str,
        host_id: &str,
        container_id: &str,
    ) -> RegistryResult<()> {
        let path = paths::endpoint_item(
            &paths::tenant_endpoint_key(tenant_id, endpoint_id),
            &paths::host_container_key(host_id, container_id),
        );
        match self.conn.delete(&path).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_tenant_endpoint_key(&self, tenant_id: &str, endpoint_id: &str) -> RegistryResult<()> {
        let path = paths::endpoint_key(&paths::tenant_endpoint_key(tenant_id, endpoint_id));
        match self.conn.delete(&path).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn items(&self, key: &str) -> RegistryResult<Vec<EndpointNode>> {
        let names = match self.conn.children(&paths::endpoint_key(key)).await {
            Ok(names) => names,
            Err(CoordError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match get_node(&*self.conn, &paths::endpoint_item(key, &name)).await {
                Ok(node) => out.push(node),
                Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}
