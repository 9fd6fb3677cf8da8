//! Routing record CRUD.
//!
//! Public port and vhost records are written by whoever owns service
//! definitions; hosts only read them. [`sync_service_registry`] rewrites
//! every record belonging to one service in a single transaction.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use warpgrid_coord::path::join;
use warpgrid_coord::{Connection, CoordError, CoordResult, CreateMode, Node, Op, encode, decode, get_node};

use crate::error::{RegistryError, RegistryResult};
use crate::paths;
use crate::types::{PublicPort, PublicPortKey, VHost, VHostKey};

/// Create a node or overwrite it at its current version, retrying on races.
///
/// Returns `false` when the stored bytes already matched.
pub(crate) async fn upsert<N: Node>(conn: &dyn Connection, path: &str, node: &N) -> CoordResult<bool> {
    let data = encode(node)?;
    loop {
        match conn.get(path).await {
            Ok(current) => {
                if current.data == data {
                    return Ok(false);
                }
                match conn.set(path, data.clone(), Some(current.version)).await {
                    Ok(_) => return Ok(true),
                    Err(CoordError::BadVersion(_)) | Err(CoordError::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(CoordError::NoNode(_)) => {
                match conn.create(path, data.clone(), CreateMode::Persistent).await {
                    Ok(_) => return Ok(true),
                    Err(CoordError::NodeExists(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn lookup_error(path: String, e: CoordError) -> RegistryError {
    RegistryError::Lookup {
        action: "get",
        path,
        message: e.to_string(),
    }
}

pub async fn get_public_port(conn: &dyn Connection, key: &PublicPortKey) -> RegistryResult<PublicPort> {
    let path = paths::public_port(&key.host_id, &key.port_address);
    get_node(conn, &path).await.map_err(|e| lookup_error(path, e))
}

pub async fn get_vhost(conn: &dyn Connection, key: &VHostKey) -> RegistryResult<VHost> {
    let path = paths::vhost(&key.host_id, &key.subdomain);
    get_node(conn, &path).await.map_err(|e| lookup_error(path, e))
}

/// Validate and write a single public port record.
pub async fn put_public_port(
    conn: &dyn Connection,
    key: &PublicPortKey,
    port: &PublicPort,
) -> RegistryResult<()> {
    port.validate()?;
    upsert(conn, &paths::public_port(&key.host_id, &key.port_address), port).await?;
    Ok(())
}

/// Validate and write a single vhost record.
pub async fn put_vhost(conn: &dyn Connection, key: &VHostKey, vhost: &VHost) -> RegistryResult<()> {
    vhost.validate()?;
    upsert(conn, &paths::vhost(&key.host_id, &key.subdomain), vhost).await?;
    Ok(())
}

/// Every `<root>/<host>/<name>` record, keyed by `(host, name)`.
async fn list_records<N: Node>(
    conn: &dyn Connection,
    root: &str,
) -> CoordResult<BTreeMap<(String, String), N>> {
    let mut out = BTreeMap::new();
    let hosts = match conn.children(root).await {
        Ok(hosts) => hosts,
        Err(CoordError::NoNode(_)) => return Ok(out),
        Err(e) => return Err(e),
    };
    for host in hosts {
        let names = match conn.children(&join(&[root, host.as_str()])).await {
            Ok(names) => names,
            Err(CoordError::NoNode(_)) => continue,
            Err(e) => return Err(e),
        };
        for name in names {
            let path = join(&[root, host.as_str(), name.as_str()]);
            match conn.get(&path).await {
                Ok(raw) => match decode::<N>(raw) {
                    Ok(record) => {
                        out.insert((host.clone(), name), record);
                    }
                    Err(e) => warn!(path = %path, error = %e, "skipping unreadable record"),
                },
                Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(out)
}

/// Records that belong to a service.
trait ServiceOwned: Node {
    fn service_id(&self) -> &str;
}

impl ServiceOwned for PublicPort {
    fn service_id(&self) -> &str {
        &self.service_id
    }
}

impl ServiceOwned for VHost {
    fn service_id(&self) -> &str {
        &self.service_id
    }
}

/// Build the ops that make `wanted` the complete set of records owned by `service_id`.
fn plan<N: ServiceOwned>(
    ops: &mut Vec<Op>,
    service_id: &str,
    existing: &BTreeMap<(String, String), N>,
    wanted: BTreeMap<(String, String), &N>,
    path_of: impl Fn(&str, &str) -> String,
) -> CoordResult<()> {
    for ((host, name), current) in existing {
        if current.service_id() == service_id && !wanted.contains_key(&(host.clone(), name.clone())) {
            ops.push(Op::Delete {
                path: path_of(host, name),
            });
        }
    }
    for ((host, name), record) in wanted {
        let path = path_of(&host, &name);
        let data = encode(record)?;
        match existing.get(&(host, name)) {
            Some(current) => ops.push(Op::Set {
                path,
                data,
                version: current.version(),
            }),
            None => ops.push(Op::Create { path, data }),
        }
    }
    Ok(())
}

/// Atomically replace all public port and vhost records of a service.
///
/// Records in the maps are created or overwritten; records the service
/// owned before but that are missing from the maps are deleted. Nothing
/// is written if any record fails validation or the transaction fails.
pub async fn sync_service_registry(
    conn: &dyn Connection,
    service_id: &str,
    pubs: &BTreeMap<PublicPortKey, PublicPort>,
    vhosts: &BTreeMap<VHostKey, VHost>,
) -> RegistryResult<()> {
    for port in pubs.values() {
        port.validate()?;
    }
    for vhost in vhosts.values() {
        vhost.validate()?;
    }

    let existing_pubs = list_records::<PublicPort>(conn, paths::PUBLIC_PORT_ROOT).await?;
    let existing_vhosts = list_records::<VHost>(conn, paths::VHOST_ROOT).await?;

    let mut ops = Vec::new();
    plan(
        &mut ops,
        service_id,
        &existing_pubs,
        pubs.iter()
            .map(|(k, v)| ((k.host_id.clone(), k.port_address.clone()), v))
            .collect(),
        paths::public_port,
    )?;
    plan(
        &mut ops,
        service_id,
        &existing_vhosts,
        vhosts
            .iter()
            .map(|(k, v)| ((k.host_id.clone(), k.subdomain.clone()), v))
            .collect(),
        paths::vhost,
    )?;

    if ops.is_empty() {
        return Ok(());
    }
    debug!(service = %service_id, ops = ops.len(), "syncing service registry");
    conn.commit(ops).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use warpgrid_coord::MemoryStore;

    use super::*;

    fn port(service: &str, application: &str) -> PublicPort {
        PublicPort {
            tenant_id: "t1".into(),
            application: application.into(),
            service_id: service.into(),
            enabled: true,
            protocol: "tcp".into(),
            use_tls: false,
            version: None,
        }
    }

    fn port_key(host: &str, addr: &str) -> PublicPortKey {
        PublicPortKey {
            host_id: host.into(),
            port_address: addr.into(),
        }
    }

    #[tokio::test]
    async fn missing_record_is_a_lookup_error() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let err = get_public_port(&*conn, &port_key("hostA", ":9000"))
            .await
            .unwrap_err();
        assert!(
            err.to_string().starts_with("could not get path /net/pub/hostA/:9000"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn put_then_get_round_trips_with_version() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let key = port_key("hostA", ":9000");
        put_public_port(&*conn, &key, &port("svc1", "app1")).await.unwrap();
        put_public_port(&*conn, &key, &port("svc1", "app2")).await.unwrap();
        let got = get_public_port(&*conn, &key).await.unwrap();
        assert_eq!(got.application, "app2");
        assert_eq!(got.version, Some(1));
    }

    #[tokio::test]
    async fn sync_replaces_only_the_services_records() {
        let store = MemoryStore::new();
        let conn = store.connect();
        put_public_port(&*conn, &port_key("hostA", ":1000"), &port("svc1", "old"))
            .await
            .unwrap();
        put_public_port(&*conn, &port_key("hostA", ":2000"), &port("svc2", "other"))
            .await
            .unwrap();
        put_public_port(&*conn, &port_key("hostB", ":3000"), &port("svc1", "keep"))
            .await
            .unwrap();

        let mut pubs = BTreeMap::new();
        pubs.insert(port_key("hostB", ":3000"), port("svc1", "kept"));
        pubs.insert(port_key("hostB", ":4000"), port("svc1", "new"));
        let mut vhosts = BTreeMap::new();
        vhosts.insert(
            VHostKey {
                host_id: "hostA".into(),
                subdomain: "www".into(),
            },
            VHost {
                tenant_id: "t1".into(),
                application: "web".into(),
                service_id: "svc1".into(),
                enabled: true,
                version: None,
            },
        );

        sync_service_registry(&*conn, "svc1", &pubs, &vhosts).await.unwrap();

        assert!(!conn.exists("/net/pub/hostA/:1000").await.unwrap());
        assert!(conn.exists("/net/pub/hostA/:2000").await.unwrap());
        let kept = get_public_port(&*conn, &port_key("hostB", ":3000")).await.unwrap();
        assert_eq!(kept.application, "kept");
        assert!(conn.exists("/net/pub/hostB/:4000").await.unwrap());
        assert!(conn.exists("/net/vhost/hostA/www").await.unwrap());
    }

    #[tokio::test]
    async fn sync_rejects_invalid_records_before_writing() {
        let store = MemoryStore::new();
        let conn = store.connect();
        let mut pubs = BTreeMap::new();
        pubs.insert(port_key("hostA", ":1000"), port("svc1", "ok"));
        pubs.insert(port_key("hostA", ":2000"), port("svc1", ""));
        let err = sync_service_registry(&*conn, "svc1", &pubs, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation { .. }));
        assert!(!conn.exists("/net/pub").await.unwrap());
    }
}
