//! Standalone mode: one host's front door over an in-process registry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use warpgrid_coord::{Connection, MemoryStore, listen};
use warpgrid_proxy::{
    Dialer, LocalAddrs, ProxyCache, ProxyError, PublicPortManager, TcpMux, TlsMaterial,
    VHostManager, public::bind_address,
};
use warpgrid_registry::{PublicPortListener, VHostListener, paths, register_export, sync_service_registry};

use crate::config::DaemonConfig;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Write the configured routing records, one service at a time.
pub async fn seed(conn: &dyn Connection, config: &DaemonConfig) -> anyhow::Result<()> {
    conn.create_dir(&paths::public_ports(&config.host_id)).await?;
    conn.create_dir(&paths::vhosts(&config.host_id)).await?;
    for (service_id, records) in config.service_records() {
        sync_service_registry(conn, &service_id, &records.ports, &records.vhosts)
            .await
            .with_context(|| format!("seeding records of service {service_id}"))?;
        info!(
            service = %service_id,
            ports = records.ports.len(),
            vhosts = records.vhosts.len(),
            "service records seeded"
        );
    }
    Ok(())
}

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(host = %config.host_id, "WarpGrid daemon starting in standalone mode");

    let local = Arc::new(LocalAddrs::discover().context("discovering local IPv4 addresses")?);
    let local_ips = local.addrs();
    let default_host_ip = local_ips
        .first()
        .map(ToString::to_string)
        .context("no local IPv4 address")?;
    info!(addrs = ?local_ips, "local addresses discovered");

    let material = TlsMaterial::load_or_generate(config.cert_file.as_deref(), config.key_file.as_deref())
        .context("loading TLS material")?;
    let acceptor = material.acceptor().context("building TLS acceptor")?;

    let store = MemoryStore::new();
    let conn: Arc<dyn Connection> = store.connect();
    seed(&*conn, &config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // ── Exports ────────────────────────────────────────────────

    for export in &config.exports {
        let details = export.details(&default_host_ip, config.mux_port);
        let tenant = export.tenant_id.clone();
        let (rx, conn) = (shutdown_rx.clone(), conn.clone());
        tasks.spawn(async move {
            let application = details.application.clone();
            if let Err(e) = register_export(rx, conn, tenant.clone(), details).await {
                error!(%tenant, %application, error = %e, "export registration failed");
            }
        });
    }

    // ── Mux ────────────────────────────────────────────────────

    let mux_address = format!("{}:{}", config.bind_ip, config.mux_port);
    let mux_listener = TcpListener::bind(&mux_address)
        .await
        .with_context(|| format!("binding mux on {mux_address}"))?;
    let mux = TcpMux::new(config.mux_tls.then(|| acceptor.clone()));
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { mux.serve(rx, mux_listener).await });

    // ── Public ports ───────────────────────────────────────────

    let dialer = Arc::new(Dialer::new(local.clone())?);
    let cache = Arc::new(ProxyCache::new(dialer));
    let ports = Arc::new(
        PublicPortManager::new(config.bind_ip.clone(), Some(acceptor.clone()), cache.clone(), config.mux_tls)
            .with_failure_callback(Arc::new(|port: &str, e: &ProxyError| {
                warn!(port, error = %e, "public port unavailable");
            })),
    );
    let port_listener = Arc::new(PublicPortListener::new(conn.clone(), config.host_id.clone(), ports.clone()));
    let (rx, c) = (shutdown_rx.clone(), conn.clone());
    tasks.spawn(async move {
        if let Err(e) = listen(rx, c, port_listener).await {
            error!(error = %e, "public port listener failed");
        }
    });

    // ── VHosts ─────────────────────────────────────────────────

    let vhosts = Arc::new(VHostManager::new(cache, config.mux_tls, config.host_aliases.clone()));
    let vhost_listener = Arc::new(VHostListener::new(conn.clone(), config.host_id.clone(), vhosts.clone()));
    let (rx, c) = (shutdown_rx.clone(), conn.clone());
    tasks.spawn(async move {
        if let Err(e) = listen(rx, c, vhost_listener).await {
            error!(error = %e, "vhost listener failed");
        }
    });
    if let Some(address) = &config.vhost_address {
        let address = bind_address(&config.bind_ip, address);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("binding vhost listener on {address}"))?;
        let tls = config.vhost_tls.then(|| acceptor.clone());
        tasks.spawn(vhosts.clone().serve(shutdown_rx.clone(), listener, tls));
    }

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("installing CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    ports.shutdown().await;

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "tasks still running after drain timeout");
        tasks.abort_all();
    }
    conn.close().await;

    info!("WarpGrid daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use warpgrid_registry::{PublicPortKey, VHostKey, get_public_port, get_vhost};

    use super::*;

    #[tokio::test]
    async fn seed_writes_every_configured_record() {
        let config: DaemonConfig = toml::from_str(
            r#"
host_id = "host-1"

[[public_ports]]
address = ":8080"
tenant_id = "t1"
application = "web"
service_id = "svc-web"
protocol = "http"

[[vhosts]]
subdomain = "www"
tenant_id = "t1"
application = "web"
service_id = "svc-web"
"#,
        )
        .unwrap();
        let store = MemoryStore::new();
        let conn = store.connect();
        seed(&*conn, &config).await.unwrap();

        let port = get_public_port(
            &*conn,
            &PublicPortKey {
                host_id: "host-1".into(),
                port_address: ":8080".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(port.protocol, "http");
        assert!(port.enabled);

        let vhost = get_vhost(
            &*conn,
            &VHostKey {
                host_id: "host-1".into(),
                subdomain: "www".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(vhost.service_id, "svc-web");
    }

    #[tokio::test]
    async fn seed_rejects_invalid_records() {
        let config: DaemonConfig = toml::from_str(
            r#"
host_id = "host-1"

[[public_ports]]
address = ":8080"
tenant_id = "t1"
application = "web"
service_id = "svc-web"
protocol = "udp"
"#,
        )
        .unwrap();
        let store = MemoryStore::new();
        let conn = store.connect();
        let err = seed(&*conn, &config).await.unwrap_err();
        assert!(format!("{err:#}").contains("svc-web"));
    }
}
