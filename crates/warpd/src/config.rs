//! warpd.toml configuration.
//!
//! ```toml
//! host_id = "host-1"
//! bind_ip = "0.0.0.0"
//! mux_port = 22250
//! vhost_address = ":443"
//! host_aliases = ["apps.example.com"]
//!
//! [[public_ports]]
//! address = ":8080"
//! tenant_id = "tenant-1"
//! application = "web"
//! service_id = "svc-web"
//! protocol = "http"
//!
//! [[exports]]
//! tenant_id = "tenant-1"
//! application = "web"
//! private_ip = "172.17.0.2"
//! port_number = 8080
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use warpgrid_proxy::DEFAULT_MUX_PORT;
use warpgrid_registry::{ExportDetails, PublicPort, PublicPortKey, VHost, VHostKey};

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_mux_port() -> u16 {
    DEFAULT_MUX_PORT
}

fn default_true() -> bool {
    true
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub host_id: String,
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    #[serde(default = "default_mux_port")]
    pub mux_port: u16,
    #[serde(default = "default_true")]
    pub mux_tls: bool,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Where the shared vhost listener binds; no vhost listener when unset.
    #[serde(default)]
    pub vhost_address: Option<String>,
    #[serde(default = "default_true")]
    pub vhost_tls: bool,
    #[serde(default)]
    pub host_aliases: Vec<String>,
    #[serde(default)]
    pub public_ports: Vec<PortConfig>,
    #[serde(default)]
    pub vhosts: Vec<VHostConfig>,
    #[serde(default)]
    pub exports: Vec<ExportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub address: String,
    pub tenant_id: String,
    pub application: String,
    pub service_id: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VHostConfig {
    pub subdomain: String,
    pub tenant_id: String,
    pub application: String,
    pub service_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A container endpoint advertised for as long as the daemon runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub tenant_id: String,
    pub application: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub private_ip: String,
    pub port_number: u16,
    /// Defaults to this host's first local address.
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub instance_id: u32,
}

/// Routing records owned by one service.
#[derive(Debug, Default)]
pub struct ServiceRecords {
    pub ports: BTreeMap<PublicPortKey, PublicPort>,
    pub vhosts: BTreeMap<VHostKey, VHost>,
}

impl DaemonConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: DaemonConfig =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host_id.trim().is_empty() {
            bail!("host_id is required");
        }
        if self.bind_ip.parse::<Ipv4Addr>().is_err() {
            bail!("bind_ip {:?} is not an IPv4 address", self.bind_ip);
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            bail!("cert_file and key_file must be set together");
        }
        for port in &self.public_ports {
            if port.address.is_empty() {
                bail!("public port for {} has no address", port.application);
            }
        }
        for vhost in &self.vhosts {
            if vhost.subdomain.is_empty() || vhost.subdomain.contains('/') {
                bail!("invalid vhost subdomain {:?}", vhost.subdomain);
            }
        }
        Ok(())
    }

    /// Public port and vhost records of this host, grouped by service.
    pub fn service_records(&self) -> BTreeMap<String, ServiceRecords> {
        let mut services: BTreeMap<String, ServiceRecords> = BTreeMap::new();
        for port in &self.public_ports {
            let key = PublicPortKey {
                host_id: self.host_id.clone(),
                port_address: port.address.clone(),
            };
            let record = PublicPort {
                tenant_id: port.tenant_id.clone(),
                application: port.application.clone(),
                service_id: port.service_id.clone(),
                enabled: port.enabled,
                protocol: port.protocol.clone(),
                use_tls: port.use_tls,
                version: None,
            };
            services
                .entry(port.service_id.clone())
                .or_default()
                .ports
                .insert(key, record);
        }
        for vhost in &self.vhosts {
            let key = VHostKey {
                host_id: self.host_id.clone(),
                subdomain: vhost.subdomain.clone(),
            };
            let record = VHost {
                tenant_id: vhost.tenant_id.clone(),
                application: vhost.application.clone(),
                service_id: vhost.service_id.clone(),
                enabled: vhost.enabled,
                version: None,
            };
            services
                .entry(vhost.service_id.clone())
                .or_default()
                .vhosts
                .insert(key, record);
        }
        services
    }
}

impl ExportConfig {
    /// Export record for this host; `default_host_ip` fills a missing `host_ip`.
    pub fn details(&self, default_host_ip: &str, mux_port: u16) -> ExportDetails {
        ExportDetails {
            application: self.application.clone(),
            protocol: self.protocol.clone(),
            port_number: self.port_number,
            host_ip: self
                .host_ip
                .clone()
                .unwrap_or_else(|| default_host_ip.to_string()),
            private_ip: self.private_ip.clone(),
            mux_port,
            instance_id: self.instance_id,
            version: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
host_id = "host-1"
vhost_address = ":8443"
host_aliases = ["apps.example.com"]

[[public_ports]]
address = ":8080"
tenant_id = "t1"
application = "web"
service_id = "svc-web"
protocol = "http"

[[public_ports]]
address = ":5432"
tenant_id = "t1"
application = "db"
service_id = "svc-db"

[[vhosts]]
subdomain = "www"
tenant_id = "t1"
application = "web"
service_id = "svc-web"

[[exports]]
tenant_id = "t1"
application = "web"
private_ip = "172.17.0.2"
port_number = 8080
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_applies_defaults() {
        let file = write_config(SAMPLE);
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.host_id, "host-1");
        assert_eq!(config.bind_ip, "0.0.0.0");
        assert_eq!(config.mux_port, 22250);
        assert!(config.mux_tls);
        assert!(config.vhost_tls);
        assert_eq!(config.public_ports[1].protocol, "tcp");
        assert!(config.public_ports[0].enabled);
        assert_eq!(config.exports[0].host_ip, None);
    }

    #[test]
    fn records_are_grouped_by_service() {
        let config: DaemonConfig = toml::from_str(SAMPLE).unwrap();
        let services = config.service_records();
        assert_eq!(services.len(), 2);
        let web = &services["svc-web"];
        assert_eq!(web.ports.len(), 1);
        assert_eq!(web.vhosts.len(), 1);
        let key = web.vhosts.keys().next().unwrap();
        assert_eq!(key.host_id, "host-1");
        assert_eq!(key.subdomain, "www");
        assert!(services["svc-db"].vhosts.is_empty());
    }

    #[test]
    fn export_host_ip_falls_back_to_local_address() {
        let config: DaemonConfig = toml::from_str(SAMPLE).unwrap();
        let details = config.exports[0].details("10.0.0.5", config.mux_port);
        assert_eq!(details.host_ip, "10.0.0.5");
        assert_eq!(details.mux_port, 22250);
        details.validate().unwrap();
    }

    #[test]
    fn missing_host_id_is_rejected() {
        let file = write_config("host_id = \"\"\n");
        let err = DaemonConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("host_id"));
    }

    #[test]
    fn lone_cert_file_is_rejected() {
        let file = write_config("host_id = \"h\"\ncert_file = \"/tmp/cert.pem\"\n");
        assert!(DaemonConfig::load(file.path()).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = DaemonConfig::load(Path::new("/nonexistent/warpd.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/warpd.toml"));
    }
}
