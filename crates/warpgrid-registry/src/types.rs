//! Registry records.
//!
//! Every record is stored as JSON in a coordination node. Field names
//! follow the existing wire format (PascalCase, upper-case acronyms);
//! the version token is filled in on read and never serialized.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use warpgrid_coord::{Version, impl_node};

use crate::error::{RegistryError, RegistryResult};

/// A live, reachable instance of an application's exported endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExportDetails {
    pub application: String,
    pub protocol: String,
    pub port_number: u16,
    #[serde(rename = "HostIP")]
    pub host_ip: String,
    #[serde(rename = "PrivateIP")]
    pub private_ip: String,
    pub mux_port: u16,
    #[serde(rename = "InstanceID")]
    pub instance_id: u32,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl ExportDetails {
    pub fn validate(&self) -> RegistryResult<()> {
        if self.application.is_empty() {
            return Err(RegistryError::invalid("export", "application is required"));
        }
        if self.port_number == 0 {
            return Err(RegistryError::invalid("export", "port number is required"));
        }
        parse_ip("export", "host ip", &self.host_ip)?;
        parse_ip("export", "private ip", &self.private_ip)?;
        Ok(())
    }

    /// `PrivateIP:PortNumber`, the container-side address.
    pub fn private_address(&self) -> String {
        format!("{}:{}", self.private_ip, self.port_number)
    }

    /// `HostIP:MuxPort`, where the owning host's multiplexer listens.
    pub fn mux_address(&self) -> String {
        format!("{}:{}", self.host_ip, self.mux_port)
    }
}

fn parse_ip(record: &'static str, field: &str, raw: &str) -> RegistryResult<Ipv4Addr> {
    raw.parse()
        .map_err(|_| RegistryError::invalid(record, format!("{field} {raw:?} is not an IPv4 address")))
}

fn require(record: &'static str, field: &str, value: &str) -> RegistryResult<()> {
    if value.trim().is_empty() {
        return Err(RegistryError::invalid(record, format!("{field} is required")));
    }
    Ok(())
}

/// Protocols a public port can front.
pub const PORT_PROTOCOLS: [&str; 3] = ["tcp", "http", "https"];

/// A host port that exposes an application to the outside world.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublicPort {
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
    pub application: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub enabled: bool,
    pub protocol: String,
    #[serde(rename = "UseTLS")]
    pub use_tls: bool,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl PublicPort {
    pub fn validate(&self) -> RegistryResult<()> {
        require("public port", "tenant id", &self.tenant_id)?;
        require("public port", "application", &self.application)?;
        require("public port", "service id", &self.service_id)?;
        if !PORT_PROTOCOLS.contains(&self.protocol.as_str()) {
            return Err(RegistryError::invalid(
                "public port",
                format!("unsupported protocol {:?}", self.protocol),
            ));
        }
        Ok(())
    }
}

/// A subdomain routed by the shared HTTP(S) front door.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VHost {
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
    pub application: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    pub enabled: bool,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl VHost {
    pub fn validate(&self) -> RegistryResult<()> {
        require("vhost", "tenant id", &self.tenant_id)?;
        require("vhost", "application", &self.application)?;
        require("vhost", "service id", &self.service_id)?;
        Ok(())
    }
}

/// Directory marker under `/endpoints`; records whether a key is mirrored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyNode {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "IsRemote")]
    pub is_remote: bool,
    #[serde(skip)]
    pub version: Option<Version>,
}

/// One application endpoint bound to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointNode {
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "InstanceID")]
    pub instance_id: u32,
    pub application: String,
    pub purpose: String,
    #[serde(rename = "HostID")]
    pub host_id: String,
    #[serde(rename = "HostIP")]
    pub host_ip: String,
    pub host_port: u16,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    #[serde(rename = "ContainerIP")]
    pub container_ip: String,
    pub container_port: u16,
    pub protocol: String,
    pub virtual_address: String,
    pub proxy_port: u16,
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(skip)]
    pub version: Option<Version>,
}

impl EndpointNode {
    pub fn validate(&self) -> RegistryResult<()> {
        require("endpoint", "service id", &self.service_id)?;
        require("endpoint", "tenant id", &self.tenant_id)?;
        require("endpoint", "endpoint id", &self.endpoint_id)?;
        require("endpoint", "host id", &self.host_id)?;
        require("endpoint", "container id", &self.container_id)?;
        Ok(())
    }
}

impl_node!(ExportDetails, PublicPort, VHost, KeyNode, EndpointNode);

/// Identifies a public port record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicPortKey {
    pub host_id: String,
    pub port_address: String,
}

/// Identifies a vhost record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VHostKey {
    pub host_id: String,
    pub subdomain: String,
}
