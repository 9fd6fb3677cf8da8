//! Path conventions shared by every host.

use warpgrid_coord::path::join;

pub const EXPORT_ROOT: &str = "/net/export";
pub const PUBLIC_PORT_ROOT: &str = "/net/pub";
pub const VHOST_ROOT: &str = "/net/vhost";
pub const ENDPOINT_ROOT: &str = "/endpoints";

pub fn exports_for_tenant(tenant_id: &str) -> String {
    join(&[EXPORT_ROOT, tenant_id])
}

pub fn exports_for_application(tenant_id: &str, application: &str) -> String {
    join(&[EXPORT_ROOT, tenant_id, application])
}

pub fn public_ports(host_id: &str) -> String {
    join(&[PUBLIC_PORT_ROOT, host_id])
}

pub fn public_port(host_id: &str, port_address: &str) -> String {
    join(&[PUBLIC_PORT_ROOT, host_id, port_address])
}

pub fn vhosts(host_id: &str) -> String {
    join(&[VHOST_ROOT, host_id])
}

pub fn vhost(host_id: &str, subdomain: &str) -> String {
    join(&[VHOST_ROOT, host_id, subdomain])
}

/// `tenantID_endpointID`
pub fn tenant_endpoint_key(tenant_id: &str, endpoint_id: &str) -> String {
    format!("{tenant_id}_{endpoint_id}")
}

/// `hostID_containerID`
pub fn host_container_key(host_id: &str, container_id: &str) -> String {
    format!("{host_id}_{container_id}")
}

pub fn endpoint_key(key: &str) -> String {
    join(&[ENDPOINT_ROOT, key])
}

pub fn endpoint_item(key: &str, item: &str) -> String {
    join(&[ENDPOINT_ROOT, key, item])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(exports_for_application("t1", "app1"), "/net/export/t1/app1");
        assert_eq!(public_port("hostA", ":9000"), "/net/pub/hostA/:9000");
        assert_eq!(vhost("hostA", "www"), "/net/vhost/hostA/www");
        assert_eq!(
            endpoint_item(&tenant_endpoint_key("t1", "web"), &host_container_key("h", "c")),
            "/endpoints/t1_web/h_c"
        );
    }
}
