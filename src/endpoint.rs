//! Endpoint records.
//!
//! An endpoint is one container attachment to a network: its addresses,
//! routes, sandbox location and the host-side interface carrying it. Records
//! persist in the state store so later DEL/GET/UPDATE invocations, which are
//! separate processes, can reconstruct everything ADD knew.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    platform::{EndpointSpec, RouteEntry},
    policy::Policy,
    types::{CniResult, Dns, Interface, IpConfig, Mode, PodInfo, Route},
};

/// Identifier of the attachment, stable across invocations.
#[must_use]
pub fn endpoint_id(container_id: &str, ifname: &str) -> String {
    format!("{container_id}-{ifname}")
}

/// Host-side interface name for an endpoint. Transparent mode names the
/// interface after the pod so operators can find it; other modes derive it
/// from the attachment identity.
#[must_use]
pub fn host_ifname(mode: Mode, network_id: &str, container_id: &str, ifname: &str, pod: &PodInfo) -> String {
    match mode {
        Mode::Transparent => format!("{}.{}", pod.pod_namespace, pod.pod_name),
        _ => format!("{network_id}{container_id}{ifname}"),
    }
}

/// Persistent endpoint state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub id: String,
    pub container_id: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub pod_namespace: String,
    pub ifname: String,
    pub host_ifname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Addresses in CIDR notation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteEntry>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u32>,
    #[serde(default)]
    pub enable_snat_on_host: bool,
    #[serde(default)]
    pub enable_snat_for_dns: bool,
    /// Infra-vnet address in CIDR notation, allocated alongside the
    /// multi-tenant addresses and released with them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_container_id: Option<String>,
    #[serde(default, rename = "allowHostToNCCommunication")]
    pub allow_host_to_nc_communication: bool,
    #[serde(default, rename = "allowNCToHostCommunication")]
    pub allow_nc_to_host_communication: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<Policy>,
}

impl EndpointRecord {
    /// True when this endpoint belongs to the pod, comparing the stored name
    /// exactly or with its replica suffix stripped.
    #[must_use]
    pub fn matches_pod(&self, pod: &PodInfo, exact: bool) -> bool {
        if self.pod_namespace != pod.pod_namespace {
            return false;
        }
        if exact {
            return self.pod_name == pod.pod_name;
        }
        let stored = PodInfo {
            pod_name: self.pod_name.clone(),
            ..PodInfo::default()
        };
        stored.name_without_suffix() == pod.name_without_suffix()
    }

    /// Rebuilds the result document a runtime expects from a stored record.
    #[must_use]
    pub fn to_cni_result(&self) -> CniResult {
        let interfaces = self
            .mac
            .as_ref()
            .map(|mac| Interface {
                name: self.ifname.clone(),
                mac: mac.clone(),
                sandbox: self
                    .netns
                    .as_ref()
                    .map(|n| n.display().to_string()),
            })
            .into_iter()
            .collect();
        CniResult {
            interfaces,
            ips: self
                .ip_addresses
                .iter()
                .zip(self.gateways.iter().map(Some).chain(std::iter::repeat(None)))
                .map(|(address, gateway)| IpConfig {
                    interface: self.mac.is_some().then_some(0),
                    address: address.clone(),
                    gateway: gateway.cloned(),
                })
                .collect(),
            routes: self
                .routes
                .iter()
                .map(|r| Route {
                    dst: r.dst.to_string(),
                    gw: r.gw.map(|gw| gw.to_string()),
                })
                .collect(),
            dns: (!self.dns.is_empty()).then(|| self.dns.clone()),
        }
    }

    /// Platform-facing description of the endpoint.
    #[must_use]
    pub fn to_endpoint_spec(&self, mode: Mode, bridge: Option<String>) -> EndpointSpec {
        EndpointSpec {
            endpoint_id: self.id.clone(),
            netns: self.netns.clone(),
            ifname: self.ifname.clone(),
            host_ifname: self.host_ifname.clone(),
            mode,
            bridge,
            ip_addresses: self
                .ip_addresses
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect(),
            gateways: self
                .gateways
                .iter()
                .filter_map(|g| g.parse().ok())
                .collect(),
            routes: self.routes.clone(),
            enable_snat_on_host: self.enable_snat_on_host,
            vlan_id: self.vlan_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::types::{Mode, PodInfo};

    use super::{endpoint_id, host_ifname, EndpointRecord};

    fn pod(name: &str, namespace: &str) -> PodInfo {
        PodInfo {
            pod_name: name.to_string(),
            pod_namespace: namespace.to_string(),
            ..PodInfo::default()
        }
    }

    #[test]
    fn test_endpoint_id() {
        assert_eq!(endpoint_id("abc123", "eth0"), "abc123-eth0");
    }

    #[rstest]
    #[case(Mode::Transparent, "ns1.pod1")]
    #[case(Mode::Bridge, "azureabc123eth0")]
    fn test_host_ifname(#[case] mode: Mode, #[case] expected: &str) {
        let name = host_ifname(mode, "azure", "abc123", "eth0", &pod("pod1", "ns1"));
        assert_eq!(name, expected);
    }

    #[rstest]
    #[case("nginx-7fb96c846b-x4mzq", "nginx-7fb96c846b-x4mzq", true, true)]
    #[case("nginx-7fb96c846b-x4mzq", "nginx-7fb96c846b-zzzzz", true, false)]
    #[case("nginx-7fb96c846b-x4mzq", "nginx-7fb96c846b-zzzzz", false, true)]
    #[case("nginx-7fb96c846b-x4mzq", "redis-7fb96c846b-zzzzz", false, false)]
    fn test_matches_pod(
        #[case] stored: &str,
        #[case] requested: &str,
        #[case] exact: bool,
        #[case] expected: bool,
    ) {
        let record = EndpointRecord {
            pod_name: stored.to_string(),
            pod_namespace: "ns1".to_string(),
            ..EndpointRecord::default()
        };
        assert_eq!(record.matches_pod(&pod(requested, "ns1"), exact), expected);
    }

    #[test]
    fn test_matches_pod_requires_namespace() {
        let record = EndpointRecord {
            pod_name: "pod1".to_string(),
            pod_namespace: "ns1".to_string(),
            ..EndpointRecord::default()
        };
        assert!(!record.matches_pod(&pod("pod1", "ns2"), true));
    }

    #[test]
    fn test_to_cni_result_rebuilds_document() {
        let record = EndpointRecord {
            id: "abc123-eth0".to_string(),
            container_id: "abc123".to_string(),
            ifname: "eth0".to_string(),
            host_ifname: "azureabc123eth0".to_string(),
            netns: Some("/var/run/netns/cni-1".into()),
            mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ip_addresses: vec!["10.0.1.10/24".to_string()],
            gateways: vec!["10.0.1.1".to_string()],
            routes: vec![crate::platform::RouteEntry {
                dst: "0.0.0.0/0".parse().unwrap(),
                gw: Some("10.0.1.1".parse().unwrap()),
                dev: None,
            }],
            ..EndpointRecord::default()
        };

        let result = record.to_cni_result();
        assert_eq!(result.interfaces.len(), 1);
        assert_eq!(result.interfaces[0].mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(
            result.interfaces[0].sandbox.as_deref(),
            Some("/var/run/netns/cni-1")
        );
        assert_eq!(result.ips[0].address, "10.0.1.10/24");
        assert_eq!(result.ips[0].gateway.as_deref(), Some("10.0.1.1"));
        assert_eq!(result.routes[0].dst, "0.0.0.0/0");
    }
}
