//! CNI data model for the plugin.
//!
//! This module contains the wire types exchanged with the container runtime:
//! the per-invocation network configuration read from stdin, the invocation
//! arguments read from the environment, and the CNI result document written
//! to stdout.
//!
//! # Main Types
//!
//! - [`NetworkConfig`] - Network configuration passed to the plugin
//! - [`CmdArgs`] - Input parameters for CNI operations (from environment)
//! - [`PodInfo`] - Kubernetes pod identity decoded from `CNI_ARGS`
//! - [`CniResult`] - Result returned by ADD/DEL/GET/UPDATE operations
//! - [`Interface`], [`IpConfig`], [`Route`], [`Dns`] - Result components

use std::{collections::HashMap, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub const CNI_COMMAND: &str = "CNI_COMMAND";
pub const CNI_CONTAINERID: &str = "CNI_CONTAINERID";
pub const CNI_NETNS: &str = "CNI_NETNS";
pub const CNI_IFNAME: &str = "CNI_IFNAME";
pub const CNI_ARGS: &str = "CNI_ARGS";
pub const CNI_PATH: &str = "CNI_PATH";

const ARG_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
const ARG_POD_NAME: &str = "K8S_POD_NAME";
const ARG_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";

/// CNI command issued by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Add,
    Del,
    Get,
    Update,
    Version,
    /// Unset state when `CNI_COMMAND` is not set.
    UnSet,
}

impl FromStr for Cmd {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "GET" => Ok(Self::Get),
            "UPDATE" => Ok(Self::Update),
            "VERSION" => Ok(Self::Version),
            "" => Ok(Self::UnSet),
            _ => Err(Error::ArgsMissing(format!("unknown CNI_COMMAND: {s}"))),
        }
    }
}

impl From<Cmd> for &str {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::Add => "ADD",
            Cmd::Del => "DEL",
            Cmd::Get => "GET",
            Cmd::Update => "UPDATE",
            Cmd::Version => "VERSION",
            Cmd::UnSet => "",
        }
    }
}

/// Operational mode of the network the plugin manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Bridge,
    Transparent,
    Baremetal,
}

/// IPv6 handling requested for the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ipv6Mode {
    Ipv6Nat,
}

/// IPAM descriptor from the network configuration.
///
/// `type` selects the invoker: the remote-service invoker for `azure-cns`,
/// the delegating invoker for any other sub-plugin name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(flatten)]
    pub custom: HashMap<String, Value>,
}

/// The remote-service IPAM type handled in-process.
pub const IPAM_TYPE_CNS: &str = "azure-cns";
/// IPAM mode value selecting the overlay gateway fallback.
pub const IPAM_MODE_V4_OVERLAY: &str = "v4overlay";

impl IpamConfig {
    /// True when addresses come from the node-local overlay range.
    #[must_use]
    pub fn is_v4_overlay(&self) -> bool {
        self.mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(IPAM_MODE_V4_OVERLAY))
    }
}

/// DNS configuration information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl Dns {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_none()
            && self.search.is_none()
            && self.options.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: u32,
    pub container_port: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Capability values injected by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
    #[serde(flatten)]
    pub custom: HashMap<String, Value>,
}

/// Additional argument carried through the configuration as a (name, raw
/// payload) pair; the payload is interpreted by the policy serializer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KvPair {
    pub name: String,
    pub value: Value,
}

/// `NetworkConfig` is given as JSON-serialized data from stdin when the
/// plugin is called. Immutable after parse, except for the IPAM subtype
/// mutation performed by the delegating invoker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub cni_version: String,
    pub name: String,
    pub r#type: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(default)]
    pub ipam: IpamConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_mode: Option<Ipv6Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
    #[serde(default, rename = "multiTenancy")]
    pub multi_tenancy: bool,
    #[serde(default)]
    pub enable_snat_on_host: bool,
    #[serde(default)]
    pub enable_infra_vnet: bool,
    #[serde(default)]
    pub enable_exact_match_for_pod_name: bool,
    #[serde(default)]
    pub disable_iptable_lock: bool,
    #[serde(default)]
    pub disable_hairpin_on_host_interface: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cns_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_vnet_address_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidrs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnet_cidrs: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_namespace_for_dual_network: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips_to_route_via_host: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_config: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_args: Vec<KvPair>,
    #[serde(flatten)]
    pub custom: HashMap<String, Value>,
}

/// Execution mode value that bypasses the IPAM/manager pipeline.
pub const EXECUTION_MODE_BAREMETAL: &str = "baremetal";

impl NetworkConfig {
    /// Parses a configuration document, defaulting a missing `cniVersion` to
    /// the given version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] when the document is not valid JSON for
    /// this shape.
    pub fn parse(data: &[u8], default_version: &str) -> Result<Self, Error> {
        let mut conf: Self =
            serde_json::from_slice(data).map_err(|e| Error::ParseError(e.to_string()))?;
        if conf.cni_version.is_empty() {
            conf.cni_version = default_version.to_string();
        }
        Ok(conf)
    }

    /// True when this invocation must be delegated wholesale to the node
    /// network service.
    #[must_use]
    pub fn is_baremetal(&self) -> bool {
        self.mode == Mode::Baremetal
            || self
                .execution_mode
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case(EXECUTION_MODE_BAREMETAL))
    }

    /// True when both address families are requested.
    #[must_use]
    pub fn is_dual_stack(&self) -> bool {
        self.ipv6_mode.is_some()
    }
}

/// Kubernetes pod identity decoded from the `CNI_ARGS` environment value
/// (semicolon-separated `K=V` pairs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct PodInfo {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub infra_container_id: String,
}

impl PodInfo {
    /// Decodes pod identity from the raw `CNI_ARGS` string. Unrecognized
    /// keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] on a malformed pair.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut info = Self::default();
        for pair in raw.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::ParseError(format!("malformed CNI_ARGS pair: {pair}")))?;
            match key {
                ARG_POD_NAME => info.pod_name = value.to_string(),
                ARG_POD_NAMESPACE => info.pod_namespace = value.to_string(),
                ARG_POD_INFRA_CONTAINER_ID => info.infra_container_id = value.to_string(),
                _ => {}
            }
        }
        Ok(info)
    }

    /// Pod name with a trailing two-segment replica suffix stripped, used
    /// when exact-match lookup is disabled. `metrics-server-5d6c87b-xk7ln`
    /// becomes `metrics-server`.
    #[must_use]
    pub fn name_without_suffix(&self) -> String {
        let segments: Vec<&str> = self.pod_name.split('-').collect();
        if segments.len() > 2 {
            segments[..segments.len() - 2].join("-")
        } else {
            self.pod_name.clone()
        }
    }
}

/// Per-invocation request assembled from the CNI environment.
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: Option<PathBuf>,
    pub ifname: String,
    pub args: Option<String>,
    pub path: Vec<PathBuf>,
    /// Raw configuration bytes from stdin, kept for re-serialization when
    /// delegating to a sub-plugin.
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    /// Decodes the Kubernetes pod identity from the raw args string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] on malformed args.
    pub fn pod_info(&self) -> Result<PodInfo, Error> {
        PodInfo::parse(self.args.as_deref().unwrap_or_default())
    }
}

/// Route created by the plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    /// The destination of the route, in CIDR notation.
    pub dst: String,
    /// The next hop address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// The interface created by the attachment, including any host-level
/// interfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP assigned by the plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<u32>,
    /// An IP address in CIDR notation.
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Success result document for ADD/GET; DEL and UPDATE return it empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

impl CniResult {
    /// Merges another result into this one, appending interfaces, IPs and
    /// routes; DNS is taken from the other result when unset here.
    pub fn merge(&mut self, other: CniResult) {
        self.interfaces.extend(other.interfaces);
        self.ips.extend(other.ips);
        self.routes.extend(other.routes);
        if self.dns.is_none() {
            self.dns = other.dns;
        }
    }
}

/// Error result document written to stdout when an operation fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResult {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    pub details: String,
}

impl From<&ErrorResult> for Error {
    fn from(res: &ErrorResult) -> Self {
        match res.code {
            1 => Self::IncompatibleVersion(res.details.clone()),
            4 => Self::ArgsMissing(res.details.clone()),
            5 => Self::IoFailure(res.details.clone()),
            6 => Self::ParseError(res.details.clone()),
            7 => Self::InvalidConfig(res.details.clone()),
            11 => Self::LockTimeout(res.details.clone()),
            100 => Self::IpamPoolExhausted(res.details.clone()),
            101 => Self::Ipam(res.details.clone()),
            code => Self::Custom(code, res.msg.clone(), res.details.clone()),
        }
    }
}
