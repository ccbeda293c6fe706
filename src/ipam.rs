//! Address management seam.
//!
//! The plugin never allocates addresses itself. An [`IpamInvoker`] obtains
//! them either by delegating to another CNI plugin on disk
//! ([`crate::ipam_delegate`]) or by calling the node's network control
//! service ([`crate::ipam_cns`]). The invoker is chosen per invocation from
//! the configuration's IPAM type.

use std::collections::HashMap;

use ipnet::IpNet;
use serde_json::Value;

use crate::{
    error::Error,
    types::{CmdArgs, CniResult, NetworkConfig},
};

/// Option key for extra host routes, a serialized list of
/// [`crate::platform::RouteEntry`].
pub const OPT_ROUTES: &str = "routes";
/// Option key for iptables descriptors, a serialized list of
/// [`crate::platform::IptablesRule`].
pub const OPT_IPTABLES_RULES: &str = "iptablesRules";

/// Input to an IPAM add.
#[derive(Debug)]
pub struct IpamAddConfig<'a> {
    pub conf: &'a NetworkConfig,
    pub args: &'a CmdArgs,
}

/// Outcome of an IPAM add: per-family results plus a shared options map
/// consumed by the endpoint builder.
#[derive(Debug, Default)]
pub struct IpamAddResult {
    pub ipv4: Option<CniResult>,
    pub ipv6: Option<CniResult>,
    /// Host subnet the allocation is reachable through, when the allocator
    /// knows it. Used to select the master interface.
    pub host_subnet: Option<IpNet>,
    pub options: HashMap<String, Value>,
}

impl IpamAddResult {
    /// All allocated addresses in CIDR notation, IPv4 first.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.ipv4
            .iter()
            .chain(self.ipv6.iter())
            .flat_map(|r| r.ips.iter().map(|ip| ip.address.clone()))
            .collect()
    }
}

/// Polymorphic address allocation.
pub trait IpamInvoker {
    /// Allocates addresses for the invocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IpamPoolExhausted`] when no pool has capacity and
    /// [`Error::Ipam`] or [`Error::ControlService`] on other failures. A
    /// failed add must leave nothing allocated.
    fn add(&self, config: &IpamAddConfig<'_>) -> Result<IpamAddResult, Error>;

    /// Releases previously allocated addresses. An empty `addresses` slice
    /// asks the invoker to release whatever it can attribute to the pod
    /// identity in `args`; invokers without such an index treat it as a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ipam`] or [`Error::ControlService`] on failure.
    /// Releasing an unknown address is not a failure.
    fn delete(
        &self,
        addresses: &[String],
        conf: &NetworkConfig,
        args: &CmdArgs,
        options: &HashMap<String, Value>,
    ) -> Result<(), Error>;
}

/// Decodes a typed value out of the shared options map.
///
/// # Errors
///
/// Returns [`Error::ParseError`] when the payload does not decode as `T`.
pub fn option<T: serde::de::DeserializeOwned>(
    options: &HashMap<String, Value>,
    key: &str,
) -> Result<Option<T>, Error> {
    match options.get(key) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}
