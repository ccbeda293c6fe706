//! Host platform capability set.
//!
//! Imperative host programming (interfaces, routes, NAT rules) is an
//! external collaborator. The core talks to it through [`PlatformOps`]; an
//! operation a platform cannot perform returns [`OpOutcome::NotSupported`],
//! which callers treat as a no-op, so the dispatcher carries no platform
//! switch. Duplicate installs and missing removes are soft-idempotent: the
//! host shares its networking primitives with external operators and rules
//! may drift underneath us.

use std::{
    net::IpAddr,
    path::PathBuf,
    sync::mpsc,
    time::{Duration, SystemTime},
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{error::Error, policy::NativePolicy, types::Mode};

/// Default per-call deadline for platform operations.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of an imperative platform operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    Applied,
    /// The platform cannot perform this operation; callers treat it as a
    /// no-op.
    NotSupported,
}

/// A host network interface with its configured prefixes, primary first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInterface {
    pub name: String,
    pub mac: String,
    pub addresses: Vec<IpNet>,
}

impl HostInterface {
    /// Subnet of the primary address, when the interface has one.
    #[must_use]
    pub fn primary_subnet(&self) -> Option<IpNet> {
        self.addresses.first().map(IpNet::trunc)
    }
}

/// Route entry programmed into a sandbox or the host table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
}

/// Operation kind for an iptables rule descriptor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IptablesOp {
    Create,
    Append,
    Insert,
}

/// A single platform-agnostic iptables rule descriptor; the platform turns
/// it into native rule syntax.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IptablesRule {
    pub operation: IptablesOp,
    pub table: String,
    pub chain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
}

/// Everything the platform needs to materialize an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub endpoint_id: String,
    pub netns: Option<PathBuf>,
    pub ifname: String,
    pub host_ifname: String,
    pub mode: Mode,
    pub bridge: Option<String>,
    pub ip_addresses: Vec<IpNet>,
    pub gateways: Vec<IpAddr>,
    pub routes: Vec<RouteEntry>,
    pub enable_snat_on_host: bool,
    pub vlan_id: Option<u32>,
}

/// Interface the platform created for an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInterface {
    pub name: String,
    pub mac: String,
}

/// Capability set for host-level operations.
pub trait PlatformOps {
    /// Host interfaces with their configured addresses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] when the host cannot be queried.
    fn host_interfaces(&self) -> Result<Vec<HostInterface>, Error>;

    /// Time of the last host reboot, used for stale-lock recovery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] when the boot time is unknown.
    fn last_reboot_time(&self) -> Result<SystemTime, Error>;

    /// Adds `ifname` as the external interface for the given subnets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] on host failure.
    fn add_external_interface(&self, ifname: &str, subnets: &[IpNet]) -> Result<OpOutcome, Error>;

    /// Creates the host-side artifacts for an endpoint and attaches it to
    /// its sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] on host failure.
    fn create_endpoint(&self, spec: &EndpointSpec) -> Result<Option<CreatedInterface>, Error>;

    /// Tears down an endpoint's host artifacts. Best-effort; a missing
    /// interface is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] on host failure.
    fn delete_endpoint(&self, endpoint_id: &str, host_ifname: &str) -> Result<OpOutcome, Error>;

    /// Programs routes inside the sandbox at `netns`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] on host failure.
    fn add_routes(&self, netns: Option<&PathBuf>, routes: &[RouteEntry])
        -> Result<OpOutcome, Error>;

    /// Removes routes from the sandbox at `netns`. A missing route is a
    /// no-op with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] on host failure.
    fn remove_routes(
        &self,
        netns: Option<&PathBuf>,
        routes: &[RouteEntry],
    ) -> Result<OpOutcome, Error>;

    /// Applies iptables rule descriptors. Installing an already-present
    /// rule is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] on host failure.
    fn apply_iptables_rules(&self, rules: &[IptablesRule]) -> Result<OpOutcome, Error>;

    /// Applies platform-native policies to an endpoint, replacing any
    /// previously applied set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Platform`] on host failure.
    fn apply_endpoint_policies(
        &self,
        endpoint_id: &str,
        policies: &[NativePolicy],
    ) -> Result<OpOutcome, Error>;
}

/// Races `f` on a worker thread against `deadline`. On expiry the call is
/// abandoned and *platform-call-timeout* is returned; the worker finishes
/// in the background best-effort.
///
/// # Errors
///
/// Returns [`Error::PlatformCallTimeout`] on deadline expiry, or the
/// closure's own error.
pub fn call_with_deadline<T, F>(deadline: Duration, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(_) => Err(Error::PlatformCallTimeout(format!(
            "platform call exceeded {deadline:?}"
        ))),
    }
}

/// Portable platform implementation.
///
/// Host interface programming is carried by the node's platform agent on
/// builds without native netlink support, so the imperative capabilities
/// report [`OpOutcome::NotSupported`] and callers proceed. The host queries
/// (boot time) use portable sources.
#[derive(Debug, Default)]
pub struct DefaultPlatform;

impl PlatformOps for DefaultPlatform {
    fn host_interfaces(&self) -> Result<Vec<HostInterface>, Error> {
        Ok(Vec::new())
    }

    fn last_reboot_time(&self) -> Result<SystemTime, Error> {
        call_with_deadline(DEFAULT_CALL_TIMEOUT, || {
            let uptime = std::fs::read_to_string("/proc/uptime")
                .map_err(|e| Error::Platform(format!("failed to read uptime: {e}")))?;
            let seconds: f64 = uptime
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|e| Error::Platform(format!("failed to parse uptime: {e}")))?;
            Ok(SystemTime::now() - Duration::from_secs_f64(seconds))
        })
    }

    fn add_external_interface(
        &self,
        _ifname: &str,
        _subnets: &[IpNet],
    ) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::NotSupported)
    }

    fn create_endpoint(&self, _spec: &EndpointSpec) -> Result<Option<CreatedInterface>, Error> {
        Ok(None)
    }

    fn delete_endpoint(&self, _endpoint_id: &str, _host_ifname: &str) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::NotSupported)
    }

    fn add_routes(
        &self,
        _netns: Option<&PathBuf>,
        _routes: &[RouteEntry],
    ) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::NotSupported)
    }

    fn remove_routes(
        &self,
        _netns: Option<&PathBuf>,
        _routes: &[RouteEntry],
    ) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::NotSupported)
    }

    fn apply_iptables_rules(&self, _rules: &[IptablesRule]) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::NotSupported)
    }

    fn apply_endpoint_policies(
        &self,
        _endpoint_id: &str,
        _policies: &[NativePolicy],
    ) -> Result<OpOutcome, Error> {
        Ok(OpOutcome::NotSupported)
    }
}
