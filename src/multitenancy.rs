//! Multitenancy goal-state resolver.
//!
//! In multi-tenant mode the pod's networking is driven by a network
//! container (NC) descriptor fetched per pod from the control service. The
//! resolver validates the descriptor against the host, optionally allocates
//! an infra-vnet address through the delegating allocator, and converts the
//! descriptor into the routes and result the endpoint builder consumes.

use std::{
    fs,
    net::IpAddr,
    path::Path,
    str::FromStr,
    time::Duration,
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    cns::{CnsClient, NetworkContainerResponse},
    error::Error,
    ipam::{IpamAddConfig, IpamAddResult, IpamInvoker},
    ipam_cns::AZURE_DNS_IP,
    platform::{PlatformOps, RouteEntry},
    types::{CmdArgs, CniResult, Dns, IpConfig, NetworkConfig, PodInfo},
};

/// Cache file for the SNAT feature decision.
pub const SNAT_CONFIG_FILE: &str = "snatConfig.json";

/// Default node-management agent supported-APIs endpoint.
pub const DEFAULT_NMA_URL: &str =
    "http://168.63.129.16/machine/plugins/?comp=nmagent&type=GetSupportedApis";

const NMA_TIMEOUT: Duration = Duration::from_secs(5);

const NMA_DNS_SUPPORT_API: &str = "NetworkManagementDNSSupport";
const NMA_SNAT_SUPPORT_API: &str = "NetworkManagementSnatSupport";

/// Which SNAT duties the node keeps versus hands to the platform agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnatConfig {
    pub enable_snat_for_dns: bool,
    pub enable_snat_on_host: bool,
}

/// Applies the capability decision table to the agent's supported-APIs body.
#[must_use]
pub fn decide_snat(body: &str) -> SnatConfig {
    if body.contains(NMA_DNS_SUPPORT_API) {
        SnatConfig {
            enable_snat_for_dns: false,
            enable_snat_on_host: false,
        }
    } else if body.contains(NMA_SNAT_SUPPORT_API) {
        SnatConfig {
            enable_snat_for_dns: true,
            enable_snat_on_host: false,
        }
    } else {
        SnatConfig {
            enable_snat_for_dns: true,
            enable_snat_on_host: true,
        }
    }
}

/// Resolves the SNAT feature decision, consulting the node-management agent
/// only when no cached decision exists and persisting the outcome.
///
/// # Errors
///
/// Returns [`Error::Nma`] on transport failure or a non-200 agent response.
pub fn determine_snat_feature_on_host(cache_path: &Path, nma_url: &str) -> Result<SnatConfig, Error> {
    if let Ok(cached) = fs::read_to_string(cache_path) {
        if let Ok(config) = serde_json::from_str(&cached) {
            debug!(cache = %cache_path.display(), "using cached SNAT decision");
            return Ok(config);
        }
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(NMA_TIMEOUT)
        .build()
        .map_err(|e| Error::Nma(e.to_string()))?;
    let response = client
        .get(nma_url)
        .send()
        .map_err(|e| Error::Nma(format!("{nma_url}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Nma(format!(
            "supported-APIs query returned {status}"
        )));
    }
    let body = response
        .text()
        .map_err(|e| Error::Nma(format!("unreadable supported-APIs body: {e}")))?;

    let config = decide_snat(&body);
    info!(?config, "SNAT feature decision made");
    fs::write(cache_path, serde_json::to_string(&config)?)?;
    Ok(config)
}

/// Outcome of the goal-state resolution for one pod.
#[derive(Debug)]
pub struct MultitenancyResult {
    pub nc: NetworkContainerResponse,
    pub result: CniResult,
    /// Host subnet the NC's primary interface identifier resolved to.
    pub host_subnet: IpNet,
    /// Infra-vnet allocation, when the configuration asked for one.
    pub infra: Option<IpamAddResult>,
}

/// Fetches and validates the pod's network container goal state.
///
/// # Errors
///
/// Returns [`Error::InterfaceNotFound`] when the primary interface
/// identifier matches no host subnet, [`Error::SnatIpMissing`] when
/// SNAT-on-host has no SNAT range, [`Error::SubnetOverlap`] when the infra
/// vnet space collides with a customer vnet, or a downstream error.
pub fn get_multitenancy_network_config(
    cns: &dyn CnsClient,
    platform: &dyn PlatformOps,
    infra_invoker: &dyn IpamInvoker,
    conf: &NetworkConfig,
    args: &CmdArgs,
) -> Result<MultitenancyResult, Error> {
    let pod = args.pod_info()?;
    let query_name = if conf.enable_exact_match_for_pod_name {
        pod.pod_name.clone()
    } else {
        pod.name_without_suffix()
    };
    let context = serde_json::to_vec(&PodInfo {
        pod_name: query_name,
        pod_namespace: pod.pod_namespace.clone(),
        ..PodInfo::default()
    })?;

    let nc = cns.get_network_configuration(&context)?;
    debug!(nc = %nc.network_container_id, "goal state fetched");

    let host_subnet = match_primary_interface(platform, &nc.primary_interface_identifier)?;

    if conf.enable_snat_on_host && nc.local_ip_configuration.ip_subnet.ip_address.is_empty() {
        return Err(Error::SnatIpMissing(format!(
            "SNAT on host requested but NC {} carries no local IP configuration",
            nc.network_container_id
        )));
    }

    let mut infra = None;
    if conf.enable_infra_vnet {
        let space = conf
            .infra_vnet_address_space
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::InvalidConfig("infra vnet enabled without an address space".to_string())
            })?;
        let infra_net = IpNet::from_str(space)
            .map_err(|e| Error::InvalidConfig(format!("bad infra vnet space {space}: {e}")))?;
        check_cnet_overlap(&infra_net, &nc)?;

        let mut infra_conf = conf.clone();
        infra_conf.ipam.subnet = Some(space.to_string());
        infra = Some(infra_invoker.add(&IpamAddConfig {
            conf: &infra_conf,
            args,
        })?);
    }

    Ok(MultitenancyResult {
        result: nc_to_result(&nc)?,
        nc,
        host_subnet,
        infra,
    })
}

/// Resolves the NC's primary interface identifier (an address or prefix on
/// the host) to the host subnet carrying it.
fn match_primary_interface(
    platform: &dyn PlatformOps,
    identifier: &str,
) -> Result<IpNet, Error> {
    let addr = identifier
        .split('/')
        .next()
        .and_then(|s| IpAddr::from_str(s).ok())
        .ok_or_else(|| {
            Error::InterfaceNotFound(format!("bad primary interface identifier {identifier}"))
        })?;

    platform
        .host_interfaces()?
        .iter()
        .filter_map(|iface| iface.primary_subnet())
        .find(|subnet| subnet.contains(&addr))
        .ok_or_else(|| {
            Error::InterfaceNotFound(format!(
                "no host subnet matches primary interface identifier {identifier}"
            ))
        })
}

fn check_cnet_overlap(infra: &IpNet, nc: &NetworkContainerResponse) -> Result<(), Error> {
    for space in &nc.cnet_address_space {
        let addr = IpAddr::from_str(&space.ip_address).map_err(|e| {
            Error::InvalidArgs(format!("bad customer vnet address {}: {e}", space.ip_address))
        })?;
        let cnet = IpNet::new(addr, space.prefix_length)
            .map_err(|e| Error::InvalidArgs(format!("bad customer vnet prefix: {e}")))?;
        if infra.contains(&cnet.network()) || cnet.contains(&infra.network()) {
            return Err(Error::SubnetOverlap(format!(
                "infra vnet {infra} overlaps customer vnet {cnet}"
            )));
        }
    }
    Ok(())
}

/// Converts the NC descriptor into the result document shape.
fn nc_to_result(nc: &NetworkContainerResponse) -> Result<CniResult, Error> {
    let subnet = &nc.ip_configuration.ip_subnet;
    let addr = IpAddr::from_str(&subnet.ip_address)
        .map_err(|e| Error::InvalidArgs(format!("bad NC address {}: {e}", subnet.ip_address)))?;
    let net = IpNet::new(addr, subnet.prefix_length)
        .map_err(|e| Error::InvalidArgs(format!("bad NC prefix: {e}")))?;

    let gateway = (!nc.ip_configuration.gateway_ip_address.is_empty())
        .then(|| nc.ip_configuration.gateway_ip_address.clone());

    Ok(CniResult {
        ips: vec![IpConfig {
            interface: None,
            address: net.to_string(),
            gateway,
        }],
        routes: Vec::new(),
        dns: (!nc.ip_configuration.dns_servers.is_empty()).then(|| Dns {
            nameservers: nc.ip_configuration.dns_servers.clone(),
            ..Dns::default()
        }),
        ..CniResult::default()
    })
}

/// Derives the sandbox routes for a multi-tenant endpoint: the default route
/// through the SNAT gateway or the NC gateway, the platform DNS `/32`
/// through the SNAT gateway when the node SNATs DNS, and the infra-vnet
/// route through the infra interface.
///
/// # Errors
///
/// Returns [`Error::InvalidArgs`] when the goal state carries an unusable
/// gateway.
pub fn setup_routing_for_multitenancy(
    nc: &NetworkContainerResponse,
    snat: SnatConfig,
    snat_on_host_requested: bool,
    infra: Option<(IpNet, &str)>,
) -> Result<Vec<RouteEntry>, Error> {
    let mut routes = Vec::new();
    let default_dst = IpNet::from_str("0.0.0.0/0").map_err(|e| Error::InvalidArgs(e.to_string()))?;

    let snat_gateway = &nc.local_ip_configuration.gateway_ip_address;
    let snat_on_host = snat_on_host_requested && snat.enable_snat_on_host;

    if snat_on_host {
        let gw = parse_gateway(snat_gateway, "SNAT gateway")?;
        routes.push(RouteEntry {
            dst: default_dst,
            gw: Some(gw),
            dev: None,
        });
    } else {
        let gw = parse_gateway(&nc.ip_configuration.gateway_ip_address, "NC gateway")?;
        routes.push(RouteEntry {
            dst: default_dst,
            gw: Some(gw),
            dev: None,
        });
        if snat.enable_snat_for_dns {
            let gw = parse_gateway(snat_gateway, "SNAT gateway")?;
            let dns_dst = IpNet::from_str(&format!("{AZURE_DNS_IP}/32"))
                .map_err(|e| Error::InvalidArgs(e.to_string()))?;
            routes.push(RouteEntry {
                dst: dns_dst,
                gw: Some(gw),
                dev: None,
            });
        }
    }

    if let Some((space, ifname)) = infra {
        routes.push(RouteEntry {
            dst: space,
            gw: None,
            dev: Some(ifname.to_string()),
        });
    }

    Ok(routes)
}

fn parse_gateway(raw: &str, what: &str) -> Result<IpAddr, Error> {
    IpAddr::from_str(raw).map_err(|e| Error::InvalidArgs(format!("bad {what} {raw}: {e}")))
}
