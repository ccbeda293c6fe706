//! IPAM invoker backed by the node's network control service.
//!
//! Allocation is a localhost HTTP exchange keyed by pod identity. Besides
//! the pod address itself, the service's response carries the host facts the
//! endpoint builder needs: the host subnet carrying the allocation, the
//! VM-to-pod route and the NAT descriptors steering platform DNS and
//! metadata traffic. The route and NAT descriptors travel in the shared
//! options map.

use std::{collections::HashMap, net::IpAddr, str::FromStr};

use ipnet::IpNet;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    cns::{CnsClient, IpConfigRequest},
    error::Error,
    ipam::{IpamAddConfig, IpamAddResult, IpamInvoker, OPT_IPTABLES_RULES, OPT_ROUTES},
    platform::{IptablesOp, IptablesRule, RouteEntry},
    types::{CmdArgs, CniResult, IpConfig, NetworkConfig},
};

/// Platform DNS server reachable only through the virtual network.
pub const AZURE_DNS_IP: &str = "168.63.129.16";
/// Instance metadata service address.
pub const IMDS_IP: &str = "169.254.169.254";
/// Gateway substituted when the overlay goal state carries none.
pub const OVERLAY_GATEWAY: &str = "169.254.1.1";
/// NAT chain owned by this plugin.
pub const SWIFT_CHAIN: &str = "SWIFT";

const NAT_TABLE: &str = "nat";
const POSTROUTING_CHAIN: &str = "POSTROUTING";

/// [`IpamInvoker`] that allocates through a [`CnsClient`].
#[derive(Debug)]
pub struct CnsInvoker<C> {
    client: C,
}

impl<C: CnsClient> CnsInvoker<C> {
    #[must_use]
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn build_request(args: &CmdArgs) -> Result<IpConfigRequest, Error> {
        let pod_info = args.pod_info()?;
        Ok(IpConfigRequest {
            orchestrator_context: serde_json::to_value(&pod_info)?,
            pod_interface_id: format!("{}{}", args.container_id, args.ifname),
            infra_container_id: args.container_id.clone(),
        })
    }
}

impl<C: CnsClient> IpamInvoker for CnsInvoker<C> {
    fn add(&self, config: &IpamAddConfig<'_>) -> Result<IpamAddResult, Error> {
        let request = Self::build_request(config.args)?;
        debug!(pod_interface_id = %request.pod_interface_id, "requesting address from control service");
        let response = self.client.request_ip_config(&request)?;
        let info = &response.pod_ip_info;

        let pod_ip = IpAddr::from_str(&info.pod_ip_config.ip_address).map_err(|e| {
            Error::InvalidArgs(format!(
                "bad pod address {}: {e}",
                info.pod_ip_config.ip_address
            ))
        })?;
        let pod_net = IpNet::new(pod_ip, info.pod_ip_config.prefix_length)
            .map_err(|e| Error::InvalidArgs(format!("bad pod prefix: {e}")))?;

        let nc_config = &info.network_container_primary_ip_config;
        let overlay = config.conf.ipam.is_v4_overlay();
        let gateway = if nc_config.gateway_ip_address.is_empty() {
            if !overlay {
                return Err(Error::InvalidArgs(
                    "goal state carries no gateway".to_string(),
                ));
            }
            OVERLAY_GATEWAY.to_string()
        } else {
            nc_config.gateway_ip_address.clone()
        };

        let mut result = IpamAddResult {
            ipv4: Some(CniResult {
                ips: vec![IpConfig {
                    interface: None,
                    address: pod_net.to_string(),
                    gateway: Some(gateway),
                }],
                ..CniResult::default()
            }),
            ..IpamAddResult::default()
        };

        if !overlay {
            result.options = host_options(info)?;
            let host_subnet = &info.host_primary_ip_info.subnet;
            if !host_subnet.is_empty() {
                result.host_subnet = Some(host_subnet.parse().map_err(|e| {
                    Error::InvalidArgs(format!("bad host subnet {host_subnet}: {e}"))
                })?);
            }
        }
        Ok(result)
    }

    fn delete(
        &self,
        addresses: &[String],
        _conf: &NetworkConfig,
        args: &CmdArgs,
        _options: &HashMap<String, Value>,
    ) -> Result<(), Error> {
        // The service indexes allocations by pod identity, so release works
        // even when no address survived to the teardown path.
        if addresses.is_empty() {
            debug!("releasing by pod identity, no address on record");
        }
        let request = Self::build_request(args)?;
        self.client.release_ip_config(&request)
    }
}

/// Derives the endpoint-builder options from the goal state: the VM-to-pod
/// route and the NAT chain descriptors.
fn host_options(info: &crate::cns::PodIpInfo) -> Result<HashMap<String, Value>, Error> {
    let mut options = HashMap::new();

    let nc_primary = &info.network_container_primary_ip_config.ip_subnet;
    if nc_primary.ip_address.is_empty() {
        warn!("goal state carries no primary address, host options skipped");
        return Ok(options);
    }
    let nc_primary_ip = IpAddr::from_str(&nc_primary.ip_address)
        .map_err(|e| Error::InvalidArgs(format!("bad primary address: {e}")))?;
    let nc_subnet = IpNet::new(nc_primary_ip, nc_primary.prefix_length)
        .map_err(|e| Error::InvalidArgs(format!("bad primary prefix: {e}")))?
        .trunc();

    let host = &info.host_primary_ip_info;
    if !host.gateway.is_empty() {
        let host_gw = IpAddr::from_str(&host.gateway)
            .map_err(|e| Error::InvalidArgs(format!("bad host gateway: {e}")))?;
        // VM-to-pod traffic crosses the host gateway.
        let routes = vec![RouteEntry {
            dst: nc_subnet,
            gw: Some(host_gw),
            dev: None,
        }];
        options.insert(OPT_ROUTES.to_string(), serde_json::to_value(routes)?);
    }

    let mut rules = vec![
        IptablesRule {
            operation: IptablesOp::Create,
            table: NAT_TABLE.to_string(),
            chain: SWIFT_CHAIN.to_string(),
            params: String::new(),
        },
        IptablesRule {
            operation: IptablesOp::Append,
            table: NAT_TABLE.to_string(),
            chain: POSTROUTING_CHAIN.to_string(),
            params: format!("-j {SWIFT_CHAIN}"),
        },
    ];
    for protocol in ["udp", "tcp"] {
        rules.push(IptablesRule {
            operation: IptablesOp::Insert,
            table: NAT_TABLE.to_string(),
            chain: SWIFT_CHAIN.to_string(),
            params: format!(
                "-m addrtype ! --dst-type local -s {nc_subnet} -d {AZURE_DNS_IP} -p {protocol} --dport 53 -j SNAT --to {}",
                nc_primary.ip_address
            ),
        });
    }
    if !host.primary_ip.is_empty() {
        rules.push(IptablesRule {
            operation: IptablesOp::Insert,
            table: NAT_TABLE.to_string(),
            chain: SWIFT_CHAIN.to_string(),
            params: format!(
                "-m addrtype ! --dst-type local -s {nc_subnet} -d {IMDS_IP} -p tcp --dport 80 -j SNAT --to {}",
                host.primary_ip
            ),
        });
    }
    options.insert(OPT_IPTABLES_RULES.to_string(), serde_json::to_value(rules)?);

    Ok(options)
}
