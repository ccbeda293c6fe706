//! CNI command dispatcher.
//!
//! One [`Plugin`] value exists per invocation and owns every collaborator
//! for its lifetime: the platform capability set, the state store, the lock
//! and the client factories. It reads the CNI environment and stdin, takes
//! the process lock, routes ADD/DEL/GET/UPDATE, and writes the versioned
//! result (or the CNI error document) to stdout. There is no process-wide
//! state.

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::IpAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    cns::{CnsClient, HttpCnsClient},
    endpoint::{endpoint_id, host_ifname, EndpointRecord},
    error::Error,
    ipam::{option, IpamAddConfig, IpamAddResult, IpamInvoker, OPT_IPTABLES_RULES, OPT_ROUTES},
    ipam_cns::CnsInvoker,
    ipam_delegate::DelegatingInvoker,
    lock::{ProcessLock, DEFAULT_LOCK_TIMEOUT},
    multitenancy::{
        determine_snat_feature_on_host, get_multitenancy_network_config,
        setup_routing_for_multitenancy, SnatConfig, DEFAULT_NMA_URL, SNAT_CONFIG_FILE,
    },
    network::{NetworkManager, NetworkSpec},
    nns::{HttpNnsClient, NnsClient},
    platform::{DefaultPlatform, IptablesRule, PlatformOps, RouteEntry},
    policy::{policies_from_args, serialize_policies},
    store::KeyValueStore,
    types::{
        Cmd, CmdArgs, CniResult, ErrorResult, NetworkConfig, PodInfo, Route, CNI_ARGS,
        CNI_COMMAND, CNI_CONTAINERID, CNI_IFNAME, CNI_NETNS, CNI_PATH, IPAM_TYPE_CNS,
    },
    version::PluginInfo,
};

/// On-disk plugin identity; store and lock file names derive from it.
pub const PLUGIN_NAME: &str = "azure-vnet";
/// Default directory for state files.
pub const DEFAULT_RUNTIME_DIR: &str = "/var/run/azure-vnet";

const STORE_FILE: &str = "azure-vnet.json";

type CnsFactory = Box<dyn Fn(Option<&str>) -> Result<Box<dyn CnsClient>, Error>>;
type NnsFactory = Box<dyn Fn(Option<&str>) -> Result<Box<dyn NnsClient>, Error>>;

/// Reader/writer pair the dispatcher talks to; stdout carries the CNI
/// protocol, so logs must never go there.
pub struct Io {
    pub stdin: Box<dyn Read>,
    pub stdout: Box<dyn Write>,
}

impl Default for Io {
    fn default() -> Self {
        Self {
            stdin: Box::new(std::io::stdin()),
            stdout: Box::new(std::io::stdout()),
        }
    }
}

/// Deferred release actions, popped in reverse on the error path.
#[derive(Default)]
struct CleanupStack<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> CleanupStack<'a> {
    fn push(&mut self, action: impl FnOnce() + 'a) {
        self.actions.push(Box::new(action));
    }

    fn unwind(mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }

    fn disarm(mut self) {
        self.actions.clear();
    }
}

/// Multi-tenant facts the resolver pins onto the endpoint record.
#[derive(Default)]
struct TenancyAttachment {
    vlan_id: Option<u32>,
    infra_ip: Option<String>,
    network_container_id: Option<String>,
    enable_snat_for_dns: bool,
    allow_host_to_nc: bool,
    allow_nc_to_host: bool,
}

/// Per-invocation CNI plugin entry point.
pub struct Plugin {
    runtime_dir: PathBuf,
    lock_timeout: Duration,
    nma_url: String,
    version_info: PluginInfo,
    about: String,
    platform: Box<dyn PlatformOps>,
    cns_factory: CnsFactory,
    nns_factory: NnsFactory,
    io: Io,
}

impl Plugin {
    #[must_use]
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            nma_url: DEFAULT_NMA_URL.to_string(),
            version_info: PluginInfo::default(),
            about: format!("{PLUGIN_NAME} CNI plugin"),
            platform: Box::new(DefaultPlatform),
            cns_factory: Box::new(|url| {
                Ok(Box::new(HttpCnsClient::new(url)?) as Box<dyn CnsClient>)
            }),
            nns_factory: Box::new(|url| {
                Ok(Box::new(HttpNnsClient::new(url)?) as Box<dyn NnsClient>)
            }),
            io: Io::default(),
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Box<dyn PlatformOps>) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_cns_factory(mut self, factory: CnsFactory) -> Self {
        self.cns_factory = factory;
        self
    }

    #[must_use]
    pub fn with_nns_factory(mut self, factory: NnsFactory) -> Self {
        self.nns_factory = factory;
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_nma_url(mut self, url: impl Into<String>) -> Self {
        self.nma_url = url.into();
        self
    }

    #[must_use]
    pub fn with_io(mut self, io: Io) -> Self {
        self.io = io;
        self
    }

    /// Runs one CNI invocation against the process environment.
    ///
    /// # Errors
    ///
    /// Returns the operation's error after the corresponding CNI document
    /// has been written to stdout.
    pub fn run(&mut self) -> Result<(), Error> {
        self.run_with_env(&|key| std::env::var(key).ok())
    }

    /// Runs one invocation with an injected environment, the seam the tests
    /// drive.
    ///
    /// # Errors
    ///
    /// See [`Plugin::run`].
    pub fn run_with_env(
        &mut self,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<(), Error> {
        let cmd = Cmd::from_str(&env(CNI_COMMAND).unwrap_or_default())?;
        match cmd {
            Cmd::Version => {
                let out = self.version_info.version()?;
                self.write_out(out.as_bytes())
            }
            Cmd::UnSet => {
                let out = self.version_info.about(Some(&self.about));
                self.write_out(out.as_bytes())
            }
            _ => self.run_command(cmd, env),
        }
    }

    fn run_command(
        &mut self,
        cmd: Cmd,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<(), Error> {
        // Rejections before dispatch still owe the runtime an error
        // document; until the config parses, it is stamped with the
        // plugin's default version.
        let mut cni_version = self.version_info.default_version().to_string();
        let prepared = (|| -> Result<(CmdArgs, NetworkConfig), Error> {
            let args = self.read_args(env)?;
            let conf =
                NetworkConfig::parse(&args.stdin_data, self.version_info.default_version())?;
            cni_version = conf.cni_version.clone();
            self.version_info.validate(&conf.cni_version)?;
            preflight(cmd, &args)?;
            Ok((args, conf))
        })();
        let (args, conf) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, details = %e.details(), "invocation rejected");
                self.write_error(&cni_version, &e)?;
                return Err(e);
            }
        };

        let pod = args.pod_info().unwrap_or_default();
        info!(
            cmd = <&str>::from(cmd),
            container = %args.container_id,
            pod = %pod.pod_name,
            namespace = %pod.pod_namespace,
            network = %conf.name,
            "processing invocation"
        );

        let mut partial = CniResult::default();
        match self.dispatch(cmd, &conf, &args, &mut partial) {
            Ok(result) => {
                let versioned = self
                    .version_info
                    .into_versioned(&conf.cni_version, result);
                let out = serde_json::to_vec(&versioned)?;
                self.write_out(&out)
            }
            Err(e) => {
                error!(error = %e, details = %e.details(), "invocation failed");
                if cmd == Cmd::Add && !partial.ips.is_empty() {
                    // Emit what was built so the caller can see (and clean
                    // up) the partial attachment.
                    let versioned = self
                        .version_info
                        .into_versioned(&conf.cni_version, partial);
                    let out = serde_json::to_vec(&versioned)?;
                    self.write_out(&out)?;
                } else {
                    self.write_error(&conf.cni_version, &e)?;
                }
                Err(e)
            }
        }
    }

    fn write_error(&mut self, cni_version: &str, e: &Error) -> Result<(), Error> {
        let doc = ErrorResult {
            cni_version: cni_version.to_string(),
            code: e.into(),
            msg: e.to_string(),
            details: e.details(),
        };
        let out = serde_json::to_vec(&doc)?;
        self.write_out(&out)
    }

    fn write_out(&mut self, data: &[u8]) -> Result<(), Error> {
        self.io
            .stdout
            .write_all(data)
            .map_err(|e| Error::IoFailure(e.to_string()))
    }

    fn read_args(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<CmdArgs, Error> {
        let mut stdin_data = Vec::new();
        self.io
            .stdin
            .read_to_end(&mut stdin_data)
            .map_err(|e| Error::IoFailure(e.to_string()))?;

        Ok(CmdArgs {
            container_id: env(CNI_CONTAINERID).unwrap_or_default(),
            netns: env(CNI_NETNS).filter(|n| !n.is_empty()).map(PathBuf::from),
            ifname: env(CNI_IFNAME).unwrap_or_default(),
            args: env(CNI_ARGS),
            path: env(CNI_PATH)
                .unwrap_or_default()
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
            stdin_data,
        })
    }

    fn dispatch(
        &self,
        cmd: Cmd,
        conf: &NetworkConfig,
        args: &CmdArgs,
        partial: &mut CniResult,
    ) -> Result<CniResult, Error> {
        if conf.is_baremetal() {
            return self.baremetal(cmd, conf, args);
        }

        let store_path = self.runtime_dir.join(STORE_FILE);
        let mut store = {
            let mut lock = ProcessLock::new(
                KeyValueStore::open(&store_path)?.lock_path(),
            );
            let last_reboot = self.platform.last_reboot_time().ok();
            lock.acquire(self.lock_timeout, last_reboot)?;
            // The lock guards the whole invocation; keep it alive with the
            // store it protects.
            LockedStore {
                store: KeyValueStore::open(&store_path)?,
                _lock: lock,
            }
        };
        let mut manager = NetworkManager::restore(&store.store)?;

        let outcome = match cmd {
            Cmd::Add => self.add(conf, args, &mut manager, partial),
            Cmd::Del => self.del(conf, args, &mut manager),
            Cmd::Get => self.get(conf, args, &manager),
            Cmd::Update => self.update(conf, args, &mut manager),
            Cmd::Version | Cmd::UnSet => unreachable!("handled before dispatch"),
        };

        // Persist whatever the handler managed to do, even on failure.
        manager.save(&mut store.store)?;
        store.store.flush()?;
        outcome
    }

    fn baremetal(&self, cmd: Cmd, conf: &NetworkConfig, args: &CmdArgs) -> Result<CniResult, Error> {
        let pod = args.pod_info()?;
        let netns = args
            .netns
            .as_ref()
            .map(|n| n.display().to_string())
            .unwrap_or_default();
        let nns = (self.nns_factory)(None)?;
        match cmd {
            Cmd::Add => nns.add_container(&pod.pod_name, &pod.pod_namespace, &netns),
            Cmd::Del => {
                nns.delete_container(&pod.pod_name, &pod.pod_namespace, &netns)?;
                Ok(CniResult::default())
            }
            _ => Err(Error::InvalidConfig(format!(
                "{} is not supported in baremetal mode",
                <&str>::from(cmd)
            ))),
        }
    }

    fn invoker(&self, conf: &NetworkConfig) -> Result<Box<dyn IpamInvoker>, Error> {
        if conf.ipam.r#type == IPAM_TYPE_CNS {
            let client = (self.cns_factory)(conf.cns_url.as_deref())?;
            Ok(Box::new(CnsInvoker::new(client)))
        } else {
            Ok(Box::new(DelegatingInvoker::new(&self.runtime_dir)))
        }
    }

    fn snat_decision(&self, conf: &NetworkConfig) -> Result<SnatConfig, Error> {
        if !conf.multi_tenancy {
            return Ok(SnatConfig::default());
        }
        determine_snat_feature_on_host(
            &self.runtime_dir.join(SNAT_CONFIG_FILE),
            &self.nma_url,
        )
    }

    fn add(
        &self,
        conf: &NetworkConfig,
        args: &CmdArgs,
        manager: &mut NetworkManager,
        partial: &mut CniResult,
    ) -> Result<CniResult, Error> {
        let pod = args.pod_info()?;
        let endpoint_id = endpoint_id(&args.container_id, &args.ifname);

        // Re-attach: transparent mode returns the surviving endpoint's
        // result; other modes treat the duplicate as an error.
        if manager.has_network(&conf.name) {
            if let Ok(existing) = manager.endpoint(&conf.name, &endpoint_id) {
                if conf.mode == crate::types::Mode::Transparent {
                    info!(endpoint = %endpoint_id, "returning existing attachment");
                    return Ok(existing.to_cni_result());
                }
                return Err(Error::EndpointExists(format!(
                    "endpoint {endpoint_id} already exists in network {}",
                    conf.name
                )));
            }
        }

        let mut cleanups = CleanupStack::default();

        let (ipam_result, extra_routes, tenancy) = if conf.multi_tenancy {
            let cns = (self.cns_factory)(conf.cns_url.as_deref())?;
            let snat = self.snat_decision(conf)?;
            let infra_invoker = DelegatingInvoker::new(&self.runtime_dir);
            let resolved = get_multitenancy_network_config(
                &cns, &*self.platform, &infra_invoker, conf, args,
            )?;

            if let Some(infra) = &resolved.infra {
                let addresses = infra.addresses();
                let runtime_dir = self.runtime_dir.clone();
                cleanups.push(move || {
                    let invoker = DelegatingInvoker::new(runtime_dir);
                    if let Err(e) = invoker.delete(&addresses, conf, args, &HashMap::new()) {
                        warn!(error = %e, "failed to release infra address during unwind");
                    }
                });
            }

            let infra_route = resolved
                .infra
                .as_ref()
                .and_then(|_| conf.infra_vnet_address_space.as_deref())
                .and_then(|space| space.parse().ok())
                .map(|space| (space, conf.master.clone().unwrap_or_default()));
            let routes = setup_routing_for_multitenancy(
                &resolved.nc,
                snat,
                conf.enable_snat_on_host,
                infra_route
                    .as_ref()
                    .map(|(space, ifname)| (*space, ifname.as_str())),
            )?;
            let tenancy = TenancyAttachment {
                vlan_id: Some(resolved.nc.multi_tenancy_info.id).filter(|id| *id != 0),
                infra_ip: resolved
                    .infra
                    .as_ref()
                    .and_then(|infra| infra.addresses().into_iter().next()),
                network_container_id: (!resolved.nc.network_container_id.is_empty())
                    .then(|| resolved.nc.network_container_id.clone()),
                enable_snat_for_dns: snat.enable_snat_for_dns,
                allow_host_to_nc: resolved.nc.allow_host_to_nc_communication,
                allow_nc_to_host: resolved.nc.allow_nc_to_host_communication,
            };
            (
                IpamAddResult {
                    ipv4: Some(resolved.result),
                    host_subnet: Some(resolved.host_subnet),
                    ..IpamAddResult::default()
                },
                routes,
                tenancy,
            )
        } else {
            let invoker = self.invoker(conf)?;
            let result = invoker.add(&IpamAddConfig { conf, args })?;
            let addresses = result.addresses();
            let release_options = result.options.clone();
            cleanups.push(move || {
                let released = self
                    .invoker(conf)
                    .and_then(|invoker| invoker.delete(&addresses, conf, args, &release_options));
                if let Err(e) = released {
                    warn!(error = %e, "failed to release addresses during unwind");
                }
            });
            (result, Vec::new(), TenancyAttachment::default())
        };

        let outcome = self.build_endpoint(
            conf,
            args,
            &pod,
            manager,
            &endpoint_id,
            &ipam_result,
            extra_routes,
            tenancy,
            partial,
        );
        match outcome {
            Ok(result) => {
                cleanups.disarm();
                Ok(result)
            }
            Err(e) => {
                cleanups.unwind();
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_endpoint(
        &self,
        conf: &NetworkConfig,
        args: &CmdArgs,
        pod: &PodInfo,
        manager: &mut NetworkManager,
        endpoint_id: &str,
        ipam_result: &IpamAddResult,
        extra_routes: Vec<RouteEntry>,
        tenancy: TenancyAttachment,
        partial: &mut CniResult,
    ) -> Result<CniResult, Error> {
        let mut result = CniResult::default();
        if let Some(ipv4) = &ipam_result.ipv4 {
            result.merge(ipv4.clone());
        }
        if let Some(ipv6) = &ipam_result.ipv6 {
            result.merge(ipv6.clone());
        }
        *partial = result.clone();

        let subnets: Vec<ipnet::IpNet> = result
            .ips
            .iter()
            .filter_map(|ip| ip.address.parse::<ipnet::IpNet>().ok())
            .map(|net| net.trunc())
            .collect();

        if !manager.has_network(&conf.name) {
            manager.create_network(
                &*self.platform,
                NetworkSpec {
                    id: conf.name.clone(),
                    mode: conf.mode,
                    master: conf.master.clone(),
                    bridge: conf.bridge.clone(),
                    subnets: subnets.clone(),
                    host_subnet: ipam_result.host_subnet,
                    dns: conf.dns.clone().unwrap_or_default(),
                    vlan_id: tenancy.vlan_id,
                    enable_snat_on_host: conf.enable_snat_on_host,
                },
            )?;
        }

        // Host-level plumbing requested by the allocator.
        if let Some(rules) = option::<Vec<IptablesRule>>(&ipam_result.options, OPT_IPTABLES_RULES)? {
            self.platform.apply_iptables_rules(&rules)?;
        }
        if let Some(host_routes) = option::<Vec<RouteEntry>>(&ipam_result.options, OPT_ROUTES)? {
            self.platform.add_routes(None, &host_routes)?;
        }

        let mut routes: Vec<RouteEntry> = result
            .routes
            .iter()
            .filter_map(|r| {
                Some(RouteEntry {
                    dst: r.dst.parse().ok()?,
                    gw: r.gw.as_deref().and_then(|g| g.parse().ok()),
                    dev: None,
                })
            })
            .collect();
        routes.extend(extra_routes);

        // Synthesize the default route through the allocated gateway when no
        // collaborator supplied one.
        for ip in &result.ips {
            let Some(gw) = ip.gateway.as_deref().and_then(|g| g.parse::<IpAddr>().ok()) else {
                continue;
            };
            let dst: ipnet::IpNet = if gw.is_ipv4() { "0.0.0.0/0" } else { "::/0" }
                .parse()
                .map_err(|e: ipnet::AddrParseError| Error::InvalidArgs(e.to_string()))?;
            if !routes.iter().any(|r| r.dst == dst) {
                routes.push(RouteEntry {
                    dst,
                    gw: Some(gw),
                    dev: None,
                });
            }
        }

        let dns = conf
            .runtime_config
            .as_ref()
            .and_then(|rc| rc.dns.clone())
            .filter(|dns| !dns.is_empty())
            .or_else(|| conf.dns.clone())
            .or_else(|| result.dns.clone())
            .unwrap_or_default();

        let record = EndpointRecord {
            id: endpoint_id.to_string(),
            container_id: args.container_id.clone(),
            pod_name: pod.pod_name.clone(),
            pod_namespace: pod.pod_namespace.clone(),
            ifname: args.ifname.clone(),
            host_ifname: host_ifname(
                conf.mode,
                &conf.name,
                &args.container_id,
                &args.ifname,
                pod,
            ),
            netns: args.netns.clone(),
            mac: None,
            ip_addresses: result.ips.iter().map(|ip| ip.address.clone()).collect(),
            gateways: result
                .ips
                .iter()
                .filter_map(|ip| ip.gateway.clone())
                .collect(),
            routes: routes.clone(),
            dns: dns.clone(),
            vlan_id: tenancy.vlan_id,
            enable_snat_on_host: conf.enable_snat_on_host,
            enable_snat_for_dns: tenancy.enable_snat_for_dns,
            infra_ip: tenancy.infra_ip,
            network_container_id: tenancy.network_container_id,
            allow_host_to_nc_communication: tenancy.allow_host_to_nc,
            allow_nc_to_host_communication: tenancy.allow_nc_to_host,
            policies: policies_from_args(&conf.additional_args),
        };

        let record = manager.create_endpoint(&*self.platform, &conf.name, record)?;

        result.routes = routes
            .iter()
            .map(|r| Route {
                dst: r.dst.to_string(),
                gw: r.gw.map(|g| g.to_string()),
            })
            .collect();
        if !dns.is_empty() {
            result.dns = Some(dns);
        }
        if let Some(mac) = &record.mac {
            result.interfaces = vec![crate::types::Interface {
                name: record.ifname.clone(),
                mac: mac.clone(),
                sandbox: record.netns.as_ref().map(|n| n.display().to_string()),
            }];
            for ip in &mut result.ips {
                ip.interface = Some(0);
            }
        }
        *partial = result.clone();
        Ok(result)
    }

    fn del(
        &self,
        conf: &NetworkConfig,
        args: &CmdArgs,
        manager: &mut NetworkManager,
    ) -> Result<CniResult, Error> {
        let invoker = self.invoker(conf)?;
        let endpoint_id = endpoint_id(&args.container_id, &args.ifname);

        let outcome = (|| -> Result<(), Error> {
            let deleted = manager.delete_endpoint(&*self.platform, &conf.name, &endpoint_id)?;
            if let Some(record) = deleted {
                invoker.delete(&record.ip_addresses, conf, args, &HashMap::new())?;
                // The infra-vnet address was allocated through delegation
                // and goes back the same way.
                if let Some(infra_ip) = &record.infra_ip {
                    DelegatingInvoker::new(&self.runtime_dir).delete(
                        &[infra_ip.clone()],
                        conf,
                        args,
                        &HashMap::new(),
                    )?;
                }
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => Ok(CniResult::default()),
            Err(e) => {
                // Dangling pool state may survive the failure; ask the
                // allocator to release whatever it can attribute to us.
                if let Err(release_err) = invoker.delete(&[], conf, args, &HashMap::new()) {
                    warn!(error = %release_err, "dangling release failed");
                }
                if e.is_not_found() {
                    info!(endpoint = %endpoint_id, "nothing to delete");
                    Ok(CniResult::default())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn get(
        &self,
        conf: &NetworkConfig,
        args: &CmdArgs,
        manager: &NetworkManager,
    ) -> Result<CniResult, Error> {
        let endpoint_id = endpoint_id(&args.container_id, &args.ifname);
        Ok(manager.endpoint(&conf.name, &endpoint_id)?.to_cni_result())
    }

    fn update(
        &self,
        conf: &NetworkConfig,
        args: &CmdArgs,
        manager: &mut NetworkManager,
    ) -> Result<CniResult, Error> {
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

        let cns = (self.cns_factory)(conf.cns_url.as_deref())?;
        let nc = cns.get_network_configuration(&context)?;
        let snat = self.snat_decision(conf)?;
        let routes =
            setup_routing_for_multitenancy(&nc, snat, conf.enable_snat_on_host, None)?;

        manager.update_endpoint(
            &*self.platform,
            &conf.name,
            &pod,
            conf.enable_exact_match_for_pod_name,
            routes,
        )?;

        let policies = policies_from_args(&conf.additional_args);
        if !policies.is_empty() {
            let native = serialize_policies(&policies)?;
            let record = manager.endpoint_by_pod_details(
                &conf.name,
                &pod,
                conf.enable_exact_match_for_pod_name,
            )?;
            self.platform.apply_endpoint_policies(&record.id, &native)?;
        }
        Ok(CniResult::default())
    }
}

struct LockedStore {
    store: KeyValueStore,
    _lock: ProcessLock,
}

/// Rejects invocations missing the arguments every handler depends on.
fn preflight(cmd: Cmd, args: &CmdArgs) -> Result<(), Error> {
    if args.container_id.is_empty() {
        return Err(Error::ArgsMissing("container id is empty".to_string()));
    }
    if args.ifname.is_empty() {
        return Err(Error::ArgsMissing("interface name is empty".to_string()));
    }
    if matches!(cmd, Cmd::Add | Cmd::Update) {
        let pod = args.pod_info()?;
        if pod.pod_name.is_empty() {
            return Err(Error::ArgsMissing("pod name is empty".to_string()));
        }
        if pod.pod_namespace.is_empty() {
            return Err(Error::ArgsMissing("pod namespace is empty".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell, collections::HashMap, fs, io::Write, os::unix::fs::PermissionsExt, rc::Rc,
    };

    use assert_json_diff::assert_json_include;
    use serde_json::{json, Value};

    use crate::{
        cns::{
            CnsClient, HostIpInfo, IpConfigRequest, IpConfigResponse, IpConfiguration, IpSubnet,
            MultiTenancyInfo, NetworkContainerResponse, PodIpInfo,
        },
        error::Error,
        network::NetworkManager,
        nns::NnsClient,
        platform::testing::FakePlatform,
        store::KeyValueStore,
        types::{CniResult, IpConfig},
    };

    use super::{Io, Plugin};

    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FakeCns {
        released: Rc<RefCell<u32>>,
        nc: Option<NetworkContainerResponse>,
    }

    impl CnsClient for FakeCns {
        fn request_ip_config(&self, _req: &IpConfigRequest) -> Result<IpConfigResponse, Error> {
            Ok(IpConfigResponse {
                pod_ip_info: PodIpInfo {
                    pod_ip_config: IpSubnet {
                        ip_address: "10.240.0.10".to_string(),
                        prefix_length: 16,
                    },
                    network_container_primary_ip_config: IpConfiguration {
                        ip_subnet: IpSubnet {
                            ip_address: "10.240.0.4".to_string(),
                            prefix_length: 16,
                        },
                        gateway_ip_address: "10.240.0.1".to_string(),
                        dns_servers: Vec::new(),
                    },
                    host_primary_ip_info: HostIpInfo {
                        gateway: "10.224.0.1".to_string(),
                        primary_ip: "10.224.0.5".to_string(),
                        subnet: "10.224.0.0/16".to_string(),
                    },
                },
                ..IpConfigResponse::default()
            })
        }

        fn release_ip_config(&self, _req: &IpConfigRequest) -> Result<(), Error> {
            *self.released.borrow_mut() += 1;
            Ok(())
        }

        fn get_network_configuration(
            &self,
            _orchestrator_context: &[u8],
        ) -> Result<NetworkContainerResponse, Error> {
            self.nc
                .clone()
                .ok_or_else(|| Error::ControlService("no goal state configured".to_string()))
        }
    }

    struct FakeNns {
        calls: Rc<RefCell<u32>>,
    }

    impl NnsClient for FakeNns {
        fn add_container(
            &self,
            _pod_name: &str,
            _pod_namespace: &str,
            _netns_path: &str,
        ) -> Result<CniResult, Error> {
            *self.calls.borrow_mut() += 1;
            Ok(CniResult {
                ips: vec![IpConfig {
                    interface: None,
                    address: "192.168.5.10/24".to_string(),
                    gateway: Some("192.168.5.1".to_string()),
                }],
                ..CniResult::default()
            })
        }

        fn delete_container(
            &self,
            _pod_name: &str,
            _pod_namespace: &str,
            _netns_path: &str,
        ) -> Result<(), Error> {
            *self.calls.borrow_mut() += 1;
            Ok(())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        out: Rc<RefCell<Vec<u8>>>,
        released: Rc<RefCell<u32>>,
        nns_calls: Rc<RefCell<u32>>,
        fail_create: bool,
        nc: Option<NetworkContainerResponse>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                out: Rc::default(),
                released: Rc::default(),
                nns_calls: Rc::default(),
                fail_create: false,
                nc: None,
            }
        }

        fn run(&self, cmd: &str, conf: &Value) -> Result<(), Error> {
            self.run_with_args(cmd, conf, "K8S_POD_NAME=pod1;K8S_POD_NAMESPACE=ns1")
        }

        fn run_with_args(&self, cmd: &str, conf: &Value, cni_args: &str) -> Result<(), Error> {
            self.out.borrow_mut().clear();
            let mut platform = FakePlatform::with_interface("eth0", &["10.240.0.4/16"]);
            platform.fail_create_endpoint = self.fail_create;

            let released = Rc::clone(&self.released);
            let nc = self.nc.clone();
            let nns_calls = Rc::clone(&self.nns_calls);
            let mut plugin = Plugin::new(self.dir.path())
                .with_platform(Box::new(platform))
                .with_cns_factory(Box::new(move |_url| {
                    Ok(Box::new(FakeCns {
                        released: Rc::clone(&released),
                        nc: nc.clone(),
                    }) as Box<dyn CnsClient>)
                }))
                .with_nns_factory(Box::new(move |_url| {
                    Ok(Box::new(FakeNns {
                        calls: Rc::clone(&nns_calls),
                    }) as Box<dyn NnsClient>)
                }))
                .with_io(Io {
                    stdin: Box::new(std::io::Cursor::new(serde_json::to_vec(conf).unwrap())),
                    stdout: Box::new(SharedBuf(Rc::clone(&self.out))),
                });

            let cni_path = self.dir.path().display().to_string();
            let vars: HashMap<String, String> = [
                ("CNI_COMMAND", cmd),
                ("CNI_CONTAINERID", "abc123"),
                ("CNI_IFNAME", "eth0"),
                ("CNI_NETNS", "/var/run/netns/cni-1"),
                ("CNI_ARGS", cni_args),
                ("CNI_PATH", cni_path.as_str()),
            ]
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
            plugin.run_with_env(&move |key| vars.get(key).cloned())
        }

        fn output(&self) -> Value {
            serde_json::from_slice(&self.out.borrow()).unwrap()
        }

        fn restore_manager(&self) -> NetworkManager {
            let store = KeyValueStore::open(self.dir.path().join("azure-vnet.json")).unwrap();
            NetworkManager::restore(&store).unwrap()
        }
    }

    fn swift_conf() -> Value {
        json!({
            "cniVersion": "1.0.0",
            "name": "azure",
            "type": "azure-vnet",
            "ipam": {"type": "azure-cns"}
        })
    }

    fn tenant_nc() -> NetworkContainerResponse {
        NetworkContainerResponse {
            network_container_id: "nc1".to_string(),
            primary_interface_identifier: "10.240.0.4/16".to_string(),
            multi_tenancy_info: MultiTenancyInfo {
                encap_type: "Vlan".to_string(),
                id: 7,
            },
            ip_configuration: IpConfiguration {
                ip_subnet: IpSubnet {
                    ip_address: "10.0.1.10".to_string(),
                    prefix_length: 24,
                },
                gateway_ip_address: "10.0.1.1".to_string(),
                dns_servers: Vec::new(),
            },
            local_ip_configuration: IpConfiguration {
                ip_subnet: IpSubnet {
                    ip_address: "169.254.0.4".to_string(),
                    prefix_length: 17,
                },
                gateway_ip_address: "169.254.0.1".to_string(),
                dns_servers: Vec::new(),
            },
            cnet_address_space: vec![IpSubnet {
                ip_address: "10.0.0.0".to_string(),
                prefix_length: 8,
            }],
            ..NetworkContainerResponse::default()
        }
    }

    #[test]
    fn test_version_reports_supported_versions() {
        let harness = Harness::new();
        harness.run("VERSION", &json!({})).unwrap();
        let doc = harness.output();
        assert_eq!(doc["cniVersion"], "1.0.0");
        let supported = doc["supportedVersions"].as_array().unwrap();
        assert!(supported.iter().any(|v| v == "0.3.0"));
        assert!(supported.iter().any(|v| v == "1.0.0"));
    }

    #[test]
    fn test_add_attaches_and_persists() {
        let harness = Harness::new();
        harness.run("ADD", &swift_conf()).unwrap();

        let doc = harness.output();
        assert_json_include!(
            actual: doc,
            expected: json!({
                "cniVersion": "1.0.0",
                "ips": [{"address": "10.240.0.10/16", "gateway": "10.240.0.1"}],
                "routes": [{"dst": "0.0.0.0/0", "gw": "10.240.0.1"}],
                "interfaces": [{"mac": "aa:bb:cc:dd:ee:ff"}],
            })
        );

        let manager = harness.restore_manager();
        assert_eq!(manager.network("azure").unwrap().master, "eth0");
        let endpoint = manager.endpoint("azure", "abc123-eth0").unwrap();
        assert_eq!(endpoint.pod_name, "pod1");
        assert_eq!(endpoint.ip_addresses, ["10.240.0.10/16"]);
    }

    #[test]
    fn test_add_duplicate_endpoint_rejected() {
        let harness = Harness::new();
        harness.run("ADD", &swift_conf()).unwrap();
        let err = harness.run("ADD", &swift_conf()).unwrap_err();
        assert_eq!(u32::from(&err), 107);
        assert_eq!(harness.output()["code"], 107);
    }

    #[test]
    fn test_add_transparent_reattach_returns_existing() {
        let harness = Harness::new();
        let mut conf = swift_conf();
        conf["mode"] = json!("transparent");
        harness.run("ADD", &conf).unwrap();
        harness.run("ADD", &conf).unwrap();

        let doc = harness.output();
        assert_eq!(doc["ips"][0]["address"], "10.240.0.10/16");
        // The second attach allocated nothing new.
        let manager = harness.restore_manager();
        assert_eq!(
            manager.endpoint("azure", "abc123-eth0").unwrap().host_ifname,
            "ns1.pod1"
        );
    }

    #[test]
    fn test_add_failure_emits_partial_result_and_releases() {
        let mut harness = Harness::new();
        harness.fail_create = true;
        let err = harness.run("ADD", &swift_conf()).unwrap_err();
        assert_eq!(u32::from(&err), 104);

        // The allocated address is reported so the runtime can see the
        // partial attachment, and the pool allocation is rolled back.
        let doc = harness.output();
        assert_eq!(doc["ips"][0]["address"], "10.240.0.10/16");
        assert_eq!(*harness.released.borrow(), 1);
    }

    #[test]
    fn test_del_releases_and_is_idempotent() {
        let harness = Harness::new();
        harness.run("ADD", &swift_conf()).unwrap();

        harness.run("DEL", &swift_conf()).unwrap();
        assert_eq!(harness.output(), json!({"cniVersion": "1.0.0"}));
        assert_eq!(*harness.released.borrow(), 1);

        // A second DEL finds nothing and still succeeds.
        harness.run("DEL", &swift_conf()).unwrap();
        assert_eq!(*harness.released.borrow(), 1);
    }

    #[test]
    fn test_del_unknown_network_releases_dangling_state() {
        let harness = Harness::new();
        harness.run("DEL", &swift_conf()).unwrap();
        // Nothing on record, but the allocator is still asked to release by
        // pod identity.
        assert_eq!(*harness.released.borrow(), 1);
    }

    #[test]
    fn test_get_returns_stored_endpoint() {
        let harness = Harness::new();
        harness.run("ADD", &swift_conf()).unwrap();
        harness.run("GET", &swift_conf()).unwrap();
        assert_eq!(harness.output()["ips"][0]["address"], "10.240.0.10/16");
    }

    #[test]
    fn test_get_unknown_endpoint_fails() {
        let harness = Harness::new();
        let err = harness.run("GET", &swift_conf()).unwrap_err();
        assert_eq!(u32::from(&err), 108);
    }

    #[test]
    fn test_preflight_missing_pod_identity() {
        let harness = Harness::new();
        let err = harness
            .run_with_args("ADD", &swift_conf(), "K8S_POD_NAMESPACE=ns1")
            .unwrap_err();
        assert_eq!(u32::from(&err), 4);
        assert_eq!(harness.output()["code"], 4);
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let harness = Harness::new();
        let mut conf = swift_conf();
        conf["cniVersion"] = json!("2.0.0");
        let err = harness.run("ADD", &conf).unwrap_err();
        assert_eq!(u32::from(&err), 1);
        let doc = harness.output();
        assert_eq!(doc["code"], 1);
        assert_eq!(doc["cniVersion"], "2.0.0");
    }

    #[test]
    fn test_undecodable_config_emits_error_document() {
        let harness = Harness::new();
        let err = harness.run("ADD", &json!("not a config")).unwrap_err();
        assert_eq!(u32::from(&err), 6);
        let doc = harness.output();
        assert_eq!(doc["code"], 6);
        assert_eq!(doc["cniVersion"], "1.0.0");
    }

    #[test]
    fn test_multitenancy_add_del_releases_infra_vnet_ip() {
        let mut harness = Harness::new();
        harness.nc = Some(tenant_nc());
        // A cached decision keeps the node-management agent out of the test.
        fs::write(
            harness.dir.path().join("snatConfig.json"),
            r#"{"enableSnatForDns":false,"enableSnatOnHost":false}"#,
        )
        .unwrap();

        // Delegated allocator hands out the infra address on ADD and records
        // every configuration it is asked to release.
        let dels = harness.dir.path().join("dels");
        let script = format!(
            concat!(
                "#!/bin/sh\n",
                "if [ \"$CNI_COMMAND\" = \"DEL\" ]; then cat >> {dels}; exit 0; fi\n",
                "cat > /dev/null\n",
                "echo '{{\"cniVersion\":\"1.0.0\",\"ips\":[{{\"address\":\"192.168.0.10/16\"}}]}}'\n",
            ),
            dels = dels.display()
        );
        let plugin = harness.dir.path().join("fake-ipam");
        fs::write(&plugin, script).unwrap();
        fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();

        let conf = json!({
            "cniVersion": "1.0.0",
            "name": "azure",
            "type": "azure-vnet",
            "multiTenancy": true,
            "enableInfraVnet": true,
            "infraVnetAddressSpace": "192.168.0.0/16",
            "ipam": {"type": "fake-ipam"}
        });
        harness.run("ADD", &conf).unwrap();

        assert_eq!(harness.output()["ips"][0]["address"], "10.0.1.10/24");
        let manager = harness.restore_manager();
        let endpoint = manager.endpoint("azure", "abc123-eth0").unwrap();
        assert_eq!(endpoint.vlan_id, Some(7));
        assert_eq!(endpoint.infra_ip.as_deref(), Some("192.168.0.10/16"));
        assert_eq!(endpoint.network_container_id.as_deref(), Some("nc1"));

        harness.run("DEL", &conf).unwrap();
        let released = fs::read_to_string(&dels).unwrap();
        assert!(released.contains("10.0.1.10/24"));
        assert!(released.contains("192.168.0.10/16"));
        let manager = harness.restore_manager();
        assert!(manager.endpoint("azure", "abc123-eth0").is_err());
    }

    #[test]
    fn test_baremetal_delegates_to_node_service_once() {
        let harness = Harness::new();
        let conf = json!({
            "cniVersion": "1.0.0",
            "name": "azure",
            "type": "azure-vnet",
            "mode": "baremetal",
            "ipam": {"type": "azure-vnet-ipam"}
        });
        harness.run("ADD", &conf).unwrap();

        assert_eq!(*harness.nns_calls.borrow(), 1);
        assert_eq!(harness.output()["ips"][0]["address"], "192.168.5.10/24");
        // The store and the address managers are bypassed entirely.
        assert!(!harness.dir.path().join("azure-vnet.json").exists());

        let err = harness.run("GET", &conf).unwrap_err();
        assert_eq!(u32::from(&err), 7);
    }
}
