//! Network and endpoint lifecycle manager.
//!
//! The manager owns the in-memory view of every network this plugin created
//! on the node, each with its endpoints, restored from the state store at
//! the start of an invocation and written back through it before the store
//! flush. Platform programming happens through the injected [`PlatformOps`]
//! collaborator.

use std::collections::HashMap;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    endpoint::EndpointRecord,
    error::Error,
    platform::{PlatformOps, RouteEntry},
    policy::serialize_policies,
    store::KeyValueStore,
    types::{Dns, Mode, PodInfo},
};

const STORE_KEY: &str = "Network";

/// Persistent network state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    pub id: String,
    #[serde(default)]
    pub mode: Mode,
    pub master: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<IpNet>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u32>,
    #[serde(default)]
    pub enable_snat_on_host: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub endpoints: HashMap<String, EndpointRecord>,
}

/// Everything needed to create a network.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub id: String,
    pub mode: Mode,
    pub master: Option<String>,
    pub bridge: Option<String>,
    pub subnets: Vec<IpNet>,
    /// Host subnet reported by the allocator, a master-selection candidate
    /// alongside `subnets`.
    pub host_subnet: Option<IpNet>,
    pub dns: Dns,
    pub vlan_id: Option<u32>,
    pub enable_snat_on_host: bool,
}

/// Owner of all network and endpoint records.
#[derive(Debug, Default)]
pub struct NetworkManager {
    networks: HashMap<String, NetworkRecord>,
}

impl NetworkManager {
    /// Restores the manager's view from the state store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] when the stored payload is corrupt.
    pub fn restore(store: &KeyValueStore) -> Result<Self, Error> {
        let networks = store.get(STORE_KEY)?.unwrap_or_default();
        Ok(Self { networks })
    }

    /// Writes the manager's view back into the store. The caller flushes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] when the view cannot be serialized.
    pub fn save(&self, store: &mut KeyValueStore) -> Result<(), Error> {
        store.set(STORE_KEY, &self.networks)
    }

    #[must_use]
    pub fn has_network(&self, id: &str) -> bool {
        self.networks.contains_key(id)
    }

    /// Looks up a network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkNotFound`] for an unknown id.
    pub fn network(&self, id: &str) -> Result<&NetworkRecord, Error> {
        self.networks
            .get(id)
            .ok_or_else(|| Error::NetworkNotFound(format!("network {id} not found")))
    }

    fn network_mut(&mut self, id: &str) -> Result<&mut NetworkRecord, Error> {
        self.networks
            .get_mut(id)
            .ok_or_else(|| Error::NetworkNotFound(format!("network {id} not found")))
    }

    /// Creates a network, selecting the master interface when the
    /// configuration names none: the first host interface whose primary
    /// subnet matches the allocator's host subnet or a requested subnet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkExists`] for a duplicate id and
    /// [`Error::MasterNotFound`] when no interface matches.
    pub fn create_network(
        &mut self,
        platform: &dyn PlatformOps,
        spec: NetworkSpec,
    ) -> Result<(), Error> {
        if self.networks.contains_key(&spec.id) {
            return Err(Error::NetworkExists(format!(
                "network {} already exists",
                spec.id
            )));
        }

        let master = match spec.master {
            Some(master) => master,
            None => platform
                .host_interfaces()?
                .iter()
                .find(|iface| {
                    iface.primary_subnet().is_some_and(|subnet| {
                        spec.host_subnet == Some(subnet) || spec.subnets.contains(&subnet)
                    })
                })
                .map(|iface| iface.name.clone())
                .ok_or_else(|| {
                    Error::MasterNotFound(format!(
                        "no host interface matches host subnet {:?} or subnets {:?}",
                        spec.host_subnet, spec.subnets
                    ))
                })?,
        };

        platform.add_external_interface(&master, &spec.subnets)?;
        info!(network = %spec.id, %master, "network created");

        self.networks.insert(
            spec.id.clone(),
            NetworkRecord {
                id: spec.id,
                mode: spec.mode,
                master,
                bridge: spec.bridge,
                subnets: spec.subnets,
                dns: spec.dns,
                vlan_id: spec.vlan_id,
                enable_snat_on_host: spec.enable_snat_on_host,
                endpoints: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Deletes an empty network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkNotFound`] for an unknown id and
    /// [`Error::InvalidConfig`] when endpoints are still attached.
    pub fn delete_network(&mut self, id: &str) -> Result<(), Error> {
        let network = self.network(id)?;
        if !network.endpoints.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "network {id} still has {} endpoints",
                network.endpoints.len()
            )));
        }
        self.networks.remove(id);
        info!(network = %id, "network deleted");
        Ok(())
    }

    /// Creates an endpoint in `network_id` and materializes it on the host.
    /// The record's MAC is filled from the interface the platform created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkNotFound`], [`Error::EndpointExists`] for a
    /// duplicate id, or the platform's error.
    pub fn create_endpoint(
        &mut self,
        platform: &dyn PlatformOps,
        network_id: &str,
        mut record: EndpointRecord,
    ) -> Result<EndpointRecord, Error> {
        let network = self.network(network_id)?;
        if network.endpoints.contains_key(&record.id) {
            return Err(Error::EndpointExists(format!(
                "endpoint {} already exists in network {network_id}",
                record.id
            )));
        }

        let spec = record.to_endpoint_spec(network.mode, network.bridge.clone());
        if let Some(created) = platform.create_endpoint(&spec)? {
            record.mac = Some(created.mac);
        }
        if !record.policies.is_empty() {
            let native = serialize_policies(&record.policies)?;
            platform.apply_endpoint_policies(&record.id, &native)?;
        }
        info!(network = %network_id, endpoint = %record.id, "endpoint created");

        let network = self.network_mut(network_id)?;
        network.endpoints.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Deletes an endpoint. A missing endpoint is a non-error; host teardown
    /// is best-effort and the record is removed regardless.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkNotFound`] for an unknown network.
    pub fn delete_endpoint(
        &mut self,
        platform: &dyn PlatformOps,
        network_id: &str,
        endpoint_id: &str,
    ) -> Result<Option<EndpointRecord>, Error> {
        let network = self.network_mut(network_id)?;
        let Some(record) = network.endpoints.remove(endpoint_id) else {
            warn!(network = %network_id, endpoint = %endpoint_id, "endpoint already gone");
            return Ok(None);
        };

        if let Err(e) = platform.delete_endpoint(&record.id, &record.host_ifname) {
            warn!(endpoint = %record.id, error = %e, "host teardown failed, removing record anyway");
        }
        info!(network = %network_id, endpoint = %record.id, "endpoint deleted");
        Ok(Some(record))
    }

    /// Looks up an endpoint by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkNotFound`] or [`Error::EndpointNotFound`].
    pub fn endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<&EndpointRecord, Error> {
        self.network(network_id)?
            .endpoints
            .get(endpoint_id)
            .ok_or_else(|| {
                Error::EndpointNotFound(format!(
                    "endpoint {endpoint_id} not found in network {network_id}"
                ))
            })
    }

    /// Endpoints belonging to `pod`, exact or suffix-stripped matching.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkNotFound`] for an unknown network.
    pub fn endpoints_by_pod(
        &self,
        network_id: &str,
        pod: &PodInfo,
        exact: bool,
    ) -> Result<Vec<&EndpointRecord>, Error> {
        Ok(self
            .network(network_id)?
            .endpoints
            .values()
            .filter(|record| record.matches_pod(pod, exact))
            .collect())
    }

    /// The single endpoint belonging to `pod`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] when the pod has none.
    pub fn endpoint_by_pod_details(
        &self,
        network_id: &str,
        pod: &PodInfo,
        exact: bool,
    ) -> Result<&EndpointRecord, Error> {
        self.endpoints_by_pod(network_id, pod, exact)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::EndpointNotFound(format!(
                    "no endpoint for pod {}/{}",
                    pod.pod_namespace, pod.pod_name
                ))
            })
    }

    /// Replaces the routes of the pod's endpoint, programming only the
    /// difference into the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MultiEndpointUpdateUnsupported`] when the pod has
    /// more than one endpoint, [`Error::EndpointNotFound`] when it has none,
    /// or the platform's error.
    pub fn update_endpoint(
        &mut self,
        platform: &dyn PlatformOps,
        network_id: &str,
        pod: &PodInfo,
        exact: bool,
        routes: Vec<RouteEntry>,
    ) -> Result<(), Error> {
        let matches = self.endpoints_by_pod(network_id, pod, exact)?;
        if matches.len() > 1 {
            return Err(Error::MultiEndpointUpdateUnsupported(format!(
                "pod {}/{} has {} endpoints",
                pod.pod_namespace,
                pod.pod_name,
                matches.len()
            )));
        }
        let endpoint_id = matches
            .first()
            .map(|record| record.id.clone())
            .ok_or_else(|| {
                Error::EndpointNotFound(format!(
                    "no endpoint for pod {}/{}",
                    pod.pod_namespace, pod.pod_name
                ))
            })?;

        let network = self.network_mut(network_id)?;
        let record = network
            .endpoints
            .get_mut(&endpoint_id)
            .ok_or_else(|| Error::EndpointNotFound(format!("endpoint {endpoint_id} vanished")))?;

        let removed: Vec<RouteEntry> = record
            .routes
            .iter()
            .filter(|r| !routes.contains(r))
            .cloned()
            .collect();
        let added: Vec<RouteEntry> = routes
            .iter()
            .filter(|r| !record.routes.contains(r))
            .cloned()
            .collect();

        if !removed.is_empty() {
            platform.remove_routes(record.netns.as_ref(), &removed)?;
        }
        if !added.is_empty() {
            platform.add_routes(record.netns.as_ref(), &added)?;
        }
        info!(
            endpoint = %record.id,
            added = added.len(),
            removed = removed.len(),
            "endpoint routes updated"
        );
        record.routes = routes;
        Ok(())
    }
}
