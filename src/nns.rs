//! Node network service client for baremetal execution mode.
//!
//! On baremetal nodes all host networking setup belongs to a node-local
//! service; the plugin forwards the attachment request once per invocation
//! and converts the service's answer into a result document. The service
//! can legitimately take minutes while it programs switch fabric, hence the
//! generous ceilings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::Error,
    types::{CniResult, IpConfig},
};

/// Default node network service endpoint.
pub const DEFAULT_NNS_URL: &str = "http://localhost:10092";

/// Connection establishment ceiling.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Per-call ceiling.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const PATH_ADD_CONTAINER: &str = "/node/network/addcontainer";
const PATH_DELETE_CONTAINER: &str = "/node/network/deletecontainer";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct ContainerRequest {
    pod_name: String,
    pod_namespace: String,
    netns_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct ContainerResponse {
    #[serde(default)]
    return_code: i32,
    #[serde(default)]
    message: String,
    /// Addresses in CIDR notation assigned by the service.
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    gateway: Option<String>,
}

/// Operations against the node network service.
pub trait NnsClient {
    /// Attaches the pod's sandbox, returning the addresses the service
    /// assigned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlService`] on transport failure or a
    /// non-success service response.
    fn add_container(
        &self,
        pod_name: &str,
        pod_namespace: &str,
        netns_path: &str,
    ) -> Result<CniResult, Error>;

    /// Detaches the pod's sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlService`] on transport failure or a
    /// non-success service response.
    fn delete_container(
        &self,
        pod_name: &str,
        pod_namespace: &str,
        netns_path: &str,
    ) -> Result<(), Error>;
}

/// Blocking HTTP implementation of [`NnsClient`].
#[derive(Debug)]
pub struct HttpNnsClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpNnsClient {
    /// Builds a client against `base_url`, falling back to
    /// [`DEFAULT_NNS_URL`] when none is given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlService`] when the HTTP client cannot be
    /// built.
    pub fn new(base_url: Option<&str>) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| Error::ControlService(e.to_string()))?;
        Ok(Self {
            base_url: base_url
                .unwrap_or(DEFAULT_NNS_URL)
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }

    fn call(&self, path: &str, request: &ContainerRequest) -> Result<ContainerResponse, Error> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, pod = %request.pod_name, "node network service request");
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(|e| Error::ControlService(format!("{url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::ControlService(format!("{path} returned {status}")));
        }
        let body: ContainerResponse = resp
            .json()
            .map_err(|e| Error::ControlService(format!("{path}: undecodable response: {e}")))?;
        if body.return_code != 0 {
            return Err(Error::ControlService(format!(
                "{path} failed with code {}: {}",
                body.return_code, body.message
            )));
        }
        Ok(body)
    }
}

impl NnsClient for HttpNnsClient {
    fn add_container(
        &self,
        pod_name: &str,
        pod_namespace: &str,
        netns_path: &str,
    ) -> Result<CniResult, Error> {
        let response = self.call(
            PATH_ADD_CONTAINER,
            &ContainerRequest {
                pod_name: pod_name.to_string(),
                pod_namespace: pod_namespace.to_string(),
                netns_path: netns_path.to_string(),
            },
        )?;
        Ok(CniResult {
            ips: response
                .ip_addresses
                .iter()
                .map(|address| IpConfig {
                    interface: None,
                    address: address.clone(),
                    gateway: response.gateway.clone(),
                })
                .collect(),
            ..CniResult::default()
        })
    }

    fn delete_container(
        &self,
        pod_name: &str,
        pod_namespace: &str,
        netns_path: &str,
    ) -> Result<(), Error> {
        self.call(
            PATH_DELETE_CONTAINER,
            &ContainerRequest {
                pod_name: pod_name.to_string(),
                pod_namespace: pod_namespace.to_string(),
                netns_path: netns_path.to_string(),
            },
        )?;
        Ok(())
    }
}
