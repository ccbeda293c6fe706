//! Client for the node-local network control service.
//!
//! The control service owns IP allocation and multitenancy goal state for the
//! node. The plugin talks to it over localhost HTTP with short-lived blocking
//! requests; every transport failure or non-success payload surfaces as
//! [`Error::ControlService`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::Error;

/// Default control service endpoint.
pub const DEFAULT_CNS_URL: &str = "http://localhost:10090";

const PATH_REQUEST_IP_CONFIG: &str = "/network/requestipconfig";
const PATH_RELEASE_IP_CONFIG: &str = "/network/releaseipconfig";
const PATH_NETWORK_CONFIGURATION: &str = "/network/configuration";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Envelope carried by every control service response body.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    #[serde(default)]
    pub return_code: i32,
    #[serde(default)]
    pub message: String,
}

/// IP configuration request keyed by pod identity.
///
/// `orchestrator_context` is the marshaled pod info document; the service
/// treats it as opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigRequest {
    pub orchestrator_context: Value,
    pub pod_interface_id: String,
    pub infra_container_id: String,
}

/// An address with its prefix length.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpSubnet {
    pub ip_address: String,
    pub prefix_length: u8,
}

/// Interface IP configuration from the goal state.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpConfiguration {
    pub ip_subnet: IpSubnet,
    #[serde(default)]
    pub gateway_ip_address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
}

/// Host networking facts accompanying an allocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostIpInfo {
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub primary_ip: String,
    #[serde(default)]
    pub subnet: String,
}

/// Per-pod allocation returned by `requestipconfig`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodIpInfo {
    pub pod_ip_config: IpSubnet,
    #[serde(default)]
    pub network_container_primary_ip_config: IpConfiguration,
    #[serde(default)]
    pub host_primary_ip_info: HostIpInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IpConfigResponse {
    #[serde(default)]
    pub response: ServiceResponse,
    pub pod_ip_info: PodIpInfo,
}

/// VLAN encapsulation facts for a network container.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MultiTenancyInfo {
    #[serde(default)]
    pub encap_type: String,
    #[serde(default)]
    pub id: u32,
}

/// Route entry from the goal state.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CnsRoute {
    pub ip_address: String,
    #[serde(default)]
    pub gateway_ip_address: String,
}

/// Network container goal state returned by `GET /network/configuration`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContainerResponse {
    #[serde(default)]
    pub network_container_id: String,
    #[serde(default)]
    pub primary_interface_identifier: String,
    #[serde(default)]
    pub multi_tenancy_info: MultiTenancyInfo,
    #[serde(default)]
    pub ip_configuration: IpConfiguration,
    #[serde(default)]
    pub local_ip_configuration: IpConfiguration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cnet_address_space: Vec<IpSubnet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<CnsRoute>,
    #[serde(default, rename = "allowHostToNCCommunication")]
    pub allow_host_to_nc_communication: bool,
    #[serde(default, rename = "allowNCToHostCommunication")]
    pub allow_nc_to_host_communication: bool,
}

/// Operations against the network control service.
pub trait CnsClient {
    /// Requests an IP allocation for the pod.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlService`] on transport failure or a non-success
    /// service response.
    fn request_ip_config(&self, req: &IpConfigRequest) -> Result<IpConfigResponse, Error>;

    /// Releases the pod's allocation. Releasing an unknown pod is permitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlService`] on transport failure or a non-success
    /// service response.
    fn release_ip_config(&self, req: &IpConfigRequest) -> Result<(), Error>;

    /// Fetches the network container goal state for the pod identified by the
    /// opaque orchestrator context document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlService`] on transport failure or a non-success
    /// service response.
    fn get_network_configuration(
        &self,
        orchestrator_context: &[u8],
    ) -> Result<NetworkContainerResponse, Error>;
}

impl<C: CnsClient + ?Sized> CnsClient for Box<C> {
    fn request_ip_config(&self, req: &IpConfigRequest) -> Result<IpConfigResponse, Error> {
        (**self).request_ip_config(req)
    }

    fn release_ip_config(&self, req: &IpConfigRequest) -> Result<(), Error> {
        (**self).release_ip_config(req)
    }

    fn get_network_configuration(
        &self,
        orchestrator_context: &[u8],
    ) -> Result<NetworkContainerResponse, Error> {
        (**self).get_network_configuration(orchestrator_context)
    }
}

/// Blocking HTTP implementation of [`CnsClient`].
#[derive(Debug)]
pub struct HttpCnsClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpCnsClient {
    /// Builds a client against `base_url`, falling back to
    /// [`DEFAULT_CNS_URL`] when none is given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ControlService`] when the HTTP client cannot be built.
    pub fn new(base_url: Option<&str>) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::ControlService(e.to_string()))?;
        Ok(Self {
            base_url: base_url
                .unwrap_or(DEFAULT_CNS_URL)
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, Error> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "control service request");
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| Error::ControlService(format!("{url}: {e}")))?;
        Self::decode(path, resp)
    }

    fn decode<T: DeserializeOwned>(
        path: &str,
        resp: reqwest::blocking::Response,
    ) -> Result<T, Error> {
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::ControlService(format!(
                "{path} returned {status}"
            )));
        }
        resp.json()
            .map_err(|e| Error::ControlService(format!("{path}: undecodable response: {e}")))
    }

    fn check(path: &str, response: &ServiceResponse) -> Result<(), Error> {
        if response.return_code != 0 {
            return Err(Error::ControlService(format!(
                "{path} failed with code {}: {}",
                response.return_code, response.message
            )));
        }
        Ok(())
    }
}

impl CnsClient for HttpCnsClient {
    fn request_ip_config(&self, req: &IpConfigRequest) -> Result<IpConfigResponse, Error> {
        let resp: IpConfigResponse = self.post(PATH_REQUEST_IP_CONFIG, req)?;
        Self::check(PATH_REQUEST_IP_CONFIG, &resp.response)?;
        Ok(resp)
    }

    fn release_ip_config(&self, req: &IpConfigRequest) -> Result<(), Error> {
        let resp: ServiceResponse = self.post(PATH_RELEASE_IP_CONFIG, req)?;
        Self::check(PATH_RELEASE_IP_CONFIG, &resp)
    }

    fn get_network_configuration(
        &self,
        orchestrator_context: &[u8],
    ) -> Result<NetworkContainerResponse, Error> {
        let url = format!("{}{PATH_NETWORK_CONFIGURATION}", self.base_url);
        debug!(%url, "control service request");
        let resp = self
            .client
            .get(&url)
            .query(&[("orchestratorContext", BASE64.encode(orchestrator_context))])
            .send()
            .map_err(|e| Error::ControlService(format!("{url}: {e}")))?;
        Self::decode(PATH_NETWORK_CONFIGURATION, resp)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::{CnsClient, HttpCnsClient, IpConfigRequest};

    fn request() -> IpConfigRequest {
        IpConfigRequest {
            orchestrator_context: json!({"PodName": "pod1", "PodNamespace": "ns1"}),
            pod_interface_id: "abc123eth0".to_string(),
            infra_container_id: "abc123".to_string(),
        }
    }

    #[test]
    fn test_request_ip_config() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/network/requestipconfig")
                .json_body_partial(r#"{"podInterfaceId": "abc123eth0"}"#);
            then.status(200).json_body(json!({
                "response": {"returnCode": 0, "message": ""},
                "podIpInfo": {
                    "podIpConfig": {"ipAddress": "10.240.0.10", "prefixLength": 16},
                    "networkContainerPrimaryIpConfig": {
                        "ipSubnet": {"ipAddress": "10.240.0.4", "prefixLength": 16},
                        "gatewayIpAddress": "10.240.0.1"
                    },
                    "hostPrimaryIpInfo": {
                        "gateway": "10.224.0.1",
                        "primaryIp": "10.224.0.5",
                        "subnet": "10.224.0.0/16"
                    }
                }
            }));
        });

        let client = HttpCnsClient::new(Some(&server.base_url())).unwrap();
        let resp = client.request_ip_config(&request()).unwrap();
        mock.assert();
        assert_eq!(resp.pod_ip_info.pod_ip_config.ip_address, "10.240.0.10");
        assert_eq!(resp.pod_ip_info.pod_ip_config.prefix_length, 16);
        assert_eq!(
            resp.pod_ip_info.host_primary_ip_info.primary_ip,
            "10.224.0.5"
        );
    }

    #[test]
    fn test_request_ip_config_service_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/network/requestipconfig");
            then.status(200).json_body(json!({
                "response": {"returnCode": 18, "message": "pool exhausted"},
                "podIpInfo": {"podIpConfig": {"ipAddress": "", "prefixLength": 0}}
            }));
        });

        let client = HttpCnsClient::new(Some(&server.base_url())).unwrap();
        let err = client.request_ip_config(&request()).unwrap_err();
        assert_eq!(u32::from(&err), 102);
        assert!(err.details().contains("pool exhausted"));
    }

    #[test]
    fn test_release_ip_config() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/network/releaseipconfig");
            then.status(200)
                .json_body(json!({"returnCode": 0, "message": ""}));
        });

        let client = HttpCnsClient::new(Some(&server.base_url())).unwrap();
        client.release_ip_config(&request()).unwrap();
        mock.assert();
    }

    #[test]
    fn test_non_success_status_is_control_service_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/network/releaseipconfig");
            then.status(500);
        });

        let client = HttpCnsClient::new(Some(&server.base_url())).unwrap();
        let err = client.release_ip_config(&request()).unwrap_err();
        assert_eq!(u32::from(&err), 102);
    }

    #[test]
    fn test_get_network_configuration_sends_base64_context() {
        let server = MockServer::start();
        let context = br#"{"PodName":"pod1","PodNamespace":"ns1"}"#;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/network/configuration")
                .query_param(
                    "orchestratorContext",
                    "eyJQb2ROYW1lIjoicG9kMSIsIlBvZE5hbWVzcGFjZSI6Im5zMSJ9",
                );
            then.status(200).json_body(json!({
                "networkContainerId": "nc1",
                "primaryInterfaceIdentifier": "10.240.0.4/16",
                "multiTenancyInfo": {"encapType": "Vlan", "id": 7},
                "ipConfiguration": {
                    "ipSubnet": {"ipAddress": "10.0.1.10", "prefixLength": 24},
                    "gatewayIpAddress": "10.0.1.1"
                },
                "localIpConfiguration": {
                    "ipSubnet": {"ipAddress": "169.254.0.4", "prefixLength": 17},
                    "gatewayIpAddress": "169.254.0.1"
                },
                "cnetAddressSpace": [
                    {"ipAddress": "10.0.0.0", "prefixLength": 8}
                ],
                "routes": [
                    {"ipAddress": "0.0.0.0/0", "gatewayIpAddress": "10.0.1.1"}
                ],
                "allowHostToNCCommunication": true
            }));
        });

        let client = HttpCnsClient::new(Some(&server.base_url())).unwrap();
        let nc = client.get_network_configuration(context).unwrap();
        mock.assert();
        assert_eq!(nc.network_container_id, "nc1");
        assert_eq!(nc.multi_tenancy_info.id, 7);
        assert_eq!(nc.primary_interface_identifier, "10.240.0.4/16");
        assert_eq!(nc.cnet_address_space.len(), 1);
        assert!(nc.allow_host_to_nc_communication);
        assert!(!nc.allow_nc_to_host_communication);
    }
}
