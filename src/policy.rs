//! Platform-agnostic policy serialization.
//!
//! Policies arrive as tagged variants with an opaque JSON payload. The
//! serializer classifies each payload by a cascade of structural matches
//! and performs the small shape conversions the platform expects before
//! handing the result to the platform ops collaborator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Error, types::KvPair};

/// Policy kinds carried by network configuration and endpoint records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PolicyKind {
    NetworkPolicy,
    EndpointPolicy,
    OutBoundNAT,
    Route,
    PortMapping,
    ACL,
    LoopbackDSR,
    L4WFPProxy,
}

/// A tagged policy with an opaque payload interpreted by the serializer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub r#type: PolicyKind,
    pub data: Value,
}

/// A policy converted to the platform-native shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NativePolicy {
    pub r#type: PolicyKind,
    pub payload: Value,
}

/// Extracts policies from the configuration's additional arguments. Entries
/// whose name is not a policy tag are ignored.
#[must_use]
pub fn policies_from_args(args: &[KvPair]) -> Vec<Policy> {
    args.iter()
        .filter_map(|pair| {
            let kind = match pair.name.as_str() {
                "NetworkPolicy" => PolicyKind::NetworkPolicy,
                "EndpointPolicy" => PolicyKind::EndpointPolicy,
                _ => return None,
            };
            Some(Policy {
                r#type: kind,
                data: pair.value.clone(),
            })
        })
        .collect()
}

/// Classifies an opaque payload by structural match, first match wins:
/// OutBoundNAT, Route, L4WFPProxy, PortMapping, ACL, LoopbackDSR.
#[must_use]
pub fn classify(data: &Value) -> Option<PolicyKind> {
    let type_tag = data.get("Type").and_then(Value::as_str).unwrap_or_default();

    if type_tag.eq_ignore_ascii_case("OutBoundNAT") || data.get("ExceptionList").is_some() {
        return Some(PolicyKind::OutBoundNAT);
    }
    if type_tag.eq_ignore_ascii_case("ROUTE") || data.get("DestinationPrefix").is_some() {
        return Some(PolicyKind::Route);
    }
    if type_tag.eq_ignore_ascii_case("L4WFPPROXY") || data.get("OutboundProxyPort").is_some() {
        return Some(PolicyKind::L4WFPProxy);
    }
    if type_tag.eq_ignore_ascii_case("NAT")
        || (data.get("InternalPort").is_some() && data.get("ExternalPort").is_some())
    {
        return Some(PolicyKind::PortMapping);
    }
    if type_tag.eq_ignore_ascii_case("ACL")
        || (data.get("Action").is_some() && data.get("Direction").is_some())
    {
        return Some(PolicyKind::ACL);
    }
    if type_tag.eq_ignore_ascii_case("LoopbackDSR") || data.get("IPAddress").is_some() {
        return Some(PolicyKind::LoopbackDSR);
    }
    None
}

/// Converts a policy list to its platform-native form.
///
/// # Errors
///
/// Returns [`Error::InvalidArgs`] when a payload matches no known shape or
/// carries an unconvertible field.
pub fn serialize_policies(policies: &[Policy]) -> Result<Vec<NativePolicy>, Error> {
    policies.iter().map(serialize_policy).collect()
}

fn serialize_policy(policy: &Policy) -> Result<NativePolicy, Error> {
    let kind = classify(&policy.data).ok_or_else(|| {
        Error::InvalidArgs(format!("unrecognized policy payload: {}", policy.data))
    })?;

    let payload = match kind {
        PolicyKind::PortMapping => convert_port_mapping(&policy.data)?,
        _ => policy.data.clone(),
    };

    Ok(NativePolicy {
        r#type: kind,
        payload,
    })
}

/// Normalizes a port-mapping payload: numeric protocols become "TCP"/"UDP".
fn convert_port_mapping(data: &Value) -> Result<Value, Error> {
    let mut payload = data.clone();
    let Some(protocol) = payload.get("Protocol") else {
        return Ok(payload);
    };

    let name = match protocol {
        Value::Number(n) => match n.as_u64() {
            Some(6) => "TCP",
            Some(17) => "UDP",
            _ => {
                return Err(Error::InvalidArgs(format!(
                    "unknown protocol number in port mapping: {n}"
                )))
            }
        },
        Value::String(s) if s.eq_ignore_ascii_case("tcp") => "TCP",
        Value::String(s) if s.eq_ignore_ascii_case("udp") => "UDP",
        other => {
            return Err(Error::InvalidArgs(format!(
                "unconvertible protocol in port mapping: {other}"
            )))
        }
    };
    payload["Protocol"] = Value::String(name.to_string());
    Ok(payload)
}
