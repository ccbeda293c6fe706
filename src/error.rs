//! Error types surfaced as CNI error documents.
//!
//! Every failure in the plugin maps to a numeric CNI error code following the
//! [CNI specification error format](https://github.com/containernetworking/cni/blob/v1.1.0/SPEC.md#Error).
//! Codes 1-11 are the standard CNI codes; plugin-specific kinds use the
//! custom range (100+).

use thiserror::Error;

/// Plugin error kinds.
///
/// Each variant carries a detail message and converts to a CNI error code.
/// The dispatcher turns any of these into a JSON error document on stdout;
/// `DEL` converts [`Error::NetworkNotFound`] and [`Error::EndpointNotFound`]
/// to success per the CNI contract.
#[derive(Debug, Error)]
pub enum Error {
    /// Incompatible CNI version (code 1).
    IncompatibleVersion(String),

    /// A required CNI argument is missing or empty (code 4): container id,
    /// interface name, pod name or pod namespace.
    ArgsMissing(String),

    /// I/O failure reading stdin, writing stdout, or touching state files
    /// (code 5).
    IoFailure(String),

    /// Configuration or args could not be decoded (code 6).
    ParseError(String),

    /// Semantic validation of the network configuration failed (code 7).
    InvalidConfig(String),

    /// The process lock could not be acquired within the configured deadline
    /// (code 11, try again later).
    LockTimeout(String),

    /// The IPAM invoker reported no available address pools (code 100).
    /// Triggers an IPAM state reset for the delegating invoker.
    IpamPoolExhausted(String),

    /// Any other IPAM allocation or release failure (code 101).
    Ipam(String),

    /// Transport failure or non-200 response from the network control
    /// service (code 102).
    ControlService(String),

    /// Node-management agent call failed or returned non-200 (code 103).
    Nma(String),

    /// An imperative host operation failed (code 104).
    Platform(String),

    /// A platform call exceeded its per-call deadline (code 105).
    PlatformCallTimeout(String),

    /// Network id already present in the store (code 106).
    NetworkExists(String),

    /// Endpoint id already present in its network (code 107).
    EndpointExists(String),

    /// Named network is unknown (code 108).
    NetworkNotFound(String),

    /// Endpoint is unknown within its network (code 109).
    EndpointNotFound(String),

    /// No host interface matches the requested subnet prefix (code 110).
    MasterNotFound(String),

    /// UPDATE found more than one endpoint for the pod (code 111).
    MultiEndpointUpdateUnsupported(String),

    /// Infra vnet address space overlaps a customer vnet (code 112).
    SubnetOverlap(String),

    /// Semantic validation of a downstream response failed (code 113).
    InvalidArgs(String),

    /// SNAT-on-host is enabled but the goal state carries no SNAT IP
    /// (code 114).
    SnatIpMissing(String),

    /// The goal state's primary interface identifier matches no local host
    /// subnet (code 115).
    InterfaceNotFound(String),

    /// An error decoded from a sub-plugin's CNI error document with a code
    /// outside the kinds above.
    Custom(u32, String, String),
}

impl Error {
    /// Returns the long-form detail string for the CNI error document.
    #[must_use]
    pub fn details(&self) -> String {
        match self {
            Self::IncompatibleVersion(d)
            | Self::ArgsMissing(d)
            | Self::IoFailure(d)
            | Self::ParseError(d)
            | Self::InvalidConfig(d)
            | Self::LockTimeout(d)
            | Self::IpamPoolExhausted(d)
            | Self::Ipam(d)
            | Self::ControlService(d)
            | Self::Nma(d)
            | Self::Platform(d)
            | Self::PlatformCallTimeout(d)
            | Self::NetworkExists(d)
            | Self::NetworkNotFound(d)
            | Self::EndpointExists(d)
            | Self::EndpointNotFound(d)
            | Self::MasterNotFound(d)
            | Self::MultiEndpointUpdateUnsupported(d)
            | Self::SubnetOverlap(d)
            | Self::InvalidArgs(d)
            | Self::SnatIpMissing(d)
            | Self::InterfaceNotFound(d) => d.clone(),
            Self::Custom(_, _, d) => d.clone(),
        }
    }

    /// True when DEL should treat this error as success.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NetworkNotFound(_) | Self::EndpointNotFound(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncompatibleVersion(_) => write!(f, "Incompatible CNI version"),
            Self::ArgsMissing(_) => write!(f, "Required CNI argument missing"),
            Self::IoFailure(_) => write!(f, "I/O failure"),
            Self::ParseError(_) => write!(f, "Failed to decode content"),
            Self::InvalidConfig(_) => write!(f, "Invalid network config"),
            Self::LockTimeout(_) => write!(f, "Failed to acquire store lock"),
            Self::IpamPoolExhausted(_) => write!(f, "No available address pools"),
            Self::Ipam(_) => write!(f, "IPAM failure"),
            Self::ControlService(_) => write!(f, "Network control service failure"),
            Self::Nma(_) => write!(f, "Node management agent failure"),
            Self::Platform(_) => write!(f, "Platform operation failure"),
            Self::PlatformCallTimeout(_) => write!(f, "Platform call timed out"),
            Self::NetworkExists(_) => write!(f, "Network already exists"),
            Self::NetworkNotFound(_) => write!(f, "Network not found"),
            Self::EndpointExists(_) => write!(f, "Endpoint already exists"),
            Self::EndpointNotFound(_) => write!(f, "Endpoint not found"),
            Self::MasterNotFound(_) => write!(f, "Master interface not found"),
            Self::MultiEndpointUpdateUnsupported(_) => {
                write!(f, "Update of multi-endpoint pods is unsupported")
            }
            Self::SubnetOverlap(_) => write!(f, "Infra vnet overlaps customer vnet"),
            Self::InvalidArgs(_) => write!(f, "Invalid downstream response"),
            Self::SnatIpMissing(_) => write!(f, "SNAT IP missing from goal state"),
            Self::InterfaceNotFound(_) => write!(f, "Primary interface not found on host"),
            Self::Custom(_, msg, _) => write!(f, "{msg}"),
        }
    }
}

impl From<&Error> for u32 {
    fn from(value: &Error) -> Self {
        match value {
            Error::IncompatibleVersion(_) => 1,
            Error::ArgsMissing(_) => 4,
            Error::IoFailure(_) => 5,
            Error::ParseError(_) => 6,
            Error::InvalidConfig(_) => 7,
            Error::LockTimeout(_) => 11,
            Error::IpamPoolExhausted(_) => 100,
            Error::Ipam(_) => 101,
            Error::ControlService(_) => 102,
            Error::Nma(_) => 103,
            Error::Platform(_) => 104,
            Error::PlatformCallTimeout(_) => 105,
            Error::NetworkExists(_) => 106,
            Error::EndpointExists(_) => 107,
            Error::NetworkNotFound(_) => 108,
            Error::EndpointNotFound(_) => 109,
            Error::MasterNotFound(_) => 110,
            Error::MultiEndpointUpdateUnsupported(_) => 111,
            Error::SubnetOverlap(_) => 112,
            Error::InvalidArgs(_) => 113,
            Error::SnatIpMissing(_) => 114,
            Error::InterfaceNotFound(_) => 115,
            Error::Custom(code, _, _) => *code,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::IoFailure(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::ParseError(e.to_string())
    }
}
