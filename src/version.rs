use serde::{Deserialize, Serialize};

use crate::{error::Error, types::CniResult};

/// Supported CNI spec versions, oldest first. A configuration without a
/// `cniVersion` defaults to the last entry.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// `PluginInfo` is the supported CNI plugin version information.
/// Please see <https://github.com/containernetworking/cni/blob/v1.1.0/SPEC.md#version>.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub(crate) cni_version: String,
    pub(crate) supported_versions: Vec<String>,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            cni_version: SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1].to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A [`CniResult`] stamped with the CNI version the caller requested.
/// This is the exact shape written to stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionedResult {
    pub cni_version: String,
    #[serde(flatten)]
    pub inner: CniResult,
}

impl PluginInfo {
    #[must_use]
    pub fn new(cni_version: &str, supported_versions: Vec<String>) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions,
        }
    }

    /// Default version applied to configurations missing `cniVersion`.
    #[must_use]
    pub fn default_version(&self) -> &str {
        &self.cni_version
    }

    pub(crate) fn version(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::ParseError(e.to_string()))
    }

    pub(crate) fn about(&self, msg: Option<&str>) -> String {
        let versions = self.supported_versions.join(", ");
        msg.map_or_else(
            || format!("CNI protocol versions supported: {versions}"),
            |msg| format!("{msg}\nCNI protocol versions supported: {versions}"),
        )
    }

    /// Validates that the requested version is supported.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleVersion`] otherwise.
    pub fn validate(&self, ver: &str) -> Result<(), Error> {
        if self.cni_version == ver || self.supported_versions.iter().any(|v| v == ver) {
            return Ok(());
        }
        Err(Error::IncompatibleVersion(format!(
            "{ver} is not a supported CNI version"
        )))
    }

    /// Converts a result to the version the caller requested. The version
    /// must have been validated at parse time.
    #[must_use]
    pub fn into_versioned(&self, requested: &str, inner: CniResult) -> VersionedResult {
        VersionedResult {
            cni_version: requested.to_string(),
            inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::types::{CniResult, IpConfig};

    use super::PluginInfo;

    #[rstest]
    #[case("1.0.0", true)]
    #[case("0.4.0", true)]
    #[case("0.3.0", true)]
    #[case("0.1.0", false)]
    #[case("2.0.0", false)]
    fn plugin_info_validate(#[case] version: &str, #[case] ok: bool) {
        let info = PluginInfo::default();
        assert_eq!(info.validate(version).is_ok(), ok);
    }

    #[test]
    fn versioned_result_serializes_flat() {
        let info = PluginInfo::default();
        let result = CniResult {
            ips: vec![IpConfig {
                interface: None,
                address: "10.0.1.10/24".to_string(),
                gateway: Some("10.0.0.1".to_string()),
            }],
            ..CniResult::default()
        };
        let versioned = info.into_versioned("0.3.0", result);
        let json = serde_json::to_value(&versioned).unwrap();
        assert_eq!(json["cniVersion"], "0.3.0");
        assert_eq!(json["ips"][0]["address"], "10.0.1.10/24");
    }
}
