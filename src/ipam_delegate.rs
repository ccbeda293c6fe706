//! IPAM invoker delegating to another CNI plugin on disk.
//!
//! The sub-plugin named by the configuration's IPAM type is executed with
//! the standard CNI environment and the re-serialized configuration on
//! stdin, and its stdout is decoded as a CNI result or error document.
//! Dual-stack configurations delegate twice, IPv4 first, with the IPv6
//! sub-plugin addressed by a `v6` name suffix.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::Error,
    ipam::{IpamAddConfig, IpamAddResult, IpamInvoker},
    types::{
        Cmd, CmdArgs, CniResult, ErrorResult, NetworkConfig, CNI_ARGS, CNI_COMMAND,
        CNI_CONTAINERID, CNI_IFNAME, CNI_NETNS, CNI_PATH,
    },
};

/// On-disk state file of the IPv4 address allocator.
pub const IPAM_STATE_FILE: &str = "azure-vnet-ipam.json";
/// On-disk state file of the IPv6 address allocator.
pub const IPAM_STATE_FILE_V6: &str = "azure-vnet-ipamv6.json";

const V6_PLUGIN_SUFFIX: &str = "v6";

/// [`IpamInvoker`] backed by a delegated CNI sub-plugin.
#[derive(Debug)]
pub struct DelegatingInvoker {
    runtime_dir: PathBuf,
}

impl DelegatingInvoker {
    #[must_use]
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Runs the sub-plugin and decodes its stdout. A pool-exhausted error
    /// document resets the allocator's state file before propagating.
    fn delegate(
        &self,
        plugin: &str,
        cmd: Cmd,
        conf: &NetworkConfig,
        args: &CmdArgs,
        state_file: &str,
    ) -> Result<CniResult, Error> {
        let data = serde_json::to_vec(conf)?;
        match exec_plugin(plugin, cmd, &data, args) {
            Ok(stdout) => {
                if cmd == Cmd::Del {
                    return Ok(CniResult::default());
                }
                serde_json::from_slice(&stdout).map_err(|e| {
                    Error::Ipam(format!("undecodable result from {plugin}: {e}"))
                })
            }
            Err(e @ Error::IpamPoolExhausted(_)) => {
                self.reset_state(state_file);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Removes the allocator's state file so the next invocation starts from
    /// a clean pool view.
    fn reset_state(&self, state_file: &str) {
        let path = self.runtime_dir.join(state_file);
        match fs::remove_file(&path) {
            Ok(()) => warn!(file = %path.display(), "address pools exhausted, allocator state reset"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %path.display(), error = %e, "failed to reset allocator state"),
        }
    }

    fn release_one(
        &self,
        address: &str,
        conf: &NetworkConfig,
        args: &CmdArgs,
    ) -> Result<(), Error> {
        let ipv6 = address.contains(':');
        let (plugin, state_file) = if ipv6 {
            (format!("{}{V6_PLUGIN_SUFFIX}", conf.ipam.r#type), IPAM_STATE_FILE_V6)
        } else {
            (conf.ipam.r#type.clone(), IPAM_STATE_FILE)
        };
        let mut conf = conf.clone();
        conf.ipam.r#type = plugin.clone();
        conf.ipam.address = Some(address.to_string());
        self.delegate(&plugin, Cmd::Del, &conf, args, state_file)?;
        Ok(())
    }
}

impl IpamInvoker for DelegatingInvoker {
    fn add(&self, config: &IpamAddConfig<'_>) -> Result<IpamAddResult, Error> {
        let conf = config.conf;
        let plugin = conf.ipam.r#type.clone();
        debug!(%plugin, "delegating address allocation");

        let ipv4 = self.delegate(&plugin, Cmd::Add, conf, config.args, IPAM_STATE_FILE)?;

        let mut result = IpamAddResult {
            ipv4: Some(ipv4),
            ..IpamAddResult::default()
        };

        if conf.is_dual_stack() {
            let plugin_v6 = format!("{plugin}{V6_PLUGIN_SUFFIX}");
            let mut conf_v6 = conf.clone();
            conf_v6.ipam.r#type = plugin_v6.clone();
            conf_v6.ipam.subnet = None;
            match self.delegate(&plugin_v6, Cmd::Add, &conf_v6, config.args, IPAM_STATE_FILE_V6) {
                Ok(ipv6) => result.ipv6 = Some(ipv6),
                Err(e) => {
                    // The invocation fails as a whole, so the IPv4 side must
                    // not stay allocated.
                    let v4_addresses = result.addresses();
                    if let Err(release_err) =
                        self.delete(&v4_addresses, conf, config.args, &HashMap::new())
                    {
                        warn!(error = %release_err, "failed to release addresses after dual-stack failure");
                    }
                    return Err(e);
                }
            }
        }

        Ok(result)
    }

    fn delete(
        &self,
        addresses: &[String],
        conf: &NetworkConfig,
        args: &CmdArgs,
        _options: &HashMap<String, Value>,
    ) -> Result<(), Error> {
        // Without an address there is nothing a delegated allocator can
        // attribute to the pod.
        for address in addresses {
            self.release_one(address, conf, args)?;
        }
        Ok(())
    }
}

/// Locates `plugin` in the CNI search path.
fn find_plugin(plugin: &str, search_path: &[PathBuf]) -> Result<PathBuf, Error> {
    search_path
        .iter()
        .map(|dir| dir.join(plugin))
        .find(|p| p.is_file())
        .ok_or_else(|| Error::Ipam(format!("plugin {plugin} not found on CNI_PATH")))
}

/// Executes a CNI sub-plugin with the standard environment and `data` on
/// stdin, returning its stdout on success or the decoded error document on
/// failure.
fn exec_plugin(plugin: &str, cmd: Cmd, data: &[u8], args: &CmdArgs) -> Result<Vec<u8>, Error> {
    let exe = find_plugin(plugin, &args.path)?;
    let cni_path = std::env::join_paths(&args.path)
        .map_err(|e| Error::Ipam(format!("invalid CNI_PATH: {e}")))?;

    let mut child = Command::new(&exe)
        .env(CNI_COMMAND, <&str>::from(cmd))
        .env(CNI_CONTAINERID, &args.container_id)
        .env(
            CNI_NETNS,
            args.netns.as_deref().unwrap_or_else(|| Path::new("")),
        )
        .env(CNI_IFNAME, &args.ifname)
        .env(CNI_ARGS, args.args.as_deref().unwrap_or_default())
        .env(CNI_PATH, cni_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::Ipam(format!("failed to execute {}: {e}", exe.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(data)
            .map_err(|e| Error::Ipam(format!("failed to write config to {plugin}: {e}")))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| Error::Ipam(format!("failed to wait for {plugin}: {e}")))?;

    if output.status.success() {
        return Ok(output.stdout);
    }

    match serde_json::from_slice::<ErrorResult>(&output.stdout) {
        Ok(doc) => Err(Error::from(&doc)),
        Err(_) => Err(Error::Ipam(format!(
            "{plugin} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stdout).trim()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs, os::unix::fs::PermissionsExt, path::Path};

    use crate::{
        ipam::{IpamAddConfig, IpamInvoker},
        types::{CmdArgs, IpamConfig, Ipv6Mode, NetworkConfig},
    };

    use super::{DelegatingInvoker, IPAM_STATE_FILE};

    fn write_plugin(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn conf(ipam_type: &str) -> NetworkConfig {
        NetworkConfig {
            cni_version: "1.0.0".to_string(),
            name: "azure".to_string(),
            r#type: "azure-vnet".to_string(),
            ipam: IpamConfig {
                r#type: ipam_type.to_string(),
                subnet: Some("10.0.1.0/24".to_string()),
                ..IpamConfig::default()
            },
            ..NetworkConfig::default()
        }
    }

    fn args(plugin_dir: &Path) -> CmdArgs {
        CmdArgs {
            container_id: "abc123".to_string(),
            ifname: "eth0".to_string(),
            path: vec![plugin_dir.to_path_buf()],
            ..CmdArgs::default()
        }
    }

    #[test]
    fn test_add_decodes_sub_plugin_result() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "fake-ipam",
            r#"echo '{"cniVersion":"1.0.0","ips":[{"address":"10.0.1.10/24","gateway":"10.0.1.1"}]}'"#,
        );

        let invoker = DelegatingInvoker::new(dir.path());
        let conf = conf("fake-ipam");
        let args = args(dir.path());
        let result = invoker
            .add(&IpamAddConfig {
                conf: &conf,
                args: &args,
            })
            .unwrap();

        let ipv4 = result.ipv4.unwrap();
        assert_eq!(ipv4.ips[0].address, "10.0.1.10/24");
        assert!(result.ipv6.is_none());
    }

    #[test]
    fn test_add_decodes_error_document() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "fake-ipam",
            r#"echo '{"cniVersion":"1.0.0","code":101,"msg":"IPAM failure","details":"bad subnet"}'; exit 1"#,
        );

        let invoker = DelegatingInvoker::new(dir.path());
        let conf = conf("fake-ipam");
        let args = args(dir.path());
        let err = invoker
            .add(&IpamAddConfig {
                conf: &conf,
                args: &args,
            })
            .unwrap_err();
        assert_eq!(u32::from(&err), 101);
        assert_eq!(err.details(), "bad subnet");
    }

    #[test]
    fn test_pool_exhausted_resets_allocator_state() {
        let dir = tempfile::tempdir().unwrap();
        write_plugin(
            dir.path(),
            "fake-ipam",
            r#"echo '{"cniVersion":"1.0.0","code":100,"msg":"no pools","details":"exhausted"}'; exit 1"#,
        );
        let state = dir.path().join(IPAM_STATE_FILE);
        fs::write(&state, "{}").unwrap();

        let invoker = DelegatingInvoker::new(dir.path());
        let conf = conf("fake-ipam");
        let args = args(dir.path());
        let err = invoker
            .add(&IpamAddConfig {
                conf: &conf,
                args: &args,
            })
            .unwrap_err();
        assert_eq!(u32::from(&err), 100);
        assert!(!state.exists());
    }

    #[test]
    fn test_dual_stack_failure_releases_ipv4() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");
        write_plugin(
            dir.path(),
            "fake-ipam",
            &format!(
                r#"if [ "$CNI_COMMAND" = "DEL" ]; then echo del >> {}; exit 0; fi
echo '{{"cniVersion":"1.0.0","ips":[{{"address":"10.0.1.10/24"}}]}}'"#,
                calls.display()
            ),
        );
        write_plugin(
            dir.path(),
            "fake-ipamv6",
            r#"echo '{"cniVersion":"1.0.0","code":101,"msg":"IPAM failure","details":"no v6"}'; exit 1"#,
        );

        let invoker = DelegatingInvoker::new(dir.path());
        let mut conf = conf("fake-ipam");
        conf.ipv6_mode = Some(Ipv6Mode::Ipv6Nat);
        let args = args(dir.path());
        let err = invoker
            .add(&IpamAddConfig {
                conf: &conf,
                args: &args,
            })
            .unwrap_err();
        assert_eq!(u32::from(&err), 101);
        assert_eq!(fs::read_to_string(&calls).unwrap().trim(), "del");
    }

    #[test]
    fn test_delete_empty_address_list_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = DelegatingInvoker::new(dir.path());
        let conf = conf("fake-ipam");
        let args = args(dir.path());
        // No sub-plugin exists, so any execution attempt would fail.
        invoker.delete(&[], &conf, &args, &HashMap::new()).unwrap();
    }

    #[test]
    fn test_delete_sets_address_on_delegated_config() {
        let dir = tempfile::tempdir().unwrap();
        let seen = dir.path().join("seen.json");
        let plugin = dir.path().join("fake-ipam");
        fs::write(&plugin, format!("#!/bin/sh\ncat > {}\n", seen.display())).unwrap();
        fs::set_permissions(&plugin, fs::Permissions::from_mode(0o755)).unwrap();

        let invoker = DelegatingInvoker::new(dir.path());
        let conf = conf("fake-ipam");
        let args = args(dir.path());
        invoker
            .delete(
                &["10.0.1.10/24".to_string()],
                &conf,
                &args,
                &HashMap::new(),
            )
            .unwrap();

        let delegated: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&seen).unwrap()).unwrap();
        assert_eq!(delegated["ipam"]["address"], "10.0.1.10/24");
        assert_eq!(delegated["ipam"]["type"], "fake-ipam");
    }
}
