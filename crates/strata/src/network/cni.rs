//! CNI configuration lists and plugin invocation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_common::{StrataError, StrataResult};

/// `PATH` of plugin processes.
const PLUGIN_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Versions of the CNI specification this runtime speaks.
const SUPPORTED_CNI_VERSIONS: &[&str] = &["1.0.0", "0.4.0", "0.3.1"];

/// A network configuration list (`*.conflist`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfigList {
    /// CNI specification version.
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Plugin configurations, run in order.
    pub plugins: Vec<Value>,
}

impl NetworkConfigList {
    fn parse(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_list = path.extension().is_some_and(|ext| ext == "conflist");
        let list = if is_list {
            serde_json::from_str::<Self>(&content)?
        } else {
            // a single plugin configuration
            let plugin: Value = serde_json::from_str(&content)?;
            let field = |key: &str| plugin.get(key).and_then(Value::as_str).map(str::to_string);
            Self {
                cni_version: field("cniVersion").unwrap_or_default(),
                name: field("name").unwrap_or_default(),
                plugins: vec![plugin],
            }
        };
        if !SUPPORTED_CNI_VERSIONS.contains(&list.cni_version.as_str()) {
            return Err(StrataError::config(format!(
                "{}: unsupported CNI version {:?}",
                path.display(),
                list.cni_version
            )));
        }
        if list.name.is_empty() || list.plugins.is_empty() {
            return Err(StrataError::config(format!(
                "{}: network without name or plugins",
                path.display()
            )));
        }
        Ok(list)
    }
}

/// Load every network configuration of `dir`, sorted by file name.
pub fn load_networks(dir: &Path) -> StrataResult<Vec<NetworkConfigList>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        StrataError::config(format!("unable to read CNI configuration directory {}: {e}", dir.display()))
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == "conflist" || ext == "conf" || ext == "json")
        })
        .collect();
    paths.sort();

    let mut networks = Vec::new();
    for path in paths {
        match NetworkConfigList::parse(&path) {
            Ok(list) => networks.push(list),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping CNI configuration"),
        }
    }
    Ok(networks)
}

/// Pick the networks named in `requested`, in request order.
pub fn select_networks<'a>(
    networks: &'a [NetworkConfigList],
    requested: &[String],
) -> StrataResult<Vec<&'a NetworkConfigList>> {
    requested
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            networks
                .iter()
                .find(|n| n.name == name)
                .ok_or_else(|| StrataError::config(format!("network {name} is not configured")))
        })
        .collect()
}

/// Environment shared by every plugin call.
#[derive(Debug, Clone)]
pub struct PluginRuntime {
    /// `CNI_CONTAINERID`.
    pub container_id: String,
    /// `CNI_NETNS`.
    pub netns: PathBuf,
    /// Directory holding the plugin binaries, also `CNI_PATH`.
    pub plugin_dir: PathBuf,
    /// `KEY=VALUE` pairs for `CNI_ARGS`.
    pub args: Vec<String>,
}

impl PluginRuntime {
    /// Run the plugin chain of `network` for interface `ifname`. Returns the
    /// result of the last plugin.
    pub fn add(&self, network: &NetworkConfigList, ifname: &str) -> StrataResult<Value> {
        let mut previous: Option<Value> = None;
        for plugin in &network.plugins {
            let mut conf = plugin.clone();
            let Some(object) = conf.as_object_mut() else {
                return Err(StrataError::config(format!(
                    "network {}: plugin configuration is not an object",
                    network.name
                )));
            };
            object.insert("cniVersion".to_string(), Value::from(network.cni_version.clone()));
            object.insert("name".to_string(), Value::from(network.name.clone()));
            if let Some(result) = previous.take() {
                object.insert("prevResult".to_string(), result);
            }
            previous = Some(self.exec("ADD", &conf, ifname)?);
        }
        Ok(previous.unwrap_or(Value::Null))
    }

    fn exec(&self, command: &str, conf: &Value, ifname: &str) -> StrataResult<Value> {
        let kind = conf
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty() && !t.contains('/'))
            .ok_or_else(|| StrataError::config("CNI plugin without a valid type"))?;
        let binary = self.plugin_dir.join(kind);
        tracing::debug!(plugin = %binary.display(), command, ifname, "Running CNI plugin");

        let mut child = Command::new(&binary)
            .env_clear()
            .env("PATH", PLUGIN_PATH)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &self.container_id)
            .env("CNI_NETNS", &self.netns)
            .env("CNI_IFNAME", ifname)
            .env("CNI_PATH", &self.plugin_dir)
            .env("CNI_ARGS", self.args.join(";"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| StrataError::config(format!("unable to run CNI plugin {}: {e}", binary.display())))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(conf)?)?;
        }
        let output = child.wait_with_output()?;

        let result: Value = if output.stdout.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&output.stdout)?
        };
        if !output.status.success() {
            let msg = result
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(StrataError::Internal {
                message: format!("CNI plugin {kind} failed ({}): {msg}", output.status),
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn write_conf(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn configurations_loaded_and_selected() {
        let temp = tempfile::tempdir().unwrap();
        write_conf(
            temp.path(),
            "10-bridge.conflist",
            r#"{"cniVersion":"1.0.0","name":"bridge","plugins":[{"type":"bridge"},{"type":"portmap"}]}"#,
        );
        write_conf(temp.path(), "20-ptp.conf", r#"{"cniVersion":"0.4.0","name":"ptp","type":"ptp"}"#);
        write_conf(temp.path(), "30-bad.conflist", r#"{"cniVersion":"9.9.9","name":"bad","plugins":[{}]}"#);

        let networks = load_networks(temp.path()).unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].plugins.len(), 2);
        assert_eq!(networks[1].name, "ptp");

        let selected = select_networks(&networks, &["ptp,bridge".to_string()]).unwrap();
        assert_eq!(selected[0].name, "ptp");
        assert_eq!(selected[1].name, "bridge");
        assert!(select_networks(&networks, &["macvlan".to_string()]).is_err());
    }

    #[test]
    fn plugin_chain_receives_previous_result() {
        let temp = tempfile::tempdir().unwrap();
        let plugin = temp.path().join("echo");
        std::fs::write(
            &plugin,
            "#!/bin/sh\nprintf '{\"cniVersion\":\"1.0.0\",\"command\":\"%s\",\"ifname\":\"%s\",\"stdin\":' \"$CNI_COMMAND\" \"$CNI_IFNAME\"\ncat\nprintf '}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&plugin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let network = NetworkConfigList {
            cni_version: "1.0.0".to_string(),
            name: "test".to_string(),
            plugins: vec![serde_json::json!({"type": "echo"}), serde_json::json!({"type": "echo"})],
        };
        let runtime = PluginRuntime {
            container_id: "web".to_string(),
            netns: PathBuf::from("/proc/self/ns/net"),
            plugin_dir: temp.path().to_path_buf(),
            args: vec!["IgnoreUnknown=1".to_string()],
        };
        let result = runtime.add(&network, "eth0").unwrap();
        assert_eq!(result["command"], "ADD");
        assert_eq!(result["ifname"], "eth0");
        assert_eq!(result["stdin"]["name"], "test");
        assert_eq!(result["stdin"]["prevResult"]["command"], "ADD");
    }

    #[test]
    fn plugin_type_must_be_a_name() {
        let runtime = PluginRuntime {
            container_id: "web".to_string(),
            netns: PathBuf::from("/proc/self/ns/net"),
            plugin_dir: PathBuf::from("/nonexistent"),
            args: Vec::new(),
        };
        let network = NetworkConfigList {
            cni_version: "1.0.0".to_string(),
            name: "test".to_string(),
            plugins: vec![serde_json::json!({"type": "../bin/sh"})],
        };
        assert!(runtime.add(&network, "eth0").is_err());
    }
}
