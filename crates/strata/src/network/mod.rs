//! Container networking through CNI plugins.
//!
//! Network configurations are read from the admin CNI directory and each
//! requested network is attached to the network namespace of the container
//! process by running its plugin chain with `CNI_COMMAND=ADD`.

mod cni;

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use strata_common::{StrataError, StrataResult};

use crate::config::{EngineConfig, FileConfig};

pub use cni::{NetworkConfigList, PluginRuntime, load_networks, select_networks};

/// Attach the requested networks of `engine` to the network namespace of
/// `pid`.
pub fn setup(config: &FileConfig, engine: &EngineConfig, pid: i32) -> StrataResult<()> {
    let requested = engine.network();
    if requested.is_empty() || requested.iter().any(|n| n == "none") {
        tracing::debug!("No network requested");
        return Ok(());
    }

    let networks = load_networks(&config.cni_configuration_path)?;
    let selected = select_networks(&networks, requested)?;

    let netns_path = PathBuf::from(format!("/proc/{pid}/ns/net"));
    let netns = File::open(&netns_path).map_err(|e| StrataError::Config {
        message: format!("unable to open network namespace {}: {e}", netns_path.display()),
    })?;
    let held = PathBuf::from(format!("/proc/self/fd/{}", netns.as_raw_fd()));

    let runtime = PluginRuntime {
        container_id: engine
            .instance_name
            .clone()
            .unwrap_or_else(|| format!("strata-{pid}")),
        netns: held,
        plugin_dir: config.cni_plugin_path.clone(),
        args: engine.network_args.clone(),
    };
    for (index, network) in selected.iter().enumerate() {
        let ifname = format!("eth{index}");
        runtime.add(network, &ifname)?;
        tracing::info!(network = %network.name, ifname = %ifname, "Network attached");
    }
    drop(netns);
    Ok(())
}
