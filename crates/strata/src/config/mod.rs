//! Engine configuration.
//!
//! Two layers feed a creation pass:
//! - [`FileConfig`]: admin policy loaded from `strata.toml`.
//! - [`EngineConfig`]: the per-invocation options derived from the command line,
//!   carrying the OCI [`Spec`] and the opened image descriptors.

mod identity;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{StrataError, StrataResult};
use strata_oci::Spec;

use crate::image::Image;

pub use identity::{Group, Identity, group_name, user_name};

/// Admin setting for the kernel overlay filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    /// Use overlay, warn when it is not usable.
    Yes,
    /// Never use overlay.
    No,
    /// Use overlay when the kernel supports it.
    #[default]
    Try,
}

impl OverlayMode {
    /// Returns true if overlay may be used at all.
    #[must_use]
    pub const fn allowed(self) -> bool {
        !matches!(self, Self::No)
    }
}

/// Default capability stance for root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootCapDefault {
    /// Grant every capability.
    #[default]
    Full,
    /// Grant what the capability file allows for root and its groups.
    File,
    /// Grant nothing.
    No,
}

/// How `/dev` is provided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountDev {
    /// Bind the host `/dev`.
    #[default]
    Yes,
    /// Build a minimal `/dev`.
    Minimal,
    /// No `/dev` at all.
    No,
}

/// Admin configuration (`strata.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    /// Allow the setuid workflow.
    pub allow_setuid: bool,
    /// Allow PID namespaces.
    pub allow_pid_ns: bool,
    /// Mount `/proc`.
    pub mount_proc: bool,
    /// Mount `/sys`.
    pub mount_sys: bool,
    /// `/dev` policy.
    pub mount_dev: MountDev,
    /// Mount a fresh devpts when a minimal `/dev` is built.
    pub mount_devpts: bool,
    /// Mount the user's home directory.
    pub mount_home: bool,
    /// Mount `/tmp` and `/var/tmp`.
    pub mount_tmp: bool,
    /// Mount every host filesystem.
    pub mount_hostfs: bool,
    /// Use slave propagation for the container root instead of private.
    pub mount_slave: bool,
    /// Admin bind paths (`src[:dst]`).
    pub bind_path: Vec<String>,
    /// Allow user `--bind` requests.
    pub user_bind_control: bool,
    /// Kernel overlay policy.
    pub enable_overlay: OverlayMode,
    /// Allow underlay layering.
    pub enable_underlay: bool,
    /// Update `/etc/passwd` inside the container.
    pub config_passwd: bool,
    /// Update `/etc/group` inside the container.
    pub config_group: bool,
    /// Bind the host `/etc/resolv.conf`.
    pub config_resolv_conf: bool,
    /// Default capabilities for root.
    pub root_default_capabilities: RootCapDefault,
    /// Allowed image directories (empty allows all).
    pub limit_container_paths: Vec<PathBuf>,
    /// Allowed image owners (empty allows all).
    pub limit_container_owners: Vec<String>,
    /// Allowed image groups (empty allows all).
    pub limit_container_groups: Vec<String>,
    /// Upper bound on loop devices searched.
    pub max_loop_devices: u32,
    /// Reuse loop devices for identical images.
    pub shared_loop_devices: bool,
    /// Maximum session size in MiB for in-memory sessions.
    pub sessiondir_max_size: u64,
    /// Filesystem type backing the session directory.
    pub memory_fs_type: String,
    /// CNI configuration directory.
    pub cni_configuration_path: PathBuf,
    /// CNI plugin directory.
    pub cni_plugin_path: PathBuf,
    /// Bind NVIDIA devices when requested.
    pub always_use_nv: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            allow_setuid: true,
            allow_pid_ns: true,
            mount_proc: true,
            mount_sys: true,
            mount_dev: MountDev::Yes,
            mount_devpts: true,
            mount_home: true,
            mount_tmp: true,
            mount_hostfs: false,
            mount_slave: true,
            bind_path: vec!["/etc/localtime".to_string(), "/etc/hosts".to_string()],
            user_bind_control: true,
            enable_overlay: OverlayMode::Try,
            enable_underlay: true,
            config_passwd: true,
            config_group: true,
            config_resolv_conf: true,
            root_default_capabilities: RootCapDefault::Full,
            limit_container_paths: Vec::new(),
            limit_container_owners: Vec::new(),
            limit_container_groups: Vec::new(),
            max_loop_devices: 256,
            shared_loop_devices: false,
            sessiondir_max_size: 16,
            memory_fs_type: "tmpfs".to_string(),
            cni_configuration_path: PathBuf::from("/etc/strata/network"),
            cni_plugin_path: PathBuf::from("/usr/libexec/strata/cni"),
            always_use_nv: false,
        }
    }
}

impl FileConfig {
    /// Load the admin configuration from a TOML file.
    pub fn load(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::config(format!(
                "unable to read configuration file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse the admin configuration from TOML text.
    pub fn parse(content: &str) -> StrataResult<Self> {
        toml::from_str(content)
            .map_err(|e| StrataError::config(format!("unable to parse configuration: {e}")))
    }
}

/// Per-invocation engine options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Image URI or path as given by the user (`instance://name` for joins).
    pub image: String,
    /// Opened image descriptors: the rootfs image first.
    pub images: Vec<Image>,
    /// Opened overlay images (`--overlay`).
    pub overlay_images: Vec<Image>,
    /// User bind requests (`src[:dst[:opts]]`).
    pub bind_path: Vec<String>,
    /// Scratch directories.
    pub scratch_dir: Vec<PathBuf>,
    /// Work directory backing /tmp, /var/tmp and scratch with `--contain`.
    pub workdir: Option<PathBuf>,
    /// Custom home (`src[:dst]`).
    pub home: Option<String>,
    /// Do not mount home.
    pub no_home: bool,
    /// Minimal mounts only.
    pub contain: bool,
    /// Writable image requested.
    pub writable: bool,
    /// Ephemeral writable overlay on tmpfs.
    pub writable_tmpfs: bool,
    /// Requested security options (`feature:value`).
    pub security: Vec<String>,
    /// Capabilities to add.
    pub add_caps: Vec<String>,
    /// Capabilities to drop.
    pub drop_caps: Vec<String>,
    /// Force full privileges (root only).
    pub keep_privs: bool,
    /// Drop all privileges (root only).
    pub no_privs: bool,
    /// Run as an instance.
    pub instance: bool,
    /// Instance name.
    pub instance_name: Option<String>,
    /// Do not run the `sinit` shim in a PID namespace.
    pub no_init: bool,
    /// Target UIDs (`uid:` security option, root only).
    pub target_uid: Vec<u32>,
    /// Target GIDs (`gid:` security option, root only).
    pub target_gid: Vec<u32>,
    /// Container hostname (UTS namespace).
    pub hostname: Option<String>,
    /// Network types (`--network`).
    pub network: Vec<String>,
    /// Extra CNI arguments.
    pub network_args: Vec<String>,
    /// Custom nameservers for resolv.conf.
    pub dns: Vec<String>,
    /// Additional libraries bound into `/.singularity.d/libs`.
    pub libraries: Vec<PathBuf>,
    /// Bind NVIDIA devices.
    pub nv: bool,
    /// Working directory requested for the process.
    pub cwd: Option<PathBuf>,
    /// Do not bind the current working directory.
    pub no_cwd: bool,
    /// Full `/dev` bind override (`--contain` forces minimal).
    pub dev_minimal: bool,
    /// The OCI configuration of the container process.
    pub oci: Spec,
}

impl EngineConfig {
    /// Load the engine configuration from a JSON document.
    pub fn load(path: &Path) -> StrataResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// The rootfs image, if any.
    #[must_use]
    pub fn image(&self) -> Option<&Image> {
        self.images.first()
    }

    /// User bind requests.
    #[must_use]
    pub fn bind_paths(&self) -> &[String] {
        &self.bind_path
    }

    /// Security options.
    #[must_use]
    pub fn security(&self) -> &[String] {
        &self.security
    }

    /// Capabilities to add.
    #[must_use]
    pub fn add_caps(&self) -> &[String] {
        &self.add_caps
    }

    /// Capabilities to drop.
    #[must_use]
    pub fn drop_caps(&self) -> &[String] {
        &self.drop_caps
    }

    /// Whether the container is contained.
    #[must_use]
    pub const fn contain(&self) -> bool {
        self.contain
    }

    /// Whether this is an instance.
    #[must_use]
    pub const fn instance(&self) -> bool {
        self.instance
    }

    /// Overlay images.
    #[must_use]
    pub fn overlay_images(&self) -> &[Image] {
        &self.overlay_images
    }

    /// Requested networks.
    #[must_use]
    pub fn network(&self) -> &[String] {
        &self.network
    }

    /// Cgroup path from the OCI configuration.
    #[must_use]
    pub fn cgroups_path(&self) -> Option<&str> {
        self.oci
            .linux
            .as_ref()
            .and_then(|l| l.cgroups_path.as_deref())
    }

    /// Instance name extracted from an `instance://` image URI.
    #[must_use]
    pub fn join_instance_name(&self) -> Option<&str> {
        self.image.strip_prefix("instance://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_defaults() {
        let config = FileConfig::parse("").unwrap();
        assert!(config.allow_setuid);
        assert_eq!(config.enable_overlay, OverlayMode::Try);
        assert_eq!(config.root_default_capabilities, RootCapDefault::Full);
        assert_eq!(config.max_loop_devices, 256);
    }

    #[test]
    fn file_config_overrides() {
        let config = FileConfig::parse(
            r#"
            enable-overlay = "no"
            enable-underlay = false
            root-default-capabilities = "file"
            mount-dev = "minimal"
            "#,
        )
        .unwrap();
        assert!(!config.enable_overlay.allowed());
        assert!(!config.enable_underlay);
        assert_eq!(config.root_default_capabilities, RootCapDefault::File);
        assert_eq!(config.mount_dev, MountDev::Minimal);
    }

    #[test]
    fn file_config_rejects_bad_value() {
        let err = FileConfig::parse("enable-overlay = \"sometimes\"").unwrap_err();
        assert!(matches!(err, StrataError::Config { .. }));
    }

    #[test]
    fn engine_config_instance_uri() {
        let config = EngineConfig {
            image: "instance://web".to_string(),
            ..Default::default()
        };
        assert_eq!(config.join_instance_name(), Some("web"));
    }
}
