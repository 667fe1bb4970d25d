//! Container security features.
//!
//! Prepares the OCI process description of the container:
//! - capability sets from the admin policy and user requests
//! - SELinux or AppArmor exec labels
//! - seccomp profiles
//! - namespace restrictions
//!
//! and applies them to the process right before exec.

mod apparmor;
mod capabilities;
pub mod seccomp;
mod selinux;

use std::path::PathBuf;

use strata_common::{StrataError, StrataResult};
use strata_oci::Spec;
use strata_oci::runtime::{Capabilities, NamespaceType};

use crate::config::{EngineConfig, FileConfig, Identity};

pub use apparmor::AppArmorProfile;
pub use capabilities::{
    CapabilityPolicy, CapabilityRequest, CapabilitySet, PreparedCapabilities, Principal,
    parse_names, prepare as prepare_capabilities,
};
pub use selinux::SELinuxContext;

/// Parsed `feature:value` security options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityOptions {
    /// SELinux exec context.
    pub selinux: Option<SELinuxContext>,
    /// AppArmor exec profile.
    pub apparmor: Option<AppArmorProfile>,
    /// Seccomp profile path.
    pub seccomp: Option<PathBuf>,
    /// Target UIDs.
    pub uids: Vec<u32>,
    /// Target GIDs.
    pub gids: Vec<u32>,
}

fn parse_ids(feature: &str, value: &str) -> StrataResult<Vec<u32>> {
    value
        .split([',', ':'])
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.trim().parse().map_err(|_| StrataError::Security {
                message: format!("{feature}: invalid id {v:?}"),
            })
        })
        .collect()
}

impl SecurityOptions {
    /// Parse `--security` options.
    pub fn parse(options: &[String]) -> StrataResult<Self> {
        let mut parsed = Self::default();
        for option in options {
            let Some((feature, value)) = option.split_once(':') else {
                return Err(StrataError::Security {
                    message: format!("security option {option:?} is not feature:value"),
                });
            };
            match feature.trim() {
                "selinux" => parsed.selinux = Some(SELinuxContext::parse(value)?),
                "apparmor" => parsed.apparmor = Some(AppArmorProfile::new(value)?),
                "seccomp" => parsed.seccomp = Some(PathBuf::from(value.trim())),
                "uid" => parsed.uids.extend(parse_ids("uid", value)?),
                "gid" => parsed.gids.extend(parse_ids("gid", value)?),
                other => tracing::warn!(feature = other, "unknown security feature, ignoring"),
            }
        }
        if parsed.selinux.is_some() && parsed.apparmor.is_some() {
            return Err(StrataError::Security {
                message: "selinux and apparmor can't be requested together".to_string(),
            });
        }
        Ok(parsed)
    }
}

/// Namespace restrictions from the admin configuration.
pub fn prepare_namespaces(spec: &mut Spec, config: &FileConfig) {
    if spec.has_namespace(NamespaceType::Pid) && !config.allow_pid_ns {
        tracing::warn!("PID namespaces are disabled by the administrator, ignoring");
        if let Some(linux) = spec.linux.as_mut() {
            linux.namespaces.retain(|ns| ns.ns_type != NamespaceType::Pid);
        }
    }
}

/// Fill the security-relevant parts of `spec` for a creation pass or a join.
pub fn prepare(
    spec: &mut Spec,
    engine: &EngineConfig,
    config: &FileConfig,
    identity: &Identity,
    policy: &CapabilityPolicy,
) -> StrataResult<SecurityOptions> {
    let mut options = SecurityOptions::parse(engine.security())?;
    options.uids.extend(&engine.target_uid);
    options.gids.extend(&engine.target_gid);

    if !identity.is_root() && (!options.uids.is_empty() || !options.gids.is_empty()) {
        return Err(StrataError::Security {
            message: "uid and gid security options require root".to_string(),
        });
    }

    prepare_namespaces(spec, config);

    let target_ids: Vec<u32> = options.uids.iter().chain(&options.gids).copied().collect();
    let prepared = prepare_capabilities(
        &CapabilityRequest {
            identity,
            root_default: config.root_default_capabilities,
            keep_privs: engine.keep_privs,
            no_privs: engine.no_privs,
            target_ids: &target_ids,
            add: engine.add_caps(),
            drop: engine.drop_caps(),
        },
        policy,
    );

    let process = spec.process_mut();
    process.capabilities = Some(Capabilities::uniform(&prepared.set.names()));
    process.no_new_privileges |= prepared.no_new_privileges;
    if let Some(uid) = options.uids.first() {
        process.user.uid = *uid;
    }
    if let Some((gid, extra)) = options.gids.split_first() {
        process.user.gid = *gid;
        process.user.additional_gids = extra.to_vec();
    }
    if let Some(context) = &options.selinux {
        process.selinux_label = Some(context.to_string());
    }
    if let Some(profile) = &options.apparmor {
        process.apparmor_profile = Some(profile.name.clone());
    }

    if let Some(path) = &options.seccomp {
        let profile = seccomp::load_profile(path)?;
        spec.linux_mut().seccomp = Some(profile);
    }

    tracing::debug!(
        capabilities = prepared.set.len(),
        no_new_privileges = spec.process.as_ref().is_some_and(|p| p.no_new_privileges),
        "Security prepared"
    );
    Ok(options)
}

/// Apply the prepared OCI process security to the calling thread, in exec
/// order: labels, capabilities, no_new_privs, then seccomp.
pub fn apply(spec: &Spec) -> StrataResult<()> {
    let Some(process) = &spec.process else {
        return Ok(());
    };
    if let Some(label) = &process.selinux_label {
        SELinuxContext::parse(label)?.apply()?;
    }
    if let Some(profile) = &process.apparmor_profile {
        AppArmorProfile::new(profile)?.apply()?;
    }
    if let Some(caps) = &process.capabilities {
        parse_names(caps.bounding.as_slice()).0.apply()?;
    }
    if process.no_new_privileges {
        rustix::thread::set_no_new_privs(true).map_err(|e| StrataError::Security {
            message: format!("failed to set no_new_privs: {e}"),
        })?;
    }
    if let Some(profile) = spec.linux.as_ref().and_then(|l| l.seccomp.as_ref()) {
        seccomp::apply(profile)?;
    }
    Ok(())
}
