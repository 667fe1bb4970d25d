//! Seccomp syscall filtering.
//!
//! OCI profiles carry an action per syscall rule; a seccompiler filter has one
//! action for every matched rule. Rules whose action equals the default are
//! no-ops and are dropped; the remaining rules must agree on one action.

use std::collections::HashMap;
use std::path::Path;

use seccompiler::BpfProgram;
use serde_json::{Value, json};
use strata_common::{StrataError, StrataResult};
use strata_oci::runtime::{Seccomp, SeccompAction, SeccompArg, SeccompOperator};

const FILTER_NAME: &str = "container";

fn security(message: impl Into<String>) -> StrataError {
    StrataError::Security {
        message: message.into(),
    }
}

/// Load an OCI seccomp profile from a JSON file.
pub fn load_profile(path: &Path) -> StrataResult<Seccomp> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| security(format!("can't read seccomp profile {}: {e}", path.display())))?;
    serde_json::from_str(&json)
        .map_err(|e| security(format!("invalid seccomp profile {}: {e}", path.display())))
}

fn action(action: SeccompAction, errno: Option<u32>) -> Value {
    match action {
        SeccompAction::ScmpActAllow => json!("allow"),
        SeccompAction::ScmpActErrno => json!({ "errno": errno.unwrap_or(libc::EPERM as u32) }),
        SeccompAction::ScmpActKill | SeccompAction::ScmpActKillThread => json!("kill_thread"),
        SeccompAction::ScmpActKillProcess => json!("kill_process"),
        SeccompAction::ScmpActTrap => json!("trap"),
        SeccompAction::ScmpActTrace => json!({ "trace": errno.unwrap_or(0) }),
        SeccompAction::ScmpActLog => json!("log"),
    }
}

fn condition(arg: &SeccompArg) -> Value {
    let (op, val) = match arg.op {
        SeccompOperator::ScmpCmpNe => (json!("ne"), arg.value),
        SeccompOperator::ScmpCmpLt => (json!("lt"), arg.value),
        SeccompOperator::ScmpCmpLe => (json!("le"), arg.value),
        SeccompOperator::ScmpCmpEq => (json!("eq"), arg.value),
        SeccompOperator::ScmpCmpGe => (json!("ge"), arg.value),
        SeccompOperator::ScmpCmpGt => (json!("gt"), arg.value),
        SeccompOperator::ScmpCmpMaskedEq => (
            json!({ "masked_eq": arg.value }),
            arg.value_two.unwrap_or_default(),
        ),
    };
    json!({ "index": arg.index, "type": "qword", "op": op, "val": val })
}

/// Translate an OCI profile into seccompiler's JSON filter format.
pub fn to_filter_json(profile: &Seccomp) -> StrataResult<Value> {
    let default = action(profile.default_action, profile.default_errno_ret);

    let mut filter_action: Option<Value> = None;
    let mut rules = Vec::new();
    for syscall in &profile.syscalls {
        let rule_action = action(syscall.action, syscall.errno_ret);
        if rule_action == default {
            continue;
        }
        match &filter_action {
            Some(existing) if *existing != rule_action => {
                return Err(security(format!(
                    "seccomp rules mix actions {existing} and {rule_action}"
                )));
            }
            Some(_) => {}
            None => filter_action = Some(rule_action),
        }
        for name in &syscall.names {
            let mut rule = json!({ "syscall": name });
            if !syscall.args.is_empty() {
                rule["args"] = Value::Array(syscall.args.iter().map(condition).collect());
            }
            rules.push(rule);
        }
    }

    let mut filters = serde_json::Map::new();
    filters.insert(
        FILTER_NAME.to_string(),
        json!({
            "default_action": default,
            "filter_action": filter_action.unwrap_or_else(|| json!("allow")),
            "filter": rules,
        }),
    );
    Ok(Value::Object(filters))
}

fn target_arch() -> StrataResult<seccompiler::TargetArch> {
    #[cfg(target_arch = "x86_64")]
    return Ok(seccompiler::TargetArch::x86_64);

    #[cfg(target_arch = "aarch64")]
    return Ok(seccompiler::TargetArch::aarch64);

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    return Err(StrataError::Unsupported {
        feature: format!("seccomp on {}", std::env::consts::ARCH),
    });
}

/// Compile an OCI profile to BPF.
pub fn compile(profile: &Seccomp) -> StrataResult<BpfProgram> {
    let filter = to_filter_json(profile)?;
    let bytes = serde_json::to_vec(&filter)?;
    let mut programs: HashMap<String, BpfProgram> =
        seccompiler::compile_from_json(bytes.as_slice(), target_arch()?)
            .map_err(|e| security(format!("failed to compile seccomp filter: {e}")))?;
    programs
        .remove(FILTER_NAME)
        .ok_or_else(|| security("seccomp compilation produced no filter"))
}

/// Compile and install an OCI profile on the calling thread.
pub fn apply(profile: &Seccomp) -> StrataResult<()> {
    let program = compile(profile)?;
    tracing::debug!(
        default_action = ?profile.default_action,
        rules = profile.syscalls.len(),
        "Applying seccomp filter"
    );
    seccompiler::apply_filter(&program)
        .map_err(|e| security(format!("failed to apply seccomp filter: {e}")))?;
    tracing::info!("Seccomp filter applied");
    Ok(())
}
