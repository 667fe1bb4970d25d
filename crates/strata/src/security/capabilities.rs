//! Linux capabilities management.
//!
//! One routine computes the capability set for root and non-root callers:
//! a starting stance, authorized additions, then drops, which always win.
//! The result fans out to the five OCI capability lists.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use serde::{Deserialize, Serialize};
use strata_common::{StrataError, StrataResult};

use crate::config::{Identity, RootCapDefault};

/// Normalize a user supplied capability name (`net_raw` → `CAP_NET_RAW`).
fn normalize(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    }
}

/// Parse capability names; `ALL` expands to every known capability.
///
/// Returns the known capabilities and the names that were not recognized.
#[must_use]
pub fn parse_names<S: AsRef<str>>(names: &[S]) -> (CapabilitySet, Vec<String>) {
    let mut set = CapabilitySet::empty();
    let mut unknown = Vec::new();
    for name in names
        .iter()
        .flat_map(|n| n.as_ref().split(','))
        .filter(|n| !n.trim().is_empty())
    {
        if name.trim().eq_ignore_ascii_case("all") {
            set = set.union(&CapabilitySet::full());
            continue;
        }
        match Capability::from_str(&normalize(name)) {
            Ok(cap) => {
                set.0.insert(cap.to_string());
            }
            Err(_) => unknown.push(name.trim().to_string()),
        }
    }
    (set, unknown)
}

/// A set of capabilities identified by their canonical `CAP_*` names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    /// No capabilities.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every capability known to this build.
    #[must_use]
    pub fn full() -> Self {
        Self(caps::all().into_iter().map(|c| c.to_string()).collect())
    }

    /// Returns true if `name` (in any accepted spelling) is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&normalize(name))
    }

    /// Number of capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union with another set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Capabilities of `self` not in `other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    /// Capabilities present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    /// Sorted capability names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    fn to_caps(&self) -> CapsHashSet {
        self.0
            .iter()
            .filter_map(|name| Capability::from_str(name).ok())
            .collect()
    }

    /// Apply the set to the calling thread: bounding, inheritable,
    /// effective, permitted and ambient.
    pub fn apply(&self) -> StrataResult<()> {
        tracing::debug!(capabilities = ?self.names(), "Applying capability set");
        let keep = self.to_caps();
        let wrap = |set: &str, e: caps::errors::CapsError| StrataError::Security {
            message: format!("failed to set {set} capabilities: {e}"),
        };

        for cap in caps::all() {
            if !keep.contains(&cap) {
                if let Err(e) = caps::drop(None, CapSet::Bounding, cap) {
                    tracing::warn!(capability = %cap, error = %e, "could not drop from bounding set");
                }
            }
        }
        caps::set(None, CapSet::Inheritable, &keep).map_err(|e| wrap("inheritable", e))?;
        caps::set(None, CapSet::Effective, &keep).map_err(|e| wrap("effective", e))?;
        caps::set(None, CapSet::Permitted, &keep).map_err(|e| wrap("permitted", e))?;

        if caps::runtime::ambient_set_supported().is_ok() {
            caps::clear(None, CapSet::Ambient).map_err(|e| wrap("ambient", e))?;
            for cap in &keep {
                if let Err(e) = caps::raise(None, CapSet::Ambient, *cap) {
                    tracing::warn!(capability = %cap, error = %e, "could not raise ambient capability");
                }
            }
        }
        Ok(())
    }
}

/// Admin capability policy (`capability.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityPolicy {
    /// Capabilities granted per user name.
    #[serde(default)]
    pub users: BTreeMap<String, Vec<String>>,
    /// Capabilities granted per group name.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

/// A principal of the capability policy.
#[derive(Debug, Clone, Copy)]
pub enum Principal<'a> {
    /// A user name.
    User(&'a str),
    /// A group name.
    Group(&'a str),
}

impl CapabilityPolicy {
    /// Load the policy; a missing file is an empty policy.
    pub fn load(path: &Path) -> StrataResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => serde_json::from_str(&json).map_err(|e| StrataError::Config {
                message: format!("invalid capability file {}: {e}", path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn granted(&self, principal: Principal<'_>) -> CapabilitySet {
        let names = match principal {
            Principal::User(name) => self.users.get(name),
            Principal::Group(name) => self.groups.get(name),
        };
        names.map_or_else(CapabilitySet::empty, |names| parse_names(names.as_slice()).0)
    }

    /// Split `requested` into the authorized and unauthorized capabilities
    /// for one principal.
    #[must_use]
    pub fn check(
        &self,
        principal: Principal<'_>,
        requested: &CapabilitySet,
    ) -> (CapabilitySet, CapabilitySet) {
        let granted = self.granted(principal);
        (requested.intersection(&granted), requested.difference(&granted))
    }

    /// Everything granted to a user and the groups they belong to.
    #[must_use]
    pub fn allowed_for(&self, identity: &Identity) -> CapabilitySet {
        identity
            .groups
            .iter()
            .fold(self.granted(Principal::User(&identity.name)), |set, group| {
                set.union(&self.granted(Principal::Group(&group.name)))
            })
    }
}

/// Inputs of a capability computation.
#[derive(Debug, Clone)]
pub struct CapabilityRequest<'a> {
    /// The caller.
    pub identity: &'a Identity,
    /// Admin default for root.
    pub root_default: RootCapDefault,
    /// Force full privileges (root only).
    pub keep_privs: bool,
    /// Drop all privileges (root only).
    pub no_privs: bool,
    /// Requested target uids and gids (root only).
    pub target_ids: &'a [u32],
    /// Capabilities to add.
    pub add: &'a [String],
    /// Capabilities to drop.
    pub drop: &'a [String],
}

/// Outcome of a capability computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCapabilities {
    /// The final set, applied identically to all five OCI lists.
    pub set: CapabilitySet,
    /// Whether `no_new_privileges` must be set.
    pub no_new_privileges: bool,
}

/// Compute the capability set of the container process.
#[must_use]
pub fn prepare(request: &CapabilityRequest<'_>, policy: &CapabilityPolicy) -> PreparedCapabilities {
    let (add, unknown_add) = parse_names(request.add);
    let (drop, unknown_drop) = parse_names(request.drop);
    for name in unknown_add.iter().chain(&unknown_drop) {
        tracing::warn!(capability = %name, "unknown capability, ignoring");
    }

    let identity = request.identity;
    let (base, add, no_new_privileges) = if identity.is_root() {
        let mut stance = request.root_default;
        if request.keep_privs {
            stance = RootCapDefault::Full;
        }
        if request.no_privs || request.target_ids.iter().any(|id| *id != 0) {
            stance = RootCapDefault::No;
        }
        let base = match stance {
            RootCapDefault::Full => CapabilitySet::full(),
            RootCapDefault::File => policy.allowed_for(identity),
            RootCapDefault::No => CapabilitySet::empty(),
        };
        (base, add, stance == RootCapDefault::No)
    } else {
        // only requested capabilities the policy grants are kept
        let allowed = policy.allowed_for(identity);
        let unauthorized = add.difference(&allowed);
        for name in unauthorized.names() {
            tracing::warn!(capability = %name, user = %identity.name, "capability not authorized, ignoring");
        }
        let authorized = add.intersection(&allowed);
        (CapabilitySet::empty(), authorized, true)
    };

    let set = base.union(&add).difference(&drop);
    tracing::debug!(capabilities = ?set.names(), "Prepared capabilities");
    PreparedCapabilities {
        set,
        no_new_privileges,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::Group;

    fn user(uid: u32, name: &str) -> Identity {
        Identity {
            uid,
            gid: uid,
            name: name.to_string(),
            home: PathBuf::from("/home").join(name),
            shell: "/bin/sh".to_string(),
            gecos: String::new(),
            groups: vec![Group {
                gid: 100,
                name: "users".to_string(),
            }],
        }
    }

    fn request<'a>(identity: &'a Identity, add: &'a [String], drop: &'a [String]) -> CapabilityRequest<'a> {
        CapabilityRequest {
            identity,
            root_default: RootCapDefault::Full,
            keep_privs: false,
            no_privs: false,
            target_ids: &[],
            add,
            drop,
        }
    }

    #[test]
    fn names_are_normalized() {
        let (set, unknown) = parse_names(&["net_raw", "CAP_CHOWN,sys_admin", "bogus"]);
        assert_eq!(set.names(), vec!["CAP_CHOWN", "CAP_NET_RAW", "CAP_SYS_ADMIN"]);
        assert_eq!(unknown, vec!["bogus"]);
        assert_eq!(parse_names(&["all"]).0, CapabilitySet::full());
    }

    #[test]
    fn drop_wins_over_add() {
        let root = user(0, "root");
        let caps = vec!["CAP_NET_RAW".to_string()];
        let prepared = prepare(&request(&root, &caps, &caps), &CapabilityPolicy::default());
        assert!(!prepared.set.contains("CAP_NET_RAW"));
        assert!(prepared.set.contains("CAP_SYS_ADMIN"));
    }

    #[test]
    fn root_stances() {
        let root = user(0, "root");
        let mut req = request(&root, &[], &[]);
        req.root_default = RootCapDefault::No;
        let none = prepare(&req, &CapabilityPolicy::default());
        assert!(none.set.is_empty());
        assert!(none.no_new_privileges);

        req.keep_privs = true;
        let full = prepare(&req, &CapabilityPolicy::default());
        assert_eq!(full.set, CapabilitySet::full());
        assert!(!full.no_new_privileges);

        req.keep_privs = false;
        req.no_privs = true;
        req.root_default = RootCapDefault::Full;
        assert!(prepare(&req, &CapabilityPolicy::default()).no_new_privileges);

        req.no_privs = false;
        req.target_ids = &[1000];
        let targeted = prepare(&req, &CapabilityPolicy::default());
        assert!(targeted.set.is_empty());
        assert!(targeted.no_new_privileges);
    }

    #[test]
    fn non_root_only_gets_authorized_adds() {
        let alice = user(1000, "alice");
        let mut policy = CapabilityPolicy::default();
        policy.groups.insert("users".to_string(), vec!["CAP_NET_BIND_SERVICE".to_string()]);

        let add = vec!["CAP_SYS_ADMIN".to_string(), "net_bind_service".to_string()];
        let prepared = prepare(&request(&alice, &add, &[]), &policy);
        assert_eq!(prepared.set.names(), vec!["CAP_NET_BIND_SERVICE"]);
        assert!(prepared.no_new_privileges);

        let (authorized, unauthorized) =
            policy.check(Principal::Group("users"), &parse_names(add.as_slice()).0);
        assert_eq!(authorized.names(), vec!["CAP_NET_BIND_SERVICE"]);
        assert_eq!(unauthorized.names(), vec!["CAP_SYS_ADMIN"]);
    }

    #[test]
    fn non_root_without_request_gets_nothing() {
        let alice = user(1000, "alice");
        let mut policy = CapabilityPolicy::default();
        policy.groups.insert("users".to_string(), vec!["CAP_NET_BIND_SERVICE".to_string()]);
        policy.users.insert("alice".to_string(), vec!["CAP_CHOWN".to_string()]);

        let prepared = prepare(&request(&alice, &[], &[]), &policy);
        assert!(prepared.set.is_empty());
        assert!(prepared.no_new_privileges);
    }

    #[test]
    fn missing_policy_file_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let policy = CapabilityPolicy::load(&temp.path().join("capability.json")).unwrap();
        assert!(policy.users.is_empty());

        let file = temp.path().join("bad.json");
        std::fs::write(&file, "{").unwrap();
        assert!(CapabilityPolicy::load(&file).is_err());
    }
}
