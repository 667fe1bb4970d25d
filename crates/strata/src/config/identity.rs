//! Identity of the invoking user.

use std::path::{Path, PathBuf};

use strata_common::{StrataError, StrataResult};

/// A group the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Group ID.
    pub gid: u32,
    /// Group name.
    pub name: String,
}

/// Invoking user as seen on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Real user ID.
    pub uid: u32,
    /// Real group ID.
    pub gid: u32,
    /// User name.
    pub name: String,
    /// Home directory.
    pub home: PathBuf,
    /// Login shell.
    pub shell: String,
    /// GECOS field.
    pub gecos: String,
    /// Primary and supplementary groups.
    pub groups: Vec<Group>,
}

impl Identity {
    /// Resolve the identity of the current process from the host databases.
    pub fn current() -> StrataResult<Self> {
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        let gids: Vec<u32> = rustix::process::getgroups()
            .map_err(|e| StrataError::Io(e.into()))?
            .into_iter()
            .map(rustix::process::Gid::as_raw)
            .collect();
        Self::lookup(
            Path::new("/etc/passwd"),
            Path::new("/etc/group"),
            uid,
            gid,
            &gids,
        )
    }

    /// Resolve an identity from passwd and group files.
    pub fn lookup(
        passwd: &Path,
        group: &Path,
        uid: u32,
        gid: u32,
        supplementary: &[u32],
    ) -> StrataResult<Self> {
        let passwd_content = std::fs::read_to_string(passwd)?;
        let entry = passwd_content
            .lines()
            .filter_map(parse_passwd_line)
            .find(|e| e.uid == uid)
            .ok_or_else(|| StrataError::config(format!("no passwd entry for uid {uid}")))?;

        let group_content = std::fs::read_to_string(group).unwrap_or_default();
        let groups = group_content
            .lines()
            .filter_map(parse_group_line)
            .filter(|(g, _, members)| {
                *g == gid || supplementary.contains(g) || members.iter().any(|m| m == &entry.name)
            })
            .map(|(gid, name, _)| Group { gid, name })
            .collect();

        Ok(Self {
            uid,
            gid,
            name: entry.name,
            home: entry.home,
            shell: entry.shell,
            gecos: entry.gecos,
            groups,
        })
    }

    /// Returns true for uid 0.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Name of the primary group, if known.
    #[must_use]
    pub fn primary_group(&self) -> Option<&Group> {
        self.groups.iter().find(|g| g.gid == self.gid)
    }

    /// A passwd line describing this user.
    #[must_use]
    pub fn passwd_line(&self, home: &Path) -> String {
        format!(
            "{}:x:{}:{}:{}:{}:{}\n",
            self.name,
            self.uid,
            self.gid,
            self.gecos,
            home.display(),
            self.shell
        )
    }
}

/// Name of `uid` in a passwd file.
#[must_use]
pub fn user_name(passwd: &Path, uid: u32) -> Option<String> {
    std::fs::read_to_string(passwd)
        .ok()?
        .lines()
        .filter_map(parse_passwd_line)
        .find(|e| e.uid == uid)
        .map(|e| e.name)
}

/// Name of `gid` in a group file.
#[must_use]
pub fn group_name(group: &Path, gid: u32) -> Option<String> {
    std::fs::read_to_string(group)
        .ok()?
        .lines()
        .filter_map(parse_group_line)
        .find(|(g, _, _)| *g == gid)
        .map(|(_, name, _)| name)
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gecos: String,
    home: PathBuf,
    shell: String,
}

fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    if line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        return None;
    }
    Some(PasswdEntry {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        gecos: fields[4].to_string(),
        home: PathBuf::from(fields[5]),
        shell: fields[6].to_string(),
    })
}

fn parse_group_line(line: &str) -> Option<(u32, String, Vec<String>)> {
    if line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 4 {
        return None;
    }
    let members = fields[3]
        .split(',')
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect();
    Some((fields[2].parse().ok()?, fields[0].to_string(), members))
}
