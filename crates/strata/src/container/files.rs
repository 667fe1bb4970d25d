//! Libraries, identity files, resolv.conf, hostname and action scripts.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use strata_common::paths::{ACTIONS_DIR, CONTAINER_META_DIR};
use strata_common::{StrataError, StrataResult};
use strata_oci::runtime::NamespaceType;

use super::{Container, Mounter, recoverable};
use crate::config::Identity;
use crate::mount::{MountFlags, MountTag};
use crate::rpc::Ops;

/// Container passwd with the caller appended when missing.
fn passwd_content(existing: &str, identity: &Identity, home: &Path) -> String {
    let mut content = existing.to_string();
    let present = existing.lines().any(|line| {
        line.split(':').nth(2).and_then(|uid| uid.parse::<u32>().ok()) == Some(identity.uid)
    });
    if !present {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&identity.passwd_line(home));
    }
    content
}

/// Container group with the caller's groups added or extended.
fn group_content(existing: &str, identity: &Identity) -> String {
    let mut seen = Vec::new();
    let mut content = String::new();
    for line in existing.lines() {
        let fields: Vec<&str> = line.splitn(4, ':').collect();
        let gid = fields.get(2).and_then(|g| g.parse::<u32>().ok());
        match gid {
            Some(gid) if fields.len() == 4 && identity.groups.iter().any(|g| g.gid == gid) => {
                seen.push(gid);
                let members = fields[3];
                if members.split(',').any(|m| m == identity.name) {
                    content.push_str(line);
                } else if members.is_empty() {
                    let _ = write!(content, "{line}{}", identity.name);
                } else {
                    let _ = write!(content, "{line},{}", identity.name);
                }
            }
            _ => content.push_str(line),
        }
        content.push('\n');
    }
    for group in identity.groups.iter().filter(|g| !seen.contains(&g.gid)) {
        let _ = writeln!(content, "{}:x:{}:{}", group.name, group.gid, identity.name);
    }
    content
}

/// resolv.conf listing the given nameservers.
fn resolv_conf(dns: &[String]) -> String {
    dns.iter()
        .flat_map(|d| d.split(','))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .fold(String::new(), |mut out, server| {
            let _ = writeln!(out, "nameserver {server}");
            out
        })
}

impl<O: Ops + 'static> Container<O> {
    pub(super) fn add_libraries(&mut self) -> StrataResult<()> {
        if self.engine.libraries.is_empty() {
            return Ok(());
        }
        let libs_dest = Path::new(CONTAINER_META_DIR).join("libs");
        let libs_dir = self.mounter.session_mut().add_dir("libs")?;
        let flags = MountFlags::NOSUID | MountFlags::NODEV | MountFlags::RDONLY;
        recoverable(
            "libraries",
            self.system
                .points
                .add_bind(MountTag::Libs, &libs_dir, &libs_dest, flags),
        )?;

        let libraries = self.engine.libraries.clone();
        for library in libraries {
            let Some(name) = library.file_name() else {
                tracing::warn!(library = %library.display(), "ignoring library without a file name");
                continue;
            };
            self.mounter
                .session_mut()
                .add_file(Path::new("libs").join(name), Vec::new())?;
            recoverable(
                "library",
                self.system
                    .points
                    .add_bind(MountTag::Libs, &library, libs_dest.join(name), flags),
            )?;
        }
        Ok(())
    }

    pub(super) fn add_identity_files(&mut self) -> StrataResult<()> {
        if self.identity.is_root() {
            return Ok(());
        }
        let session = self.mounter.session().path().to_path_buf();
        let flags = MountFlags::NOSUID | MountFlags::NODEV;

        if self.config.config_passwd {
            let identity = self.identity.clone();
            let home = self.home_dest.clone().unwrap_or_else(|| identity.home.clone());
            self.stage_from_container("passwd", move |existing| {
                passwd_content(existing, &identity, &home)
            });
            recoverable(
                "passwd",
                self.system
                    .points
                    .add_file_bind(MountTag::Files, session.join("passwd"), "/etc/passwd", flags),
            )?;
        }

        if self.config.config_group {
            let identity = self.identity.clone();
            self.stage_from_container("group", move |existing| group_content(existing, &identity));
            recoverable(
                "group",
                self.system
                    .points
                    .add_file_bind(MountTag::Files, session.join("group"), "/etc/group", flags),
            )?;
        }
        Ok(())
    }

    /// Once the final root is assembled, derive a session file from the
    /// container's `/etc/<name>`. A missing or unreadable source leaves the
    /// session file absent so its bind is skipped.
    fn stage_from_container(
        &mut self,
        name: &'static str,
        build: impl FnOnce(&str) -> String + 'static,
    ) {
        self.system
            .run_after_tag(MountTag::Layer, move |mounter: &mut Mounter<O>, _| {
                let source = mounter.session().final_join(&Path::new("/etc").join(name));
                match std::fs::read_to_string(&source) {
                    Ok(existing) => {
                        mounter.session_mut().add_file(name, build(&existing))?;
                        tracing::debug!(file = name, "Staged container identity file");
                    }
                    Err(e) => {
                        tracing::warn!(file = %source.display(), error = %e, "not updating identity file");
                    }
                }
                Ok(())
            });
    }

    pub(super) fn add_resolv_conf(&mut self) -> StrataResult<()> {
        let flags = MountFlags::NOSUID | MountFlags::NODEV;
        let source = if self.engine.dns.is_empty() {
            if !self.config.config_resolv_conf {
                return Ok(());
            }
            PathBuf::from("/etc/resolv.conf")
        } else {
            let content = resolv_conf(&self.engine.dns);
            self.mounter.session_mut().add_file("resolv.conf", content)?
        };
        recoverable(
            "resolv.conf",
            self.system
                .points
                .add_file_bind(MountTag::Files, source, "/etc/resolv.conf", flags),
        )
    }

    pub(super) fn add_hostname(&mut self) -> StrataResult<()> {
        let Some(hostname) = self.engine.hostname.clone() else {
            return Ok(());
        };
        if !self.has_namespace(NamespaceType::Uts) {
            tracing::warn!(hostname = %hostname, "hostname requires a UTS namespace, ignoring");
            return Ok(());
        }
        let file = self
            .mounter
            .session_mut()
            .add_file("hostname", format!("{hostname}\n"))?;
        recoverable(
            "hostname",
            self.system.points.add_file_bind(
                MountTag::Files,
                file,
                "/etc/hostname",
                MountFlags::NOSUID | MountFlags::NODEV,
            ),
        )?;
        self.system
            .run_after_tag(MountTag::Files, move |mounter: &mut Mounter<O>, _| {
                tracing::debug!(hostname = %hostname, "Setting hostname");
                mounter
                    .ops()
                    .set_hostname(&hostname)
                    .map_err(|e| StrataError::mount("hostname", e))
            });
        Ok(())
    }

    pub(super) fn add_actions(&mut self) -> StrataResult<()> {
        let actions = self.paths.actions_dir();
        if !actions.is_dir() {
            tracing::debug!(dir = %actions.display(), "No host action scripts to bind");
            return Ok(());
        }
        recoverable(
            "actions",
            self.system.points.add_bind(
                MountTag::Final,
                actions,
                ACTIONS_DIR,
                MountFlags::NOSUID | MountFlags::NODEV | MountFlags::RDONLY,
            ),
        )
    }
}
