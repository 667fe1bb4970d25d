//! Container action scripts.

use std::path::{Path, PathBuf};

use strata_common::paths::ACTIONS_DIR;
use strata_common::{StrataError, StrataResult};

/// Shell used when the image has no shell action.
const DEFAULT_SHELL: &str = "/bin/sh";

/// An entry point of the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run a command.
    Exec,
    /// Interactive shell.
    Shell,
    /// The runscript.
    Run,
    /// Instance startscript.
    Start,
    /// The test script.
    Test,
}

impl Action {
    /// Action named `name`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "exec" => Some(Self::Exec),
            "shell" => Some(Self::Shell),
            "run" => Some(Self::Run),
            "start" => Some(Self::Start),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    /// Action name, also the script name under the actions directory.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Shell => "shell",
            Self::Run => "run",
            Self::Start => "start",
            Self::Test => "test",
        }
    }

    /// Scripts of older image formats.
    const fn legacy(self) -> &'static [&'static str] {
        match self {
            Self::Exec => &["/.exec"],
            Self::Shell => &["/.shell"],
            Self::Run => &["/.run", "/singularity"],
            Self::Start => &[],
            Self::Test => &["/.test"],
        }
    }

    fn candidates(self) -> impl Iterator<Item = PathBuf> {
        std::iter::once(Path::new(ACTIONS_DIR).join(self.name()))
            .chain(self.legacy().iter().map(PathBuf::from))
    }
}

/// `path` inside the container tree at `root`.
fn in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

fn find_script(root: &Path, action: Action) -> Option<PathBuf> {
    action
        .candidates()
        .find(|candidate| in_root(root, candidate).is_file())
}

fn with_args(program: &Path, args: &[String]) -> Vec<String> {
    std::iter::once(program.to_string_lossy().into_owned())
        .chain(args.iter().cloned())
        .collect()
}

fn shell(root: &Path, args: &[String]) -> Option<Vec<String>> {
    if let Some(script) = find_script(root, Action::Shell) {
        return Some(with_args(&script, args));
    }
    in_root(root, Path::new(DEFAULT_SHELL))
        .is_file()
        .then(|| with_args(Path::new(DEFAULT_SHELL), args))
}

fn missing(action: Action) -> StrataError {
    StrataError::MissingAction {
        action: action.name().to_string(),
    }
}

/// Resolve the argument vector of `action` in the container tree at `root`.
///
/// `exec` without a script runs `args` directly; `shell` falls back to
/// `/bin/sh` and `run` to the shell. Anything else without a script fails.
pub fn resolve_action(root: &Path, action: Action, args: &[String]) -> StrataResult<Vec<String>> {
    if let Some(script) = find_script(root, action) {
        tracing::debug!(action = action.name(), script = %script.display(), "Resolved action");
        return Ok(with_args(&script, args));
    }
    match action {
        Action::Exec if !args.is_empty() => Ok(args.to_vec()),
        Action::Shell => shell(root, args).ok_or_else(|| missing(action)),
        Action::Run => {
            tracing::warn!("no runscript found in container, running a shell");
            shell(root, args).ok_or_else(|| missing(action))
        }
        _ => Err(missing(action)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, path: &str) {
        let full = in_root(root, Path::new(path));
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, "#!/bin/sh\n").unwrap();
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn actions_directory_first() {
        let temp = tempfile::tempdir().unwrap();
        touch(temp.path(), "/.singularity.d/actions/run");
        touch(temp.path(), "/.run");

        let argv = resolve_action(temp.path(), Action::Run, &args(&["--flag"])).unwrap();
        assert_eq!(argv, args(&["/.singularity.d/actions/run", "--flag"]));
    }

    #[test]
    fn legacy_scripts() {
        let temp = tempfile::tempdir().unwrap();
        touch(temp.path(), "/singularity");
        assert_eq!(
            resolve_action(temp.path(), Action::Run, &[]).unwrap(),
            args(&["/singularity"])
        );
    }

    #[test]
    fn fallbacks() {
        let temp = tempfile::tempdir().unwrap();
        touch(temp.path(), "/bin/sh");

        assert_eq!(
            resolve_action(temp.path(), Action::Exec, &args(&["id", "-u"])).unwrap(),
            args(&["id", "-u"])
        );
        assert_eq!(
            resolve_action(temp.path(), Action::Run, &[]).unwrap(),
            args(&["/bin/sh"])
        );
        assert_eq!(
            resolve_action(temp.path(), Action::Shell, &[]).unwrap(),
            args(&["/bin/sh"])
        );
    }

    #[test]
    fn distinct_missing_errors() {
        let temp = tempfile::tempdir().unwrap();
        for action in [Action::Exec, Action::Shell, Action::Run, Action::Start, Action::Test] {
            let err = resolve_action(temp.path(), action, &[]).unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("no {} capability in container", action.name())
            );
        }
    }
}
