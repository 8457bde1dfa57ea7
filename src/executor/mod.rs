//! Op executor: interprets [`Op`] values against a staging root.
//!
//! A [`Staging`] is the image under construction: its root directory plus
//! the state a Containerfile would carry between instructions (environment,
//! working directory, current identity). Each applied action is appended to
//! `layers`, which feeds the image manifest and digest.
//!
//! # Usage
//!
//! ```rust,ignore
//! use image_builder::component::{dirs, env};
//! use image_builder::executor::{execute_op, RecordingRunner, Staging};
//!
//! let mut staging = Staging::new(root, vec![]);
//! let mut runner = RecordingRunner::new();
//! execute_op(&mut staging, &mut runner, &env("PYTHONUNBUFFERED", "1"))?;
//! execute_op(&mut staging, &mut runner, &dirs(["/app/logs"]))?;
//! ```

pub mod directories;
pub mod files;
pub mod runner;
pub mod users;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use tracing::debug;

use crate::component::{Identity, Op};
pub use runner::{
    host_env, shell_quote, CommandOutput, CommandRunner, Invocation, RecordingRunner, ShellMode,
    ShellRunner, VIRTUAL_ENV_VAR,
};
use users::OwnershipRecord;

/// Image under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staging {
    pub root: PathBuf,
    pub env: BTreeMap<String, String>,
    pub workdir: String,
    pub identity: Identity,
    pub layers: Vec<String>,
    pub ownership: Vec<OwnershipRecord>,
    /// File names skipped by `Op::CopyTree`.
    pub exclude: Vec<String>,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            root: root.into(),
            env: BTreeMap::new(),
            workdir: "/".to_string(),
            identity: Identity::Root,
            layers: Vec::new(),
            ownership: Vec::new(),
            exclude,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Invocation for `command` under the current env, workdir and identity.
    pub fn invocation(&self, command: impl Into<String>) -> Invocation {
        Invocation {
            command: command.into(),
            root: self.root.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone(),
            identity: self.identity.clone(),
        }
    }

    /// Run a command and record it as a layer whatever the outcome.
    pub fn run(
        &mut self,
        runner: &mut dyn CommandRunner,
        command: &str,
    ) -> Result<CommandOutput> {
        let output = runner.run(&self.invocation(command))?;
        self.layers.push(format!("run[{}] {}", self.identity, command));
        Ok(output)
    }
}

/// Execute a single op.
///
/// Identity ops (`User`, `Group`, `Chown`) are refused unless the staging
/// identity is privileged; a failed `Run` is an error carrying the command's
/// failure summary.
pub fn execute_op(staging: &mut Staging, runner: &mut dyn CommandRunner, op: &Op) -> Result<()> {
    if op.needs_privilege() && !staging.identity.is_privileged() {
        bail!(
            "'{}' requires elevated privileges but the stage runs as '{}'",
            op,
            staging.identity
        );
    }
    debug!(op = %op, identity = %staging.identity, "applying");

    match op {
        Op::Env(key, value) => {
            staging.env.insert(key.clone(), value.clone());
        }
        Op::Workdir(path) => {
            directories::handle_workdir(&staging.root, path)?;
            staging.workdir = path.clone();
        }
        Op::Dirs(paths) => directories::handle_dirs(&staging.root, paths)?,
        Op::CopyTree {
            source,
            destination,
        } => {
            files::handle_copytree(&staging.root, source, destination, &staging.exclude)?;
            let digest = files::digest_tree(&files::staged_path(&staging.root, destination)?)?;
            staging
                .layers
                .push(format!("copy {destination} sha256:{digest}"));
            return Ok(());
        }
        Op::Group { name, gid } => {
            users::ensure_group(&staging.root, name, *gid)?;
        }
        Op::User {
            name,
            uid,
            gid,
            home,
            shell,
        } => {
            users::ensure_user(&staging.root, name, *uid, *gid, home, shell)?;
        }
        Op::Chown { path, user, group } => {
            let record = users::handle_chown(&staging.root, path, user, group)?;
            staging.ownership.push(record);
        }
        Op::SystemPackages(packages) => {
            if !runner.installs_into_root() {
                bail!(
                    "installing system packages ({}) needs commands to run inside the image root; build with --chroot",
                    packages.join(" ")
                );
            }
            let command = crate::install::apt_command(packages);
            let output = staging.run(runner, &command)?;
            if !output.success {
                bail!("'{}' failed: {}", command, output.failure_summary());
            }
            return Ok(());
        }
        Op::Run(command) => {
            let output = staging.run(runner, command)?;
            if !output.success {
                bail!("'{}' failed: {}", command, output.failure_summary());
            }
            return Ok(());
        }
    }

    staging.layers.push(op.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{chown, dirs, env, group, run, system_packages, user, workdir};
    use std::fs;
    use tempfile::TempDir;

    fn staging() -> (TempDir, Staging) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        fs::create_dir_all(&root).unwrap();
        (temp, Staging::new(root, vec![]))
    }

    #[test]
    fn test_env_and_workdir_flow_into_invocations() {
        let (_temp, mut staging) = staging();
        let mut runner = RecordingRunner::new();

        execute_op(&mut staging, &mut runner, &env("PYTHONPATH", "/app")).unwrap();
        execute_op(&mut staging, &mut runner, &workdir("/app")).unwrap();
        execute_op(&mut staging, &mut runner, &run("pip --version")).unwrap();

        let invocation = &runner.invocations()[0];
        assert_eq!(invocation.workdir, "/app");
        assert_eq!(invocation.env.get("PYTHONPATH").map(String::as_str), Some("/app"));
        assert!(staging.root().join("app").is_dir());
        assert_eq!(staging.layers.len(), 3);
    }

    #[test]
    fn test_failed_run_is_an_error() {
        let (_temp, mut staging) = staging();
        let mut runner = RecordingRunner::new().fail_on("gunicorn", "no matching distribution");

        let err = execute_op(&mut staging, &mut runner, &run("pip install gunicorn"))
            .unwrap_err();

        assert!(err.to_string().contains("no matching distribution"));
    }

    #[test]
    fn test_identity_ops_need_privilege() {
        let (_temp, mut staging) = staging();
        let mut runner = RecordingRunner::new();
        staging.identity = Identity::User("appuser".into());

        let err = execute_op(
            &mut staging,
            &mut runner,
            &user("other", 1001, 1001, "/home/other"),
        )
        .unwrap_err();

        assert!(err.to_string().contains("requires elevated privileges"));
    }

    #[test]
    fn test_identity_setup_as_root() {
        let (_temp, mut staging) = staging();
        let mut runner = RecordingRunner::new();

        execute_op(&mut staging, &mut runner, &dirs(["/app"])).unwrap();
        execute_op(&mut staging, &mut runner, &group("appuser", 1000)).unwrap();
        execute_op(
            &mut staging,
            &mut runner,
            &user("appuser", 1000, 1000, "/home/appuser"),
        )
        .unwrap();
        execute_op(&mut staging, &mut runner, &chown("/app", "appuser", "appuser")).unwrap();

        assert_eq!(staging.ownership.len(), 1);
        assert_eq!(staging.ownership[0].uid, 1000);
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn test_system_packages_refused_outside_image_root() {
        let (_temp, mut staging) = staging();
        let mut runner = RecordingRunner::new().host();

        let err = execute_op(&mut staging, &mut runner, &system_packages(["vim", "htop"]))
            .unwrap_err();

        assert!(err.to_string().contains("--chroot"));
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn test_system_packages_run_apt_inside_image_root() {
        let (_temp, mut staging) = staging();
        let mut runner = RecordingRunner::new();

        execute_op(&mut staging, &mut runner, &system_packages(["vim"])).unwrap();

        assert!(runner.commands()[0].starts_with("apt-get update && apt-get install -y"));
        assert!(runner.commands()[0].contains(" vim "));
    }
}
