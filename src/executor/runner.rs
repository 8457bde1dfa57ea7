//! Command runners.
//!
//! Every shell action (install steps, verification checks, `Op::Run`) goes
//! through a [`CommandRunner`], so the orchestrator can execute for real,
//! inside a chroot, or only record what it would have done.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use crate::component::Identity;
use crate::executor::files::staged_path;

/// Image variable naming the Python virtualenv the image installs into.
pub const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";

/// Image variables holding image paths, remapped under the staging root in
/// host mode.
const HOST_MAPPED_VARS: &[&str] = &[VIRTUAL_ENV_VAR, "PYTHONPATH"];

/// A single command to execute inside an image under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    /// Staging root of the image.
    pub root: PathBuf,
    /// Image working directory (absolute image path).
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
            ..Self::default()
        }
    }

    /// One-line failure summary for error reports.
    pub fn failure_summary(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            let last = stderr.lines().last().unwrap_or(stderr);
            format!("{status}: {last}")
        }
    }
}

pub trait CommandRunner {
    /// Run one command. `Err` means the command could not be started at all;
    /// a command that ran and failed returns `Ok` with `success == false`.
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Whether commands run inside the image root, so OS package installs
    /// land in the image rather than on the builder.
    fn installs_into_root(&self) -> bool;
}

/// How [`ShellRunner`] places commands relative to the staging root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellMode {
    /// Run on the host with the working directory mapped under the staging
    /// root. Suits virtualenv-style builds.
    Host,
    /// Run inside `chroot <root>`. The staging root must be a full OS tree
    /// (see `image.seed_rootfs`) and the builder must be root.
    Chroot,
}

#[derive(Debug, Clone)]
pub struct ShellRunner {
    mode: ShellMode,
}

impl ShellRunner {
    pub fn new(mode: ShellMode) -> Self {
        Self { mode }
    }

    fn command_for(&self, invocation: &Invocation) -> Result<Command> {
        let mut cmd = match self.mode {
            ShellMode::Host => {
                let cwd = staged_path(&invocation.root, &invocation.workdir)?;
                let mut cmd = match &invocation.identity {
                    Identity::User(name) if crate::executor::users::running_as_root() => {
                        let mut cmd = Command::new("runuser");
                        cmd.args(["-u", name.as_str(), "--", "sh", "-c", invocation.command.as_str()]);
                        cmd
                    }
                    _ => {
                        let mut cmd = Command::new("sh");
                        cmd.args(["-c", invocation.command.as_str()]);
                        cmd
                    }
                };
                cmd.current_dir(cwd).envs(host_env(&invocation.root, &invocation.env)?);
                cmd
            }
            ShellMode::Chroot => {
                let script = format!(
                    "cd {} && {}",
                    shell_quote(&invocation.workdir),
                    invocation.command
                );
                let mut cmd = Command::new("chroot");
                if let Identity::User(name) = &invocation.identity {
                    cmd.arg(format!("--userspec={name}:{name}"));
                }
                cmd.arg(&invocation.root)
                    .args(["/bin/sh", "-c", script.as_str()])
                    .envs(&invocation.env);
                cmd
            }
        };
        Ok(cmd)
    }
}

/// Environment for running image commands on the host.
///
/// `VIRTUAL_ENV` and `PYTHONPATH` image paths are moved under `root` and the image
/// virtualenv's `bin` goes first on the builder's `PATH`, so `python -m pip`
/// installs into the staged tree and never into the builder's interpreter.
pub fn host_env(root: &Path, image_env: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut env = image_env.clone();
    for var in HOST_MAPPED_VARS {
        if let Some(value) = image_env.get(*var) {
            env.insert(var.to_string(), map_image_paths(root, value)?);
        }
    }

    let host_path = std::env::var("PATH").unwrap_or_default();
    let path = match env.get(VIRTUAL_ENV_VAR) {
        Some(venv) => format!("{venv}/bin:{host_path}"),
        None => host_path,
    };
    env.insert("PATH".to_string(), path);
    Ok(env)
}

fn map_image_paths(root: &Path, value: &str) -> Result<String> {
    let mapped = value
        .split(':')
        .map(|entry| {
            if entry.starts_with('/') {
                staged_path(root, entry).map(|p| p.display().to_string())
            } else {
                Ok(entry.to_string())
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(mapped.join(":"))
}

impl CommandRunner for ShellRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut cmd = self.command_for(invocation)?;
        debug!(command = %invocation.command, identity = %invocation.identity, "running");
        let output = cmd
            .output()
            .with_context(|| format!("starting command '{}'", invocation.command))?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn installs_into_root(&self) -> bool {
        self.mode == ShellMode::Chroot
    }
}

/// Records invocations without executing them.
///
/// Used for `--dry-run` and in tests, where failures can be injected for any
/// command containing a given substring.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    invocations: Vec<Invocation>,
    failures: Vec<(String, String)>,
    host: bool,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make any command containing `needle` fail with `stderr`.
    pub fn fail_on(mut self, needle: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.failures.push((needle.into(), stderr.into()));
        self
    }

    /// Behave like a host-mode runner: OS package installs are refused.
    pub fn host(mut self) -> Self {
        self.host = true;
        self
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    pub fn commands(&self) -> Vec<&str> {
        self.invocations.iter().map(|i| i.command.as_str()).collect()
    }

    /// Position of the first recorded command containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.invocations
            .iter()
            .position(|i| i.command.contains(needle))
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput> {
        self.invocations.push(invocation.clone());
        if let Some((_, stderr)) = self
            .failures
            .iter()
            .find(|(needle, _)| invocation.command.contains(needle.as_str()))
        {
            return Ok(CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }
        Ok(CommandOutput::ok())
    }

    fn installs_into_root(&self) -> bool {
        !self.host
    }
}

/// Quote a value for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+@,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn invocation(root: PathBuf, command: &str) -> Invocation {
        Invocation {
            command: command.to_string(),
            root,
            workdir: "/app".to_string(),
            env: BTreeMap::from([("MARKER".to_string(), "42".to_string())]),
            identity: Identity::Root,
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("torch>=2.1.0"), "'torch>=2.1.0'");
        assert_eq!(shell_quote("fastapi"), "fastapi");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_recording_runner_injects_failures() {
        let mut runner = RecordingRunner::new().fail_on("graphiti", "resolution failed");

        let ok = runner
            .run(&invocation(PathBuf::from("/tmp"), "pip install transformers"))
            .unwrap();
        let failed = runner
            .run(&invocation(PathBuf::from("/tmp"), "pip install graphiti-core"))
            .unwrap();

        assert!(ok.success);
        assert!(!failed.success);
        assert_eq!(failed.failure_summary(), "exit status 1: resolution failed");
        assert_eq!(runner.position("graphiti"), Some(1));
        assert_eq!(runner.invocations().len(), 2);
    }

    #[test]
    fn test_host_shell_runner_uses_staged_workdir_and_env() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("app")).unwrap();
        let mut runner = ShellRunner::new(ShellMode::Host);

        let output = runner
            .run(&invocation(
                temp.path().to_path_buf(),
                "pwd; echo $MARKER; exit 3",
            ))
            .unwrap();

        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert!(output.stdout.contains("app"));
        assert!(output.stdout.contains("42"));
    }

    #[test]
    fn test_host_env_maps_virtualenv_under_root() {
        let root = PathBuf::from("/tmp/stage/rootfs");
        let mut inv = invocation(root, "python -m pip --version");
        inv.env.insert(VIRTUAL_ENV_VAR.to_string(), "/opt/venv".to_string());
        inv.env.insert("PYTHONPATH".to_string(), "/app".to_string());
        inv.env.insert("PATH".to_string(), "/opt/venv/bin:/usr/bin".to_string());

        let env = host_env(&inv.root, &inv.env).unwrap();

        assert_eq!(env[VIRTUAL_ENV_VAR], "/tmp/stage/rootfs/opt/venv");
        assert_eq!(env["PYTHONPATH"], "/tmp/stage/rootfs/app");
        assert!(env["PATH"].starts_with("/tmp/stage/rootfs/opt/venv/bin:"));
        assert_eq!(env["MARKER"], "42");
    }

    #[test]
    fn test_only_chroot_installs_into_root() {
        assert!(ShellRunner::new(ShellMode::Chroot).installs_into_root());
        assert!(!ShellRunner::new(ShellMode::Host).installs_into_root());
        assert!(RecordingRunner::new().installs_into_root());
        assert!(!RecordingRunner::new().host().installs_into_root());
    }
}
