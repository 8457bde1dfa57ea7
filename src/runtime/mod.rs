//! Runtime launcher: one foreground process per derived stage.
//!
//! A [`RuntimeSpec`] is the runtime contract of an image (process argv,
//! exposed port, health check). A [`Launcher`] turns it into a running
//! process exactly once. It does not supervise, restart or retry; keeping
//! the process alive is the container runtime's job.

pub mod health;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::stages::StageName;

pub use health::{http_check, CheckOutcome, HealthState, HealthTracker};

/// Bind address for both runtimes.
pub const BIND_HOST: &str = "0.0.0.0";

/// Container health-check contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheck {
    /// HTTP path requested with `GET`.
    pub path: String,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    /// Grace period after start during which failures are not counted.
    pub start_period_seconds: u64,
    /// Consecutive counted failures before the container is unhealthy.
    pub retries: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/api/v1/health".to_string(),
            interval_seconds: 30,
            timeout_seconds: 30,
            start_period_seconds: 30,
            retries: 3,
        }
    }
}

impl HealthCheck {
    pub fn url(&self, port: u16) -> String {
        format!("http://localhost:{port}{}", self.path)
    }

    /// CheckOutcome command as run inside the container.
    pub fn check_command(&self, port: u16) -> String {
        format!("curl -f {} || exit 1", self.url(port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Foreground process argv.
    pub process_command: Vec<String>,
    pub exposed_port: u16,
    pub health_check: HealthCheck,
}

impl RuntimeSpec {
    /// Auto-reloading single-process server.
    pub fn development(config: &BuildConfig) -> Self {
        let port = config.runtime.port;
        Self {
            process_command: argv(&[
                "uvicorn",
                &config.runtime.entry_point,
                "--host",
                BIND_HOST,
                "--port",
                &port.to_string(),
                "--reload",
            ]),
            exposed_port: port,
            health_check: config.health.clone(),
        }
    }

    /// Multi-worker process manager with the async worker class.
    pub fn production(config: &BuildConfig) -> Self {
        let port = config.runtime.port;
        let prod = &config.production;
        Self {
            process_command: argv(&[
                "gunicorn",
                &config.runtime.entry_point,
                "--workers",
                &prod.workers.to_string(),
                "--worker-class",
                "uvicorn.workers.UvicornWorker",
                "--bind",
                &format!("{BIND_HOST}:{port}"),
                "--timeout",
                &prod.timeout_seconds.to_string(),
            ]),
            exposed_port: port,
            health_check: config.health.clone(),
        }
    }

    pub fn command_line(&self) -> String {
        self.process_command.join(" ")
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Idle,
    Running,
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchState::Idle => write!(f, "idle"),
            LaunchState::Running => write!(f, "running"),
        }
    }
}

/// Where the process is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget {
    /// Directly on the host, in `workdir`. With an `interpreter`, the
    /// program runs as `interpreter -m <program>` so the staged virtualenv's
    /// scripts need no working shebang.
    Host {
        workdir: PathBuf,
        interpreter: Option<PathBuf>,
    },
    /// Inside `chroot <root>` as `user`, in image path `workdir`.
    Chroot {
        root: PathBuf,
        workdir: String,
        user: String,
    },
}

/// Starts a stage's foreground process. `Idle -> Running`, once.
#[derive(Debug)]
pub struct Launcher {
    stage: StageName,
    spec: RuntimeSpec,
    target: LaunchTarget,
    env: BTreeMap<String, String>,
    state: LaunchState,
}

impl Launcher {
    pub fn new(stage: StageName, spec: RuntimeSpec, target: LaunchTarget) -> Self {
        Self {
            stage,
            spec,
            target,
            env: BTreeMap::new(),
            state: LaunchState::Idle,
        }
    }

    /// Environment recorded in the image, applied on top of the caller's.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    fn command(&self) -> BuildResult<Command> {
        let (program, args) =
            self.spec
                .process_command
                .split_first()
                .ok_or_else(|| BuildError::RuntimeLaunch {
                    stage: self.stage,
                    detail: "runtime command is empty".to_string(),
                })?;

        let mut cmd = match &self.target {
            LaunchTarget::Host {
                workdir,
                interpreter,
            } => {
                let mut cmd = match interpreter {
                    Some(python) => {
                        let mut cmd = Command::new(python);
                        cmd.arg("-m").arg(program);
                        cmd
                    }
                    None => Command::new(program),
                };
                cmd.args(args).current_dir(workdir);
                cmd
            }
            LaunchTarget::Chroot {
                root,
                workdir,
                user,
            } => {
                let mut cmd = Command::new("chroot");
                cmd.arg(format!("--userspec={user}:{user}"))
                    .arg(root)
                    .args(["/bin/sh", "-c"])
                    .arg(format!(
                        "cd {} && exec \"$@\"",
                        crate::executor::shell_quote(workdir)
                    ))
                    .arg("sh")
                    .arg(program)
                    .args(args);
                cmd
            }
        };
        cmd.envs(&self.env);
        Ok(cmd)
    }

    /// Spawn the foreground process. A second call fails.
    pub fn launch(&mut self) -> BuildResult<ForegroundProcess> {
        if self.state == LaunchState::Running {
            return Err(BuildError::RuntimeLaunch {
                stage: self.stage,
                detail: "runtime already launched".to_string(),
            });
        }

        let mut cmd = self.command()?;
        let child = cmd.spawn().map_err(|err| BuildError::RuntimeLaunch {
            stage: self.stage,
            detail: format!("spawning '{}': {err}", self.spec.command_line()),
        })?;

        info!(
            stage = %self.stage,
            pid = child.id(),
            port = self.spec.exposed_port,
            command = %self.spec.command_line(),
            "runtime launched"
        );
        self.state = LaunchState::Running;
        Ok(ForegroundProcess {
            stage: self.stage,
            child,
        })
    }
}

/// The single foreground process of a running stage.
#[derive(Debug)]
pub struct ForegroundProcess {
    stage: StageName,
    child: Child,
}

impl ForegroundProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn wait(mut self) -> BuildResult<ExitStatus> {
        self.child.wait().map_err(|err| BuildError::RuntimeLaunch {
            stage: self.stage,
            detail: format!("waiting for process {}: {err}", self.child.id()),
        })
    }

    /// Exit status if the process has already exited.
    pub fn try_wait(&mut self) -> BuildResult<Option<ExitStatus>> {
        self.child.try_wait().map_err(|err| BuildError::RuntimeLaunch {
            stage: self.stage,
            detail: format!("polling process {}: {err}", self.child.id()),
        })
    }

    pub fn kill(&mut self) -> BuildResult<()> {
        self.child.kill().map_err(|err| BuildError::RuntimeLaunch {
            stage: self.stage,
            detail: format!("stopping process {}: {err}", self.child.id()),
        })
    }
}

/// Run the health contract against a launched process until it settles.
///
/// Every `tracker.interval()` the process is polled and `check` is applied;
/// time since start is counted in whole intervals. Returns the first
/// `Healthy` or `Unhealthy` state. A process that exits first is a launch
/// failure.
pub fn wait_healthy(
    process: &mut ForegroundProcess,
    tracker: &mut HealthTracker,
    check: &mut dyn FnMut() -> CheckOutcome,
    sleep: &mut dyn FnMut(Duration),
) -> BuildResult<HealthState> {
    let mut since_start = Duration::ZERO;
    loop {
        sleep(tracker.interval());
        since_start += tracker.interval();

        if let Some(status) = process.try_wait()? {
            warn!(pid = process.pid(), %status, "process exited while starting");
            return Err(BuildError::RuntimeLaunch {
                stage: process.stage,
                detail: format!("process exited ({status}) before becoming healthy"),
            });
        }

        match tracker.record(since_start, check()) {
            HealthState::Starting => {}
            settled => {
                info!(pid = process.pid(), elapsed = ?since_start, state = %settled, "health settled");
                return Ok(settled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn spec(command: &[&str]) -> RuntimeSpec {
        RuntimeSpec {
            process_command: argv(command),
            exposed_port: 8000,
            health_check: HealthCheck::default(),
        }
    }

    #[test]
    fn test_development_command_reloads_on_port() {
        let spec = RuntimeSpec::development(&BuildConfig::default());
        assert_eq!(
            spec.command_line(),
            "uvicorn main:app --host 0.0.0.0 --port 8000 --reload"
        );
        assert_eq!(spec.exposed_port, 8000);
    }

    #[test]
    fn test_production_command_uses_worker_defaults() {
        let spec = RuntimeSpec::production(&BuildConfig::default());
        assert_eq!(
            spec.command_line(),
            "gunicorn main:app --workers 4 --worker-class uvicorn.workers.UvicornWorker \
             --bind 0.0.0.0:8000 --timeout 120"
        );
        assert_eq!(spec.health_check.path, "/api/v1/health");
    }

    #[test]
    fn test_health_check_command() {
        let check = HealthCheck::default();
        assert_eq!(
            check.check_command(8000),
            "curl -f http://localhost:8000/api/v1/health || exit 1"
        );
    }

    #[test]
    fn test_launch_runs_once() {
        let temp = TempDir::new().unwrap();
        let mut launcher = Launcher::new(
            StageName::Development,
            spec(&["sh", "-c", "exit 0"]),
            LaunchTarget::Host {
                workdir: temp.path().to_path_buf(),
                interpreter: None,
            },
        );

        let process = launcher.launch().unwrap();
        assert_eq!(launcher.state(), LaunchState::Running);
        assert!(process.wait().unwrap().success());

        let err = launcher.launch().unwrap_err();
        assert!(matches!(err, BuildError::RuntimeLaunch { stage: StageName::Development, .. }));
    }

    #[test]
    fn test_spawn_failure_keeps_launcher_idle() {
        let temp = TempDir::new().unwrap();
        let mut launcher = Launcher::new(
            StageName::Production,
            spec(&["/nonexistent/gunicorn"]),
            LaunchTarget::Host {
                workdir: temp.path().to_path_buf(),
                interpreter: None,
            },
        );

        let err = launcher.launch().unwrap_err();
        assert_eq!(err.failed_unit(), "launch:production");
        assert_eq!(launcher.state(), LaunchState::Idle);
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let mut launcher = Launcher::new(
            StageName::Production,
            spec(&[]),
            LaunchTarget::Host {
                workdir: PathBuf::from("/"),
                interpreter: None,
            },
        );
        assert!(launcher.launch().unwrap_err().to_string().contains("empty"));
    }

    fn launch_host(command: &[&str], workdir: &Path) -> ForegroundProcess {
        Launcher::new(
            StageName::Development,
            spec(command),
            LaunchTarget::Host {
                workdir: workdir.to_path_buf(),
                interpreter: None,
            },
        )
        .launch()
        .unwrap()
    }

    #[test]
    fn test_host_interpreter_runs_program_as_module() {
        let temp = TempDir::new().unwrap();
        let python = temp.path().join("python");
        fs::write(&python, "#!/bin/sh\necho \"$@\" > args.txt\n").unwrap();
        fs::set_permissions(&python, fs::Permissions::from_mode(0o755)).unwrap();
        let mut launcher = Launcher::new(
            StageName::Development,
            spec(&["uvicorn", "main:app", "--reload"]),
            LaunchTarget::Host {
                workdir: temp.path().to_path_buf(),
                interpreter: Some(python),
            },
        );

        assert!(launcher.launch().unwrap().wait().unwrap().success());
        let args = fs::read_to_string(temp.path().join("args.txt")).unwrap();
        assert_eq!(args.trim(), "-m uvicorn main:app --reload");
    }

    #[test]
    fn test_wait_healthy_reports_healthy_after_first_success() {
        let temp = TempDir::new().unwrap();
        let mut process = launch_host(&["sleep", "30"], temp.path());
        let mut tracker = HealthTracker::new(HealthCheck::default());
        let mut slept = Vec::new();

        let state = wait_healthy(
            &mut process,
            &mut tracker,
            &mut || CheckOutcome::Passed(Duration::from_millis(5)),
            &mut |interval| slept.push(interval),
        )
        .unwrap();

        assert_eq!(state, HealthState::Healthy);
        assert_eq!(slept, vec![Duration::from_secs(30)]);
        process.kill().unwrap();
    }

    #[test]
    fn test_wait_healthy_counts_retries_after_start_period() {
        let temp = TempDir::new().unwrap();
        let mut process = launch_host(&["sleep", "30"], temp.path());
        let contract = HealthCheck {
            start_period_seconds: 60,
            ..HealthCheck::default()
        };
        let mut tracker = HealthTracker::new(contract);
        let mut checks = 0;

        let state = wait_healthy(
            &mut process,
            &mut tracker,
            &mut || {
                checks += 1;
                CheckOutcome::Failed
            },
            &mut |_| {},
        )
        .unwrap();

        // 30s is inside the start period; 60s, 90s and 120s count.
        assert_eq!(state, HealthState::Unhealthy);
        assert_eq!(checks, 4);
        process.kill().unwrap();
    }

    #[test]
    fn test_wait_healthy_fails_when_process_exits() {
        let temp = TempDir::new().unwrap();
        let mut process = launch_host(&["sh", "-c", "exit 3"], temp.path());
        let contract = HealthCheck {
            start_period_seconds: u64::MAX / 2,
            ..HealthCheck::default()
        };
        let mut tracker = HealthTracker::new(contract);

        let err = wait_healthy(
            &mut process,
            &mut tracker,
            &mut || CheckOutcome::Failed,
            &mut |_| std::thread::sleep(Duration::from_millis(20)),
        )
        .unwrap_err();

        assert_eq!(err.failed_unit(), "launch:development");
        assert!(err.to_string().contains("before becoming healthy"));
    }
}
