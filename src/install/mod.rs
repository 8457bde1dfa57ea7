//! Dependency installer.
//!
//! Installs run as an explicit, totally ordered list of [`InstallStep`]s with
//! declared preconditions. The order is load-bearing: the tensor library must
//! be installed from the index matching the profile's hardware before any ML
//! library that looks for it at install time, and the bulk manifest goes
//! last once the fragile packages are known good. [`InstallPlan::validate`]
//! rejects any plan whose declared dependencies are not satisfied by
//! declaration order, so the sequence cannot be reordered or batched
//! silently.

mod plan;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{BuildError, BuildResult};
use crate::executor::{shell_quote, CommandRunner, Staging, VIRTUAL_ENV_VAR};
use crate::profile::{BuildProfile, GPU_ENABLED_LITERAL};

pub use plan::{
    default_plan, STEP_GPU_TOOLKIT, STEP_INSTALLER_UPGRADE, STEP_REQUIREMENTS,
    STEP_SYSTEM_PACKAGES, STEP_TENSOR_LIBRARY, STEP_VIRTUALENV,
};

/// Interpreter inside the image virtualenv. Every Python package install and
/// check goes through it so packages land under the image root.
pub const VENV_PYTHON: &str = "\"$VIRTUAL_ENV/bin/python\"";

/// Predicate over the build profile gating a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    Always,
    GpuOnly,
}

impl StepCondition {
    pub fn holds(&self, profile: &BuildProfile) -> bool {
        match self {
            StepCondition::Always => true,
            StepCondition::GpuOnly => profile.gpu_enabled(),
        }
    }

    /// Shell test equivalent to [`StepCondition::holds`] over the build
    /// arguments, or `None` when unconditional.
    fn shell_test(&self) -> Option<String> {
        match self {
            StepCondition::Always => None,
            StepCondition::GpuOnly => Some(format!(r#"[ "$ENABLE_GPU" = "{GPU_ENABLED_LITERAL}" ]"#)),
        }
    }
}

/// What a step installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// System packages through apt.
    Apt(Vec<String>),
    /// Upgrade the Python installer tooling itself.
    InstallerUpgrade(Vec<String>),
    /// Python packages from the default index.
    Pip(Vec<String>),
    /// Python packages from a hardware-specific index.
    PipIndexed {
        packages: Vec<String>,
        cpu_index: String,
        gpu_index: String,
    },
    /// A requirements manifest, relative to the working directory.
    PipRequirements(String),
    /// Create the image virtualenv at `$VIRTUAL_ENV` with `interpreter`.
    Virtualenv { interpreter: String },
}

impl StepAction {
    /// Command for a resolved profile.
    pub fn command(&self, python: &str, profile: &BuildProfile) -> String {
        match self {
            StepAction::PipIndexed {
                packages,
                cpu_index,
                gpu_index,
            } => {
                let index = if profile.gpu_enabled() {
                    gpu_index
                } else {
                    cpu_index
                };
                pip_indexed(python, packages, index)
            }
            other => other.static_command(python),
        }
    }

    /// Command deciding the hardware branch at build time from
    /// `$ENABLE_GPU`, for rendered Containerfiles.
    pub fn gated_command(&self, python: &str) -> String {
        match self {
            StepAction::PipIndexed {
                packages,
                cpu_index,
                gpu_index,
            } => format!(
                r#"if [ "$ENABLE_GPU" = "{}" ]; then {}; else {}; fi"#,
                GPU_ENABLED_LITERAL,
                pip_indexed(python, packages, gpu_index),
                pip_indexed(python, packages, cpu_index)
            ),
            other => other.static_command(python),
        }
    }

    fn static_command(&self, python: &str) -> String {
        match self {
            StepAction::Apt(packages) => apt_command(packages),
            StepAction::InstallerUpgrade(packages) => {
                format!("{python} -m pip install --upgrade {}", quoted(packages))
            }
            StepAction::Pip(packages) => format!("{python} -m pip install {}", quoted(packages)),
            StepAction::PipRequirements(path) => {
                format!("{python} -m pip install -r {}", shell_quote(path))
            }
            StepAction::Virtualenv { interpreter } => {
                format!(r#"{} -m venv "${VIRTUAL_ENV_VAR}""#, shell_quote(interpreter))
            }
            StepAction::PipIndexed {
                packages, cpu_index, ..
            } => pip_indexed(python, packages, cpu_index),
        }
    }

    /// True when the action has no packages to install.
    pub fn is_empty(&self) -> bool {
        match self {
            StepAction::Apt(packages)
            | StepAction::InstallerUpgrade(packages)
            | StepAction::Pip(packages)
            | StepAction::PipIndexed { packages, .. } => packages.is_empty(),
            StepAction::PipRequirements(_) | StepAction::Virtualenv { .. } => false,
        }
    }

    /// OS package installs only reach the image when commands run inside
    /// its root.
    pub fn needs_image_root(&self) -> bool {
        matches!(self, StepAction::Apt(_))
    }
}

/// apt install of `packages` with the package lists dropped afterwards.
pub fn apt_command(packages: &[String]) -> String {
    format!(
        "apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
        quoted(packages)
    )
}

fn pip_indexed(python: &str, packages: &[String], index: &str) -> String {
    format!(
        "{python} -m pip install {} --index-url {}",
        quoted(packages),
        shell_quote(index)
    )
}

fn quoted(packages: &[String]) -> String {
    packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallStep {
    pub name: String,
    pub action: StepAction,
    /// Names of steps that must come earlier in the plan.
    pub depends_on: Vec<String>,
    pub condition: StepCondition,
}

impl InstallStep {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
            depends_on: Vec::new(),
            condition: StepCondition::Always,
        }
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn when(mut self, condition: StepCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Whether the step does any work for `profile`.
    pub fn applies_to(&self, profile: &BuildProfile) -> bool {
        self.condition.holds(profile) && !self.action.is_empty()
    }

    /// Profile-independent shell line for rendered Containerfiles.
    pub fn containerfile_command(&self, python: &str) -> String {
        let command = self.action.gated_command(python);
        match self.condition.shell_test() {
            Some(test) => format!("if {test}; then {command}; fi"),
            None => command,
        }
    }
}

/// Ordered install plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPlan {
    pub python: String,
    pub steps: Vec<InstallStep>,
}

/// A step as it would run for one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    /// `None` when the step's condition is false or it has nothing to
    /// install.
    pub command: Option<String>,
}

impl InstallPlan {
    pub fn new(python: impl Into<String>, steps: Vec<InstallStep>) -> Self {
        Self {
            python: python.into(),
            steps,
        }
    }

    /// Check names are unique and every dependency is declared earlier.
    pub fn validate(&self) -> BuildResult<()> {
        if self.steps.is_empty() {
            return Err(BuildError::InvalidPlan {
                reason: "plan has no steps".to_string(),
            });
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    let reason = if self.steps.iter().any(|s| &s.name == dep) {
                        format!(
                            "step '{}' depends on '{}', which is declared after it",
                            step.name, dep
                        )
                    } else {
                        format!("step '{}' depends on unknown step '{}'", step.name, dep)
                    };
                    return Err(BuildError::InvalidPlan { reason });
                }
            }
            if !seen.insert(step.name.as_str()) {
                return Err(BuildError::InvalidPlan {
                    reason: format!("duplicate step name '{}'", step.name),
                });
            }
        }
        Ok(())
    }

    /// Resolve every step against a profile without running anything.
    pub fn resolve(&self, profile: &BuildProfile) -> Vec<PlannedStep> {
        self.steps
            .iter()
            .map(|step| PlannedStep {
                name: step.name.clone(),
                command: step
                    .applies_to(profile)
                    .then(|| step.action.command(&self.python, profile)),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Executed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Executed => write!(f, "executed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-step outcome, in plan order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub steps: Vec<(String, StepStatus)>,
}

impl InstallReport {
    pub fn executed(&self) -> Vec<&str> {
        self.with_status(StepStatus::Executed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.with_status(StepStatus::Skipped)
    }

    fn with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, s)| *s == status)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Run the plan in order. The first failing step aborts the install.
///
/// A dependency on a skipped step counts as satisfied: skipping only removes
/// the step's effect, never its place in the order.
///
/// OS package steps are refused unless the runner executes inside the image
/// root; on the host they would modify the build machine instead.
#[instrument(skip_all, fields(profile = %profile))]
pub fn install(
    plan: &InstallPlan,
    profile: &BuildProfile,
    staging: &mut Staging,
    runner: &mut dyn CommandRunner,
) -> BuildResult<InstallReport> {
    plan.validate()?;

    let mut report = InstallReport::default();
    let mut done: HashSet<&str> = HashSet::new();

    for step in &plan.steps {
        if let Some(missing) = step.depends_on.iter().find(|d| !done.contains(d.as_str())) {
            return Err(BuildError::InvalidPlan {
                reason: format!(
                    "step '{}' reached before its dependency '{}'",
                    step.name, missing
                ),
            });
        }

        if !step.applies_to(profile) {
            info!(step = %step.name, "skipping install step");
            report.steps.push((step.name.clone(), StepStatus::Skipped));
            done.insert(step.name.as_str());
            continue;
        }

        if step.action.needs_image_root() && !runner.installs_into_root() {
            return Err(BuildError::Install {
                step: step.name.clone(),
                detail: "system packages can only be installed inside the image root; \
                         build with --chroot or clear packages.system"
                    .to_string(),
            });
        }

        let command = step.action.command(&plan.python, profile);
        info!(step = %step.name, "installing");
        let output = staging
            .run(runner, &command)
            .map_err(|err| BuildError::Install {
                step: step.name.clone(),
                detail: format!("{err:#}"),
            })?;
        if !output.success {
            warn!(step = %step.name, "install step failed");
            return Err(BuildError::Install {
                step: step.name.clone(),
                detail: output.failure_summary(),
            });
        }

        report.steps.push((step.name.clone(), StepStatus::Executed));
        done.insert(step.name.as_str());
    }

    Ok(report)
}
