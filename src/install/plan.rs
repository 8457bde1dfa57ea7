//! Stock install plan for the ML service base image.

use super::{InstallPlan, InstallStep, StepAction, StepCondition, VENV_PYTHON};
use crate::config::BuildConfig;

pub const STEP_SYSTEM_PACKAGES: &str = "system-packages";
pub const STEP_GPU_TOOLKIT: &str = "gpu-toolkit";
pub const STEP_VIRTUALENV: &str = "virtualenv";
pub const STEP_INSTALLER_UPGRADE: &str = "installer-upgrade";
pub const STEP_TENSOR_LIBRARY: &str = "tensor-library";
pub const STEP_REQUIREMENTS: &str = "requirements";

/// Build the default plan from configuration.
///
/// Python steps run through the image virtualenv created right after the
/// system packages, never through the interpreter that created it.
///
/// ML libraries are each installed as their own step, named after the
/// distribution (`transformers>=4.35.0` becomes `transformers`), chained
/// behind the tensor library in configured order.
pub fn default_plan(config: &BuildConfig) -> InstallPlan {
    let packages = &config.packages;
    let mut steps = vec![
        InstallStep::new(STEP_SYSTEM_PACKAGES, StepAction::Apt(packages.system.clone())),
        InstallStep::new(STEP_GPU_TOOLKIT, StepAction::Apt(packages.gpu_toolkit.clone()))
            .after(STEP_SYSTEM_PACKAGES)
            .when(StepCondition::GpuOnly),
        InstallStep::new(
            STEP_VIRTUALENV,
            StepAction::Virtualenv {
                interpreter: config.image.python.clone(),
            },
        )
        .after(STEP_SYSTEM_PACKAGES),
        InstallStep::new(
            STEP_INSTALLER_UPGRADE,
            StepAction::InstallerUpgrade(packages.installer.clone()),
        )
        .after(STEP_VIRTUALENV),
        InstallStep::new(
            STEP_TENSOR_LIBRARY,
            StepAction::PipIndexed {
                packages: vec![packages.tensor.package.clone()],
                cpu_index: packages.tensor.cpu_index.clone(),
                gpu_index: packages.tensor.gpu_index.clone(),
            },
        )
        .after(STEP_INSTALLER_UPGRADE),
    ];

    let mut previous = STEP_TENSOR_LIBRARY.to_string();
    for requirement in &packages.ml_libraries {
        let name = distribution_name(requirement);
        let mut step = InstallStep::new(name.clone(), StepAction::Pip(vec![requirement.clone()]))
            .after(STEP_TENSOR_LIBRARY);
        if previous != STEP_TENSOR_LIBRARY {
            step = step.after(previous.clone());
        }
        steps.push(step);
        previous = name;
    }

    steps.push(
        InstallStep::new(
            STEP_REQUIREMENTS,
            StepAction::PipRequirements(packages.requirements_file.clone()),
        )
        .after(previous),
    );

    InstallPlan::new(VENV_PYTHON, steps)
}

/// Distribution name of a requirement specifier.
fn distribution_name(requirement: &str) -> String {
    let end = requirement
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(requirement.len());
    requirement[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_order() {
        let plan = default_plan(&BuildConfig::default());
        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "system-packages",
                "gpu-toolkit",
                "virtualenv",
                "installer-upgrade",
                "tensor-library",
                "transformers",
                "sentence-transformers",
                "graphiti-core",
                "requirements",
            ]
        );
        plan.validate().unwrap();
    }

    #[test]
    fn test_python_steps_use_virtualenv_interpreter() {
        let mut config = BuildConfig::default();
        config.image.python = "/usr/bin/python3".into();
        let plan = default_plan(&config);
        let profile = crate::profile::resolve(&crate::profile::BuildFlags::new(None, None));

        let commands: Vec<String> = plan
            .resolve(&profile)
            .into_iter()
            .filter_map(|step| step.command)
            .collect();
        assert!(commands.iter().any(|c| c == r#"/usr/bin/python3 -m venv "$VIRTUAL_ENV""#));
        for command in commands.iter().filter(|c| c.contains("pip install")) {
            assert!(command.starts_with(r#""$VIRTUAL_ENV/bin/python" -m pip"#), "{command}");
        }
    }

    #[test]
    fn test_ml_steps_chain_behind_tensor_library() {
        let plan = default_plan(&BuildConfig::default());
        let graphiti = plan
            .steps
            .iter()
            .find(|s| s.name == "graphiti-core")
            .unwrap();
        assert_eq!(
            graphiti.depends_on,
            vec!["tensor-library".to_string(), "sentence-transformers".to_string()]
        );
    }

    #[test]
    fn test_distribution_name_strips_specifier() {
        assert_eq!(distribution_name("graphiti-core>=0.17.0"), "graphiti-core");
        assert_eq!(distribution_name("torch"), "torch");
        assert_eq!(distribution_name("uvicorn[standard]==0.24"), "uvicorn");
    }
}
