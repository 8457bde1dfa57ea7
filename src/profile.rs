//! Profile resolution: free-form build arguments to a fixed [`BuildProfile`].
//!
//! Installer branches are a binary CPU/GPU switch, so `enable_gpu` is GPU only
//! for the exact literal `"true"`. Anything else, including `"TRUE"`, `"1"`,
//! `" true"` or absence, resolves to CPU.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Literal that enables the GPU branch.
pub const GPU_ENABLED_LITERAL: &str = "true";

/// Environment used when none (or an empty one) is given.
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// Raw build arguments as passed by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildFlags {
    pub environment: Option<String>,
    pub enable_gpu: Option<String>,
}

impl BuildFlags {
    pub fn new(environment: Option<&str>, enable_gpu: Option<&str>) -> Self {
        Self {
            environment: environment.map(str::to_string),
            enable_gpu: enable_gpu.map(str::to_string),
        }
    }
}

/// Target environment name. Unknown names are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
    Other(String),
}

impl Environment {
    fn parse(raw: &str) -> Self {
        match raw {
            "development" => Environment::Development,
            "production" => Environment::Production,
            other => Environment::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Other(name) => name,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hardware {
    Cpu,
    Gpu,
}

impl fmt::Display for Hardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hardware::Cpu => write!(f, "cpu"),
            Hardware::Gpu => write!(f, "gpu"),
        }
    }
}

/// Resolved build choices. Fields are private so a profile cannot change
/// after resolution; install steps only ever see `&BuildProfile`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildProfile {
    environment: Environment,
    hardware: Hardware,
}

impl BuildProfile {
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn hardware(&self) -> Hardware {
        self.hardware
    }

    pub fn gpu_enabled(&self) -> bool {
        self.hardware == Hardware::Gpu
    }
}

impl Default for BuildProfile {
    fn default() -> Self {
        resolve(&BuildFlags::default())
    }
}

impl fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.environment, self.hardware)
    }
}

/// Resolve build flags into a profile. Never fails.
pub fn resolve(flags: &BuildFlags) -> BuildProfile {
    let environment = match flags.environment.as_deref() {
        None | Some("") => Environment::parse(DEFAULT_ENVIRONMENT),
        Some(raw) => Environment::parse(raw),
    };
    let hardware = if flags.enable_gpu.as_deref() == Some(GPU_ENABLED_LITERAL) {
        Hardware::Gpu
    } else {
        Hardware::Cpu
    };
    BuildProfile {
        environment,
        hardware,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_production_cpu() {
        let profile = resolve(&BuildFlags::default());
        assert_eq!(profile.environment(), &Environment::Production);
        assert!(!profile.gpu_enabled());
        assert_eq!(profile, BuildProfile::default());
    }

    #[test]
    fn test_empty_environment_falls_back_to_default() {
        let profile = resolve(&BuildFlags::new(Some(""), None));
        assert_eq!(profile.environment(), &Environment::Production);
    }

    #[test]
    fn test_only_exact_true_enables_gpu() {
        assert!(resolve(&BuildFlags::new(None, Some("true"))).gpu_enabled());
        for value in ["TRUE", "True", "1", "yes", "on", " true", "true ", "", "false"] {
            let profile = resolve(&BuildFlags::new(None, Some(value)));
            assert!(!profile.gpu_enabled(), "'{value}' must not enable GPU");
        }
    }

    #[test]
    fn test_unknown_environment_is_kept_verbatim() {
        let profile = resolve(&BuildFlags::new(Some("staging"), None));
        assert_eq!(profile.environment(), &Environment::Other("staging".into()));
        assert_eq!(profile.environment().as_str(), "staging");
    }

    #[test]
    fn test_display_combines_environment_and_hardware() {
        let profile = resolve(&BuildFlags::new(Some("development"), Some("true")));
        assert_eq!(profile.to_string(), "development/gpu");
    }
}
