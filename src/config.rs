//! Build configuration.
//!
//! Every field has a default, so an empty (or missing) config file yields the
//! stock ML service recipe. Lookup order is an explicit path, then
//! `./image-builder.toml`, then `<config_dir>/image-builder/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::runtime::HealthCheck;

pub const CONFIG_FILENAME: &str = "image-builder.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub image: ImageConfig,
    pub packages: PackagesConfig,
    pub development: DevelopmentConfig,
    pub production: ProductionConfig,
    pub runtime: RuntimeConfig,
    pub health: HealthCheck,
    pub verify: VerifyConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    /// Base image reference used by the rendered Containerfile.
    pub base_image: String,
    /// Absolute application root inside the image.
    pub app_root: String,
    /// Directory copied into the application root.
    pub source_dir: PathBuf,
    /// File names skipped when copying `source_dir`.
    pub exclude: Vec<String>,
    /// OS tree the base stage starts from. Required for chroot builds.
    pub seed_rootfs: Option<PathBuf>,
    pub app_user: String,
    pub app_uid: u32,
    pub app_gid: u32,
    /// Interpreter that creates the image virtualenv.
    pub python: String,
    /// Absolute virtualenv path inside the image. Python packages, checks and
    /// the launched service all use its interpreter.
    pub venv: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_image: "python:3.11-slim".to_string(),
            app_root: "/app".to_string(),
            source_dir: PathBuf::from("."),
            exclude: strings(&[
                ".git",
                ".artifacts",
                "target",
                "__pycache__",
                ".venv",
                "venv",
                "node_modules",
            ]),
            seed_rootfs: None,
            app_user: "appuser".to_string(),
            app_uid: 1000,
            app_gid: 1000,
            python: "python".to_string(),
            venv: "/opt/venv".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackagesConfig {
    pub system: Vec<String>,
    pub gpu_toolkit: Vec<String>,
    /// Installer self-upgrade set.
    pub installer: Vec<String>,
    pub tensor: TensorConfig,
    /// Order-sensitive ML libraries, installed in this exact order.
    pub ml_libraries: Vec<String>,
    /// Remaining dependency manifest, relative to the application root.
    pub requirements_file: String,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            system: strings(&[
                "build-essential",
                "git",
                "ca-certificates",
                "libpq-dev",
                "curl",
                "pkg-config",
            ]),
            gpu_toolkit: strings(&["nvidia-cuda-toolkit"]),
            installer: strings(&["pip", "setuptools", "wheel"]),
            tensor: TensorConfig::default(),
            ml_libraries: strings(&[
                "transformers>=4.35.0",
                "sentence-transformers>=2.2.2",
                "graphiti-core>=0.17.0",
            ]),
            requirements_file: "requirements.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TensorConfig {
    pub package: String,
    pub cpu_index: String,
    pub gpu_index: String,
}

impl Default for TensorConfig {
    fn default() -> Self {
        Self {
            package: "torch>=2.1.0".to_string(),
            cpu_index: "https://download.pytorch.org/whl/cpu".to_string(),
            gpu_index: "https://download.pytorch.org/whl/cu121".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevelopmentConfig {
    pub system_tools: Vec<String>,
    pub python_tools: Vec<String>,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            system_tools: strings(&["vim", "less", "procps", "htop"]),
            python_tools: strings(&[
                "pytest",
                "pytest-asyncio",
                "black",
                "isort",
                "flake8",
                "mypy",
                "ipython",
                "debugpy",
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProductionConfig {
    pub process_manager: String,
    pub workers: u32,
    pub timeout_seconds: u32,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            process_manager: "gunicorn>=21.2.0".to_string(),
            workers: 4,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Application object as `module:attribute`.
    pub entry_point: String,
    pub port: u16,
    /// Writable directories, relative to the application root.
    pub runtime_dirs: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            entry_point: "main:app".to_string(),
            port: 8000,
            runtime_dirs: strings(&[
                "data/repositories",
                "data/embeddings",
                "data/analysis",
                "logs",
                "tmp",
            ]),
        }
    }
}

impl RuntimeConfig {
    /// Split `module:attribute`. Validated by [`BuildConfig::validate`].
    pub fn entry_parts(&self) -> (&str, &str) {
        self.entry_point
            .split_once(':')
            .unwrap_or((self.entry_point.as_str(), "app"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    /// Import names loaded by the library check.
    pub libraries: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            libraries: strings(&["torch", "transformers", "graphiti_core", "fastapi"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub keep_runs: usize,
    /// Pack each stage rootfs into `rootfs.tar.zst`.
    pub export: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".artifacts/out"),
            keep_runs: 3,
            export: false,
        }
    }
}

impl BuildConfig {
    /// Parse a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        let config: BuildConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing build config '{}'", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating build config '{}'", path.display()))?;
        Ok(config)
    }

    /// Load the first config found in lookup order, or defaults.
    ///
    /// Returns the path the config was read from, if any.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        let mut candidates = vec![cwd.join(CONFIG_FILENAME)];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("image-builder").join("config.toml"));
        }

        for candidate in candidates {
            if candidate.is_file() {
                return Ok((Self::from_file(&candidate)?, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.image.app_root.starts_with('/') {
            bail!(
                "image.app_root must be absolute, got '{}'",
                self.image.app_root
            );
        }
        if !self.image.venv.starts_with('/') || self.image.venv.split('/').any(|p| p == "..") {
            bail!(
                "image.venv must be an absolute path without '..', got '{}'",
                self.image.venv
            );
        }
        if self.image.app_user.is_empty() || self.image.app_user == "root" {
            bail!("image.app_user must name a non-root user");
        }
        if self.image.app_uid == 0 {
            bail!("image.app_uid must not be 0");
        }
        match self.runtime.entry_point.split_once(':') {
            Some((module, attr)) if !module.is_empty() && !attr.is_empty() => {}
            _ => bail!(
                "runtime.entry_point must look like 'module:attribute', got '{}'",
                self.runtime.entry_point
            ),
        }
        if self.runtime.port == 0 {
            bail!("runtime.port must be non-zero");
        }
        if self.production.workers == 0 {
            bail!("production.workers must be at least 1");
        }
        if self.production.timeout_seconds == 0 {
            bail!("production.timeout_seconds must be at least 1");
        }
        if self.verify.libraries.is_empty() {
            bail!("verify.libraries must not be empty");
        }
        if self.health.interval_seconds == 0 {
            bail!("health.interval_seconds must be at least 1");
        }
        if self.health.retries == 0 {
            bail!("health.retries must be at least 1");
        }
        for dir in &self.runtime.runtime_dirs {
            if dir.starts_with('/') || dir.split('/').any(|part| part == "..") {
                bail!("runtime.runtime_dirs entry '{dir}' must be relative to the app root");
            }
        }
        Ok(())
    }

    /// Application root without its leading slash, for joining onto a staging
    /// root.
    pub fn app_root_relative(&self) -> &str {
        self.image.app_root.trim_start_matches('/')
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
