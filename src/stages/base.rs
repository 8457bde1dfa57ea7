//! The `base` stage: environment, ordered dependency install, application
//! sources and runtime directories. Runs as root throughout.

use std::fs;
use std::path::Path;

use tracing::info;

use super::StageName;
use crate::component::{copy_tree, dirs, env, workdir, Op};
use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::executor::{execute_op, files, CommandRunner, Staging, VIRTUAL_ENV_VAR};
use crate::image::ImageManifest;
use crate::install::{install, InstallPlan};
use crate::profile::BuildProfile;
use crate::verify::BuiltBase;

const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Variables every image carries. The virtualenv's `bin` leads `PATH` so the
/// service and its tools resolve to the image's own interpreter.
pub fn base_env(config: &BuildConfig, profile: &BuildProfile) -> Vec<Op> {
    let venv = config.image.venv.trim_end_matches('/');
    vec![
        env(VIRTUAL_ENV_VAR, venv),
        env("PATH", format!("{venv}/bin:{SYSTEM_PATH}")),
        env("PYTHONUNBUFFERED", "1"),
        env("PYTHONDONTWRITEBYTECODE", "1"),
        env("PIP_NO_CACHE_DIR", "1"),
        env("PYTHONPATH", config.image.app_root.clone()),
        env("ENVIRONMENT", profile.environment().as_str()),
    ]
}

/// Absolute runtime directories under the app root.
pub fn runtime_dirs(config: &BuildConfig) -> Vec<String> {
    let root = config.image.app_root.trim_end_matches('/');
    config
        .runtime
        .runtime_dirs
        .iter()
        .map(|dir| format!("{root}/{}", dir.trim_matches('/')))
        .collect()
}

/// Build the base image into `rootfs`.
///
/// The source tree is copied before installing so the requirements manifest
/// is present for the last install step.
pub fn build_base(
    config: &BuildConfig,
    profile: &BuildProfile,
    plan: &InstallPlan,
    source_dir: &Path,
    rootfs: &Path,
    runner: &mut dyn CommandRunner,
) -> BuildResult<BuiltBase> {
    plan.validate()?;
    info!(profile = %profile, rootfs = %rootfs.display(), "building base");

    match &config.image.seed_rootfs {
        Some(seed) => files::copy_snapshot(seed, rootfs)
            .map_err(|err| BuildError::io("seeding base rootfs", &err))?,
        None => {
            if rootfs.exists() {
                fs::remove_dir_all(rootfs).map_err(|err| BuildError::Io {
                    context: format!("clearing '{}'", rootfs.display()),
                    detail: err.to_string(),
                })?;
            }
            fs::create_dir_all(rootfs).map_err(|err| BuildError::Io {
                context: format!("creating '{}'", rootfs.display()),
                detail: err.to_string(),
            })?;
        }
    }

    let mut staging = Staging::new(rootfs, config.image.exclude.clone());
    let mut prepare = base_env(config, profile);
    prepare.push(workdir(config.image.app_root.clone()));
    prepare.push(copy_tree(source_dir, config.image.app_root.clone()));
    for op in &prepare {
        execute_op(&mut staging, runner, op)
            .map_err(|err| BuildError::io(format!("base: {op}"), &err))?;
    }

    let report = install(plan, profile, &mut staging, runner)?;

    let runtime = dirs(runtime_dirs(config));
    execute_op(&mut staging, runner, &runtime)
        .map_err(|err| BuildError::io(format!("base: {runtime}"), &err))?;

    let manifest = ImageManifest::from_staging(
        StageName::Base,
        None,
        profile,
        &config.image.base_image,
        &staging,
        None,
    )
    .map_err(|err| BuildError::io("base: manifest", &err))?;

    info!(
        executed = report.executed().len(),
        skipped = report.skipped().len(),
        digest = %manifest.short_digest(),
        "base built"
    );
    Ok(BuiltBase {
        staging,
        profile: profile.clone(),
        install: report,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingRunner;
    use crate::install::default_plan;
    use crate::profile::{resolve, BuildFlags};
    use tempfile::TempDir;

    fn source(temp: &TempDir) -> std::path::PathBuf {
        let source = temp.path().join("service");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("main.py"), "app = object()\n").unwrap();
        fs::write(source.join("requirements.txt"), "fastapi\n").unwrap();
        source
    }

    #[test]
    fn test_base_sets_env_sources_and_runtime_dirs() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::default();
        let profile = resolve(&BuildFlags::new(Some("development"), None));
        let mut runner = RecordingRunner::new();

        let base = build_base(
            &config,
            &profile,
            &default_plan(&config),
            &source(&temp),
            &temp.path().join("rootfs"),
            &mut runner,
        )
        .unwrap();

        let env = &base.staging.env;
        assert_eq!(env.get("ENVIRONMENT").map(String::as_str), Some("development"));
        assert_eq!(env.get("PYTHONPATH").map(String::as_str), Some("/app"));
        assert_eq!(env.get("PIP_NO_CACHE_DIR").map(String::as_str), Some("1"));
        assert_eq!(env.get("VIRTUAL_ENV").map(String::as_str), Some("/opt/venv"));
        assert!(env["PATH"].starts_with("/opt/venv/bin:"));
        let rootfs = temp.path().join("rootfs");
        assert!(rootfs.join("app/main.py").is_file());
        assert!(rootfs.join("app/data/embeddings").is_dir());
        assert!(rootfs.join("app/tmp").is_dir());
        assert!(runner.invocations().iter().all(|i| i.workdir == "/app"));
        assert_eq!(base.manifest.stage, StageName::Base);
    }

    #[test]
    fn test_base_digest_is_stable_for_same_inputs() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::default();
        let profile = BuildProfile::default();
        let src = source(&temp);
        let plan = default_plan(&config);

        let a = build_base(&config, &profile, &plan, &src, &temp.path().join("a"), &mut RecordingRunner::new())
            .unwrap();
        let b = build_base(&config, &profile, &plan, &src, &temp.path().join("b"), &mut RecordingRunner::new())
            .unwrap();

        assert_eq!(a.manifest.digest, b.manifest.digest);
    }

    #[test]
    fn test_runtime_dirs_are_rooted_at_app_root() {
        assert_eq!(
            runtime_dirs(&BuildConfig::default()),
            vec![
                "/app/data/repositories",
                "/app/data/embeddings",
                "/app/data/analysis",
                "/app/logs",
                "/app/tmp",
            ]
        );
    }
}
