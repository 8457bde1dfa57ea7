use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image_builder::executor::{CommandRunner, RecordingRunner, ShellMode, ShellRunner};
use image_builder::orchestrator::{default_stages, BuildOutcome};
use image_builder::{preflight, BuildConfig, BuildProfile, BuildRequest, Orchestrator, StageName};

const DRY_RUN_DIRNAME: &str = ".dry-run";

pub(crate) struct BuildOptions {
    pub profile: BuildProfile,
    pub stages: Vec<StageName>,
    pub source: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub dry_run: bool,
    pub chroot: bool,
    pub export: bool,
}

pub(crate) fn build(mut config: BuildConfig, cwd: &Path, opts: BuildOptions) -> Result<()> {
    if opts.export {
        config.output.export = true;
    }
    let mode = if opts.chroot {
        ShellMode::Chroot
    } else {
        ShellMode::Host
    };

    let source_dir = absolute(cwd, opts.source.as_deref().unwrap_or(&config.image.source_dir));
    if !source_dir.is_dir() {
        anyhow::bail!("source tree '{}' is not a directory", source_dir.display());
    }

    let mut output_dir = crate::workflows::output_root(&config, cwd, opts.output.as_deref());
    if opts.dry_run {
        output_dir = output_dir.join(DRY_RUN_DIRNAME);
        if output_dir.exists() {
            fs::remove_dir_all(&output_dir)
                .with_context(|| format!("clearing '{}'", output_dir.display()))?;
        }
    } else {
        preflight::check_build_host(&config, mode).context("preflight failed")?;
    }

    let stages = if opts.stages.is_empty() {
        default_stages(&opts.profile)
    } else {
        opts.stages
    };
    let request = BuildRequest {
        profile: opts.profile,
        stages,
        source_dir,
        output_dir,
    };
    println!(
        "[build] profile {} -> base, {}",
        request.profile,
        stage_list(&request.stages)
    );

    if opts.dry_run {
        let mut runner = RecordingRunner::new();
        let outcome = run_build(&config, &mut runner, &request)?;
        report(&outcome);
        println!("[build] dry run; commands that would run:");
        for invocation in runner.invocations() {
            println!(
                "  [{}] {} $ {}",
                invocation.identity, invocation.workdir, invocation.command
            );
        }
        return Ok(());
    }

    let mut runner = ShellRunner::new(mode);
    let outcome = run_build(&config, &mut runner, &request)?;
    report(&outcome);
    Ok(())
}

fn stage_list(stages: &[StageName]) -> String {
    stages
        .iter()
        .map(|stage| stage.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn run_build(
    config: &BuildConfig,
    runner: &mut dyn CommandRunner,
    request: &BuildRequest,
) -> Result<BuildOutcome> {
    Orchestrator::new(config, runner)
        .run(request)
        .map_err(|err| anyhow!("build failed at {}: {err}", err.failed_unit()))
}

fn report(outcome: &BuildOutcome) {
    for (name, status) in &outcome.install.steps {
        println!("[build:base] step {name}: {status}");
    }
    println!(
        "[build:base] run {} verified ({})",
        outcome.base.run_id,
        outcome.base.manifest.short_digest()
    );
    for (run, image) in &outcome.stages {
        let port = image
            .manifest
            .exposed_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "[build:{}] run {} ok ({}) port {} -> {}",
            run.stage,
            run.run_id,
            run.manifest.short_digest(),
            port,
            run.run_dir.display()
        );
    }
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_list_keeps_request_order() {
        assert_eq!(
            stage_list(&[StageName::Production, StageName::Development]),
            "production, development"
        );
        assert_eq!(stage_list(&[]), "");
    }
}
