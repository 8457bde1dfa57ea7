//! End-to-end pipeline: install, verify, then build the runtime stages.
//!
//! Every stage build gets its own run directory under
//! `<output>/<stage>/<run_id>/` and a run manifest that ends `success` or
//! `failed`. A failure anywhere stops the pipeline; nothing after it runs.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::executor::CommandRunner;
use crate::image::{export_rootfs, Image, ImageManifest, EXPORT_FILENAME, ROOTFS_DIRNAME};
use crate::install::{default_plan, InstallReport};
use crate::profile::{BuildProfile, Environment};
use crate::stage_runs::{self, RunMetadata};
use crate::stages::{build_base, build_stage, BuildContext, StageDef, StageName};
use crate::verify::{default_checks, verify, VerifiedBase};

/// Runtime stages built for a profile when none are requested explicitly:
/// the one matching the environment, or both for unknown environments.
pub fn default_stages(profile: &BuildProfile) -> Vec<StageName> {
    match profile.environment() {
        Environment::Development => vec![StageName::Development],
        Environment::Production => vec![StageName::Production],
        Environment::Other(_) => vec![StageName::Development, StageName::Production],
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub profile: BuildProfile,
    /// Runtime stages to build after the base, in order.
    pub stages: Vec<StageName>,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// One finished stage run.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub stage: StageName,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub manifest: ImageManifest,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub base: StageRun,
    pub install: InstallReport,
    pub stages: Vec<(StageRun, Image)>,
}

pub struct Orchestrator<'a> {
    config: &'a BuildConfig,
    runner: &'a mut dyn CommandRunner,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a BuildConfig, runner: &'a mut dyn CommandRunner) -> Self {
        Self { config, runner }
    }

    pub fn run(&mut self, request: &BuildRequest) -> BuildResult<BuildOutcome> {
        let config = self.config;
        let profile = &request.profile;
        let plan = default_plan(config);
        plan.validate()?;
        for stage in &request.stages {
            if *stage == StageName::Base {
                return Err(BuildError::InvalidStage {
                    stage: *stage,
                    reason: "base is always built; request runtime stages only".to_string(),
                });
            }
        }
        let defs = request
            .stages
            .iter()
            .map(|stage| StageDef::for_stage(*stage, config))
            .collect::<BuildResult<Vec<_>>>()?;
        for def in &defs {
            def.validate()?;
        }

        info!(profile = %profile, stages = ?request.stages, "starting build");

        let runner = &mut *self.runner;
        let (base_run, verified) =
            stage_run(config, &request.output_dir, StageName::Base, profile, |rootfs| {
                let base = build_base(config, profile, &plan, &request.source_dir, rootfs, runner)?;
                let verified = verify(base, &default_checks(config), runner)?;
                let manifest = verified.manifest().clone();
                Ok((verified, manifest))
            })?;
        let install = verified.install_report().clone();

        let mut stages = Vec::with_capacity(defs.len());
        for def in &defs {
            let (run, image) = self.build_runtime_stage(def, &verified, request)?;
            stages.push((run, image));
        }

        Ok(BuildOutcome {
            base: base_run,
            install,
            stages,
        })
    }

    fn build_runtime_stage(
        &mut self,
        def: &StageDef,
        verified: &VerifiedBase,
        request: &BuildRequest,
    ) -> BuildResult<(StageRun, Image)> {
        let config = self.config;
        let mut ctx = BuildContext {
            config,
            runner: &mut *self.runner,
        };
        stage_run(
            config,
            &request.output_dir,
            def.name,
            &request.profile,
            |rootfs| {
                let image = build_stage(def, verified, &request.profile, &mut ctx, rootfs)?;
                let manifest = image.manifest.clone();
                Ok((image, manifest))
            },
        )
    }
}

/// Run `build` inside a fresh, locked run directory and record the outcome.
fn stage_run<T>(
    config: &BuildConfig,
    output_dir: &Path,
    stage: StageName,
    profile: &BuildProfile,
    build: impl FnOnce(&Path) -> BuildResult<(T, ImageManifest)>,
) -> BuildResult<(StageRun, T)> {
    let io = |context: &str| {
        let context = format!("{stage}: {context}");
        move |err: anyhow::Error| BuildError::io(context, &err)
    };

    let stage_root = output_dir.join(stage.as_str());
    let _lock = stage_runs::lock_stage(&stage_root).map_err(io("locking stage output"))?;
    let (run_id, run_dir) =
        stage_runs::allocate_run_dir(&stage_root).map_err(io("allocating run directory"))?;
    let mut metadata = RunMetadata::started(&run_id, stage.as_str(), &profile.to_string());
    stage_runs::write_run_metadata(&run_dir, &metadata).map_err(io("recording run start"))?;
    info!(stage = %stage, run_id = %run_id, "stage run started");

    let result = build(&run_dir.join(ROOTFS_DIRNAME)).and_then(|(value, manifest)| {
        manifest
            .write(&run_dir)
            .map_err(io("writing image manifest"))?;
        if config.output.export {
            export_rootfs(
                &run_dir.join(ROOTFS_DIRNAME),
                &run_dir.join(EXPORT_FILENAME),
                &manifest.ownership,
            )
            .map_err(io("exporting rootfs"))?;
        }
        Ok((value, manifest))
    });

    match result {
        Ok((value, manifest)) => {
            metadata.succeed(&manifest.digest);
            stage_runs::write_run_metadata(&run_dir, &metadata)
                .map_err(io("recording run success"))?;
            stage_runs::prune_old_runs(&stage_root, config.output.keep_runs)
                .map_err(io("pruning old runs"))?;
            info!(stage = %stage, run_id = %run_id, digest = %manifest.short_digest(), "stage run succeeded");
            Ok((
                StageRun {
                    stage,
                    run_id,
                    run_dir,
                    manifest,
                },
                value,
            ))
        }
        Err(err) => {
            metadata.fail(format!("{}: {err}", err.failed_unit()));
            if let Err(write_err) = stage_runs::write_run_metadata(&run_dir, &metadata) {
                warn!(stage = %stage, "failed to persist stage run metadata: {write_err:#}");
            }
            warn!(stage = %stage, run_id = %run_id, failed = %err.failed_unit(), "stage run failed");
            Err(err)
        }
    }
}

/// Run directory of the latest successful run of `stage`.
pub fn latest_run_dir(output_dir: &Path, stage: StageName) -> BuildResult<Option<PathBuf>> {
    let stage_root = output_dir.join(stage.as_str());
    let run_id = stage_runs::latest_successful_run_id(&stage_root)
        .map_err(|err| BuildError::io(format!("{stage}: reading runs"), &err))?;
    Ok(run_id.map(|id| stage_root.join(id)))
}
