use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use image_builder::executor::{host_env, VIRTUAL_ENV_VAR};
use image_builder::image::{ImageManifest, ROOTFS_DIRNAME};
use image_builder::orchestrator::latest_run_dir;
use image_builder::runtime::{self, http_check, HealthState, HealthTracker, LaunchTarget, Launcher};
use image_builder::{BuildConfig, StageName};

pub(crate) struct LaunchOptions<'a> {
    pub stage: StageName,
    pub output: Option<&'a Path>,
    pub chroot: bool,
    pub wait_healthy: bool,
}

pub(crate) fn launch(config: &BuildConfig, cwd: &Path, opts: LaunchOptions<'_>) -> Result<()> {
    let stage = opts.stage;
    let output_dir = crate::workflows::output_root(config, cwd, opts.output);
    let run_dir = latest_run_dir(&output_dir, stage)
        .map_err(|err| anyhow!("{err}"))?
        .ok_or_else(|| {
            anyhow!(
                "no successful {stage} runs under '{}'.\nBuild it first: `image-builder build --stage {stage}`",
                output_dir.join(stage.as_str()).display()
            )
        })?;

    let manifest = ImageManifest::load(&run_dir)?;
    let Some(spec) = manifest.runtime.clone() else {
        bail!("{stage} image has no runtime; only development and production can be launched");
    };

    let rootfs = run_dir.join(ROOTFS_DIRNAME);
    let mut env = manifest.env.clone();
    let target = if opts.chroot {
        LaunchTarget::Chroot {
            root: rootfs,
            workdir: manifest.workdir.clone(),
            user: manifest.user.clone(),
        }
    } else {
        let workdir: PathBuf = rootfs.join(manifest.workdir.trim_start_matches('/'));
        env = host_env(&rootfs, &env)?;
        let interpreter = env
            .get(VIRTUAL_ENV_VAR)
            .map(|venv| Path::new(venv).join("bin").join("python"))
            .filter(|python| python.is_file());
        LaunchTarget::Host {
            workdir,
            interpreter,
        }
    };

    println!(
        "[launch:{stage}] run {} ({}) on port {}: {}",
        run_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        manifest.short_digest(),
        spec.exposed_port,
        spec.command_line()
    );

    let health = spec.health_check.clone();
    let port = spec.exposed_port;
    let mut launcher = Launcher::new(stage, spec, target).with_env(env);
    let mut process = launcher.launch().map_err(|err| anyhow!("{err}"))?;

    if opts.wait_healthy {
        let url = health.url(port);
        let mut tracker = HealthTracker::new(health.clone());
        let state = runtime::wait_healthy(
            &mut process,
            &mut tracker,
            &mut || http_check(&health, port),
            &mut |interval| std::thread::sleep(interval),
        )
        .map_err(|err| anyhow!("{err}"))?;
        if state == HealthState::Unhealthy {
            process.kill().map_err(|err| anyhow!("{err}"))?;
            let _ = process.wait();
            bail!(
                "[launch:{stage}] unhealthy after {} consecutive failures of {url}",
                tracker.consecutive_failures()
            );
        }
        println!("[launch:{stage}] pid {} {state}: {url}", process.pid());
    }

    let status = process.wait().map_err(|err| anyhow!("{err}"))?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
