//! image-builder - staged, verified image builds for the ML service.

mod workflows;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use image_builder::{resolve, BuildConfig, BuildFlags, BuildProfile, StageName};
use tracing::Level;

#[derive(Parser)]
#[command(name = "image-builder")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged, verified image builds for ML-backed services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args)]
struct GlobalArgs {
    /// Use alternate config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log progress
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log every applied op and command
    #[arg(long, global = true)]
    debug: bool,
}

/// Build arguments deciding the profile.
#[derive(Args, Clone)]
pub(crate) struct ProfileArgs {
    /// Target environment (development, production, ...)
    #[arg(long, env = "ENVIRONMENT")]
    environment: Option<String>,

    /// GPU branch; only the exact value "true" enables it
    #[arg(long, env = "ENABLE_GPU", value_name = "STRING")]
    enable_gpu: Option<String>,
}

impl ProfileArgs {
    pub(crate) fn resolve(&self) -> BuildProfile {
        resolve(&BuildFlags::new(
            self.environment.as_deref(),
            self.enable_gpu.as_deref(),
        ))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved profile, install steps, checks and stages
    Plan {
        #[command(flatten)]
        profile: ProfileArgs,
    },

    /// Build base, verify it, then build runtime stages
    Build {
        #[command(flatten)]
        profile: ProfileArgs,

        /// Runtime stage to build (repeatable; default follows the environment)
        #[arg(long = "stage", value_name = "STAGE")]
        stages: Vec<StageName>,

        /// Service source tree (overrides image.source_dir)
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,

        /// Output root (overrides output.dir)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Record commands instead of running them
        #[arg(long)]
        dry_run: bool,

        /// Run commands inside a chroot of the staged rootfs
        #[arg(long, conflicts_with = "dry_run")]
        chroot: bool,

        /// Also pack each stage rootfs into rootfs.tar.zst
        #[arg(long)]
        export: bool,
    },

    /// Print the equivalent multi-stage Containerfile
    Render {
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Run the foreground process of the latest successful stage build
    Launch {
        /// development or production
        stage: StageName,

        /// Output root (overrides output.dir)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Start the process inside a chroot as the app user
        #[arg(long)]
        chroot: bool,

        /// Apply the health check contract and stop the process if it
        /// becomes unhealthy
        #[arg(long)]
        wait_healthy: bool,
    },

    /// List recorded runs of a stage, newest first
    Runs {
        stage: StageName,

        /// Output root (overrides output.dir)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose, cli.global.debug);

    let cwd = std::env::current_dir().context("resolving current directory")?;
    let (config, source) = BuildConfig::discover(cli.global.config.as_deref(), &cwd)?;
    match &source {
        Some(path) => tracing::info!(config = %path.display(), "loaded config"),
        None => tracing::debug!("no config file found; using defaults"),
    }

    match cli.command {
        Commands::Plan { profile } => workflows::plan(&config, &profile.resolve()),
        Commands::Build {
            profile,
            stages,
            source,
            output,
            dry_run,
            chroot,
            export,
        } => workflows::build(
            config,
            &cwd,
            workflows::BuildOptions {
                profile: profile.resolve(),
                stages,
                source,
                output,
                dry_run,
                chroot,
                export,
            },
        ),
        Commands::Render { output } => workflows::render(&config, output.as_deref()),
        Commands::Launch {
            stage,
            output,
            chroot,
            wait_healthy,
        } => workflows::launch(
            &config,
            &cwd,
            workflows::LaunchOptions {
                stage,
                output: output.as_deref(),
                chroot,
                wait_healthy,
            },
        ),
        Commands::Runs { stage, output } => {
            workflows::runs(&config, &cwd, stage, output.as_deref())
        }
    }
}

fn init_tracing(verbose: bool, debug: bool) {
    let level = if debug {
        Level::DEBUG
    } else if verbose {
        Level::INFO
    } else {
        Level::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
