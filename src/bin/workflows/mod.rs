mod build;
mod launch;
mod plan;
mod runs;

pub(crate) use build::{build, BuildOptions};
pub(crate) use launch::{launch, LaunchOptions};
pub(crate) use plan::{plan, render};
pub(crate) use runs::runs;

use std::path::{Path, PathBuf};

use image_builder::BuildConfig;

/// Output root: the `--output` flag, else `output.dir` relative to `cwd`.
pub(crate) fn output_root(config: &BuildConfig, cwd: &Path, flag: Option<&Path>) -> PathBuf {
    let dir = flag.unwrap_or(&config.output.dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        cwd.join(dir)
    }
}
