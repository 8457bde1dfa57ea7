//! Preflight checks for build validation.
//!
//! Validates that the host can execute a build in the chosen mode before any
//! stage directory is allocated. This prevents cryptic errors halfway
//! through an install.
//!
//! # Example
//!
//! ```rust
//! use image_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("chroot") {
//!     println!("coreutils chroot not installed");
//! }
//!
//! let tools = &[("sh", "dash"), ("chroot", "coreutils")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::config::BuildConfig;
use crate::executor::users::running_as_root;
use crate::executor::ShellMode;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools every real build needs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("sh", "dash")];

/// Additional tools for chroot builds.
pub const CHROOT_TOOLS: &[(&str, &str)] = &[("chroot", "coreutils")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the host can run a build in `mode` with `config`.
///
/// Host builds run the interpreter from the host's PATH, so it must exist
/// there. Chroot builds need root, the `chroot` tool and a seed rootfs.
pub fn check_build_host(config: &BuildConfig, mode: ShellMode) -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    match mode {
        ShellMode::Host => {
            let python = config.image.python.as_str();
            if !command_exists(python) {
                bail!(
                    "interpreter '{}' not found in PATH (set image.python or use --chroot)",
                    python
                );
            }
        }
        ShellMode::Chroot => {
            check_required_tools(CHROOT_TOOLS)?;
            if !running_as_root() {
                bail!("chroot builds must run as root");
            }
            match &config.image.seed_rootfs {
                Some(seed) if seed.is_dir() => {}
                Some(seed) => bail!("image.seed_rootfs '{}' is not a directory", seed.display()),
                None => bail!("chroot builds need image.seed_rootfs"),
            }
        }
    }
    Ok(())
}
