//! Verification Gate.
//!
//! Smoke checks that run against the built base image before any runtime
//! stage may derive from it. [`verify`] is the only constructor of
//! [`VerifiedBase`], and derived stages only accept a `&VerifiedBase`, so an
//! unverified base cannot reach `development` or `production`.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult, CheckKind};
use crate::executor::{CommandRunner, Staging};
use crate::image::ImageManifest;
use crate::install::{InstallReport, VENV_PYTHON};
use crate::profile::BuildProfile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub kind: CheckKind,
    pub description: String,
    pub command: String,
    /// Always true for the gate's checks; a failing check aborts the build.
    pub must_succeed: bool,
}

/// The gate's two checks, in order: library load, then entry point. Both run
/// the image virtualenv's interpreter.
pub fn default_checks(config: &BuildConfig) -> Vec<VerificationCheck> {
    let python = VENV_PYTHON;
    let imports = config.verify.libraries.join(", ");
    let (module, attr) = config.runtime.entry_parts();
    vec![
        VerificationCheck {
            kind: CheckKind::LibraryLoad,
            description: format!("core libraries load ({imports})"),
            command: format!("{python} -c \"import {imports}; print('libraries ok')\""),
            must_succeed: true,
        },
        VerificationCheck {
            kind: CheckKind::EntryPoint,
            description: format!("application object resolves ({module}:{attr})"),
            command: format!("{python} -c \"from {module} import {attr}; print('entry point ok')\""),
            must_succeed: true,
        },
    ]
}

/// Base image as produced by the installer, not yet verified.
#[derive(Debug, Clone)]
pub struct BuiltBase {
    pub staging: Staging,
    pub profile: BuildProfile,
    pub install: InstallReport,
    pub manifest: ImageManifest,
}

/// A base image that passed every check.
#[derive(Debug, Clone)]
pub struct VerifiedBase {
    base: BuiltBase,
    passed: Vec<CheckKind>,
}

impl VerifiedBase {
    pub fn staging(&self) -> &Staging {
        &self.base.staging
    }

    pub fn profile(&self) -> &BuildProfile {
        &self.base.profile
    }

    pub fn install_report(&self) -> &InstallReport {
        &self.base.install
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.base.manifest
    }

    pub fn passed(&self) -> &[CheckKind] {
        &self.passed
    }
}

/// Run `checks` in order against `base`. The first failure aborts.
#[instrument(skip_all, fields(profile = %base.profile))]
pub fn verify(
    mut base: BuiltBase,
    checks: &[VerificationCheck],
    runner: &mut dyn CommandRunner,
) -> BuildResult<VerifiedBase> {
    let mut passed = Vec::with_capacity(checks.len());

    for check in checks {
        info!(check = %check.kind, "{}", check.description);
        let output = runner
            .run(&base.staging.invocation(check.command.as_str()))
            .map_err(|err| BuildError::Verification {
                check: check.kind,
                detail: format!("{err:#}"),
            })?;
        if !output.success && check.must_succeed {
            warn!(check = %check.kind, "verification failed");
            return Err(BuildError::Verification {
                check: check.kind,
                detail: output.failure_summary(),
            });
        }
        passed.push(check.kind);
    }

    base.staging.layers.push(format!(
        "verified {}",
        passed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    ));
    Ok(VerifiedBase { base, passed })
}
