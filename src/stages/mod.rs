//! Stage graph: `base -> development`, `base -> production`.
//!
//! `base` is built by [`base::build_base`] and must pass the Verification
//! Gate. The two runtime stages are described by a [`StageDef`] (identity,
//! an ordered diff of [`StageAction`]s, one runtime) and built by
//! [`build_stage`] from a copy of the verified base snapshot. Inheritance is
//! exactly one level; runtime stages never derive from each other.

pub mod base;
mod development;
mod privilege;
mod production;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::component::{self, Identity, Op, StageAction};
use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::executor::{execute_op, files, CommandRunner};
use crate::image::{Image, ImageManifest};
use crate::profile::BuildProfile;
use crate::runtime::RuntimeSpec;
use crate::verify::VerifiedBase;

pub use base::build_base;
pub use privilege::PrivilegeGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Base,
    Development,
    Production,
}

impl StageName {
    pub const ALL: [StageName; 3] = [
        StageName::Base,
        StageName::Development,
        StageName::Production,
    ];

    pub fn parent(self) -> Option<StageName> {
        match self {
            StageName::Base => None,
            StageName::Development | StageName::Production => Some(StageName::Base),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Base => "base",
            StageName::Development => "development",
            StageName::Production => "production",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                format!("unknown stage '{s}' (expected base, development or production)")
            })
    }
}

/// Unprivileged identity a runtime stage ends up as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

impl AppIdentity {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            name: config.image.app_user.clone(),
            uid: config.image.app_uid,
            gid: config.image.app_gid,
            home: format!("/home/{}", config.image.app_user),
        }
    }
}

/// A runtime stage: identity setup, then `actions` as the app identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDef {
    pub name: StageName,
    pub identity: AppIdentity,
    pub app_root: String,
    pub actions: Vec<StageAction>,
    pub runtime: Option<RuntimeSpec>,
}

impl StageDef {
    pub fn for_stage(name: StageName, config: &BuildConfig) -> BuildResult<Self> {
        match name {
            StageName::Base => Err(BuildError::InvalidStage {
                stage: name,
                reason: "base is built by the installer, not from a stage definition"
                    .to_string(),
            }),
            StageName::Development => Ok(development::definition(config)),
            StageName::Production => Ok(production::definition(config)),
        }
    }

    /// Both runtime stages, development first.
    pub fn runtime_stages(config: &BuildConfig) -> [Self; 2] {
        [
            development::definition(config),
            production::definition(config),
        ]
    }

    /// Ops run as root before the stage drops to the app identity.
    pub fn setup_ops(&self) -> Vec<Op> {
        let id = &self.identity;
        vec![
            component::group(&id.name, id.gid),
            component::user(&id.name, id.uid, id.gid, &id.home),
            component::chown(&self.app_root, &id.name, &id.name),
        ]
    }

    /// Identity after the last action. Elevated blocks always drop back, so
    /// this is the app identity.
    pub fn final_identity(&self) -> Identity {
        Identity::User(self.identity.name.clone())
    }

    pub fn validate(&self) -> BuildResult<()> {
        let invalid = |reason: String| BuildError::InvalidStage {
            stage: self.name,
            reason,
        };

        if self.name.parent() != Some(StageName::Base) {
            return Err(invalid("only stages deriving from base can be defined".into()));
        }
        if self.final_identity().is_privileged() || self.identity.name == "root" {
            return Err(invalid("final identity must be unprivileged".into()));
        }
        if self.identity.uid == 0 {
            return Err(invalid("app identity must not use uid 0".into()));
        }
        let Some(runtime) = &self.runtime else {
            return Err(invalid("stage defines no runtime".into()));
        };
        if runtime.process_command.is_empty() {
            return Err(invalid("runtime command is empty".into()));
        }
        if runtime.exposed_port == 0 {
            return Err(invalid("runtime exposes no port".into()));
        }
        for action in &self.actions {
            match action {
                StageAction::Op(op) if op.needs_privilege() => {
                    return Err(invalid(format!(
                        "'{op}' needs privileges outside an elevated block"
                    )));
                }
                StageAction::Elevated { reason, ops } if ops.is_empty() => {
                    return Err(invalid(format!("elevated block '{reason}' is empty")));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Shared inputs for building runtime stages.
pub struct BuildContext<'a> {
    pub config: &'a BuildConfig,
    pub runner: &'a mut dyn CommandRunner,
}

/// Build a runtime stage into `rootfs` from a verified base.
#[instrument(skip_all, fields(stage = %def.name, profile = %profile))]
pub fn build_stage(
    def: &StageDef,
    parent: &VerifiedBase,
    profile: &BuildProfile,
    ctx: &mut BuildContext<'_>,
    rootfs: &Path,
) -> BuildResult<Image> {
    def.validate()?;
    if profile != parent.profile() {
        return Err(BuildError::InvalidStage {
            stage: def.name,
            reason: format!(
                "profile {} differs from the verified base's {}",
                profile,
                parent.profile()
            ),
        });
    }

    info!(parent = %parent.manifest().short_digest(), "building stage");
    files::copy_snapshot(parent.staging().root(), rootfs)
        .map_err(|err| BuildError::io(format!("seeding stage '{}'", def.name), &err))?;

    let mut staging = parent.staging().clone();
    staging.root = rootfs.to_path_buf();
    staging.identity = Identity::Root;

    let stage_err = |what: String| {
        let stage = def.name;
        move |err: anyhow::Error| BuildError::io(format!("stage '{stage}': {what}"), &err)
    };

    for op in def.setup_ops() {
        execute_op(&mut staging, ctx.runner, &op).map_err(stage_err(op.to_string()))?;
    }
    staging.identity = def.final_identity();
    staging.layers.push(format!("user {}", staging.identity));

    for action in &def.actions {
        match action {
            StageAction::Op(op) => {
                execute_op(&mut staging, ctx.runner, op).map_err(stage_err(op.to_string()))?;
            }
            StageAction::Elevated { reason, ops } => {
                let mut guard = PrivilegeGuard::elevate(&mut staging, reason);
                for op in ops {
                    execute_op(&mut guard, ctx.runner, op).map_err(|err| {
                        BuildError::Install {
                            step: format!("{}/{}", def.name, reason),
                            detail: format!("{err:#}"),
                        }
                    })?;
                }
            }
        }
    }

    if staging.identity != def.final_identity() {
        return Err(BuildError::InvalidStage {
            stage: def.name,
            reason: format!("stage ended as '{}'", staging.identity),
        });
    }

    let manifest = ImageManifest::from_staging(
        def.name,
        Some(&parent.manifest().digest),
        profile,
        &ctx.config.image.base_image,
        &staging,
        def.runtime.as_ref(),
    )
    .map_err(|err| BuildError::io(format!("stage '{}': manifest", def.name), &err))?;

    info!(digest = %manifest.short_digest(), "stage built");
    Ok(Image {
        rootfs: rootfs.to_path_buf(),
        manifest,
    })
}
