//! Build failure taxonomy.
//!
//! Every variant is fatal for the build attempt that produced it. There is no
//! retry and no partial continuation; the caller re-runs the whole pipeline
//! after fixing the cause.

use std::fmt;

use thiserror::Error;

use crate::stages::StageName;

/// Which Verification Gate check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    /// The core libraries could not be loaded.
    LibraryLoad,
    /// The HTTP application object could not be resolved.
    EntryPoint,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::LibraryLoad => write!(f, "library-load"),
            CheckKind::EntryPoint => write!(f, "entry-point"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    #[error("install step '{step}' failed: {detail}")]
    Install { step: String, detail: String },

    #[error("verification check '{check}' failed: {detail}")]
    Verification { check: CheckKind, detail: String },

    #[error("runtime launch for stage '{stage}' failed: {detail}")]
    RuntimeLaunch { stage: StageName, detail: String },

    #[error("invalid install plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("invalid stage '{stage}': {reason}")]
    InvalidStage { stage: StageName, reason: String },

    #[error("{context}: {detail}")]
    Io { context: String, detail: String },
}

impl BuildError {
    /// Wrap an `anyhow` chain raised while doing filesystem or process work.
    pub fn io(context: impl Into<String>, err: &anyhow::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            detail: format!("{err:#}"),
        }
    }

    /// Short identity of the failing unit, used for exit messages and run
    /// manifests.
    pub fn failed_unit(&self) -> String {
        match self {
            BuildError::Install { step, .. } => format!("install:{step}"),
            BuildError::Verification { check, .. } => format!("verify:{check}"),
            BuildError::RuntimeLaunch { stage, .. } => format!("launch:{stage}"),
            BuildError::InvalidPlan { .. } => "plan".to_string(),
            BuildError::InvalidStage { stage, .. } => format!("stage:{stage}"),
            BuildError::Io { .. } => "io".to_string(),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_errors_name_the_check() {
        let lib = BuildError::Verification {
            check: CheckKind::LibraryLoad,
            detail: "No module named 'torch'".into(),
        };
        let entry = BuildError::Verification {
            check: CheckKind::EntryPoint,
            detail: "cannot import name 'app'".into(),
        };
        assert!(lib.to_string().contains("library-load"));
        assert!(entry.to_string().contains("entry-point"));
        assert_eq!(entry.failed_unit(), "verify:entry-point");
    }

    #[test]
    fn test_install_error_identifies_step() {
        let err = BuildError::Install {
            step: "tensor-library".into(),
            detail: "exit status 1".into(),
        };
        assert_eq!(err.failed_unit(), "install:tensor-library");
        assert_eq!(
            err.to_string(),
            "install step 'tensor-library' failed: exit status 1"
        );
    }

    #[test]
    fn test_io_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("permission denied").context("writing image.json");
        let err = BuildError::io("publishing image", &inner);
        let text = err.to_string();
        assert!(text.starts_with("publishing image: writing image.json"));
        assert!(text.contains("permission denied"));
    }
}
