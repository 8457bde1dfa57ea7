//! Declarative build actions.
//!
//! Stages are described as data: what needs to happen to the image, not how.
//! The [`crate::executor`] interprets these against a staging root and the
//! [`crate::render`] module turns the same data into a Containerfile.
//!
//! Paths inside ops are image paths (absolute, e.g. `/app/logs`). The executor
//! maps them under the staging root.
//!
//! # Example
//!
//! ```rust
//! use image_builder::component::{chown, elevated, system_packages, StageAction};
//!
//! let actions = vec![
//!     StageAction::Op(chown("/app", "appuser", "appuser")),
//!     elevated("debug tooling", vec![system_packages(["vim"])]),
//! ];
//! assert_eq!(actions.len(), 2);
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity a build action or process runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Root,
    User(String),
}

impl Identity {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Identity::Root)
    }

    pub fn name(&self) -> &str {
        match self {
            Identity::Root => "root",
            Identity::User(name) => name,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single build action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    // ─────────────────────────────────────────────────────────────────────
    // Environment
    // ─────────────────────────────────────────────────────────────────────
    /// Set a process-wide variable for later actions and the runtime.
    Env(String, String),

    /// Change the working directory (created if missing).
    Workdir(String),

    // ─────────────────────────────────────────────────────────────────────
    // Filesystem
    // ─────────────────────────────────────────────────────────────────────
    /// Create multiple directories at once.
    Dirs(Vec<String>),

    /// Copy a host directory tree into the image.
    CopyTree { source: PathBuf, destination: String },

    // ─────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────
    /// Ensure a group exists in /etc/group.
    Group { name: String, gid: u32 },

    /// Ensure a user exists in /etc/passwd.
    User {
        name: String,
        uid: u32,
        gid: u32,
        home: String,
        shell: String,
    },

    /// Hand a tree over to a user and group.
    Chown {
        path: String,
        user: String,
        group: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Packages
    // ─────────────────────────────────────────────────────────────────────
    /// Install OS packages. Only possible when commands run inside the
    /// image root.
    SystemPackages(Vec<String>),

    // ─────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────
    /// Run a shell command through the configured runner.
    Run(String),
}

impl Op {
    /// Whether this op can only be applied with elevated privileges.
    pub fn needs_privilege(&self) -> bool {
        matches!(
            self,
            Op::Group { .. } | Op::User { .. } | Op::Chown { .. } | Op::SystemPackages(_)
        )
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Env(key, value) => write!(f, "env {key}={value}"),
            Op::Workdir(path) => write!(f, "workdir {path}"),
            Op::Dirs(paths) => write!(f, "mkdir {}", paths.join(" ")),
            Op::CopyTree {
                source,
                destination,
            } => write!(f, "copy {} -> {destination}", source.display()),
            Op::Group { name, gid } => write!(f, "group {name} ({gid})"),
            Op::User { name, uid, .. } => write!(f, "user {name} ({uid})"),
            Op::Chown { path, user, group } => write!(f, "chown {user}:{group} {path}"),
            Op::SystemPackages(packages) => write!(f, "packages {}", packages.join(" ")),
            Op::Run(command) => write!(f, "run {command}"),
        }
    }
}

/// One entry of a stage's diff list.
///
/// Elevation is structural: an [`StageAction::Elevated`] block is the only way
/// to run ops as root after the stage switched to its app identity, and the
/// block always ends by dropping back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    Op(Op),
    Elevated { reason: String, ops: Vec<Op> },
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable stage definitions
// ─────────────────────────────────────────────────────────────────────────────

pub fn env(key: impl Into<String>, value: impl Into<String>) -> Op {
    Op::Env(key.into(), value.into())
}

pub fn workdir(path: impl Into<String>) -> Op {
    Op::Workdir(path.into())
}

pub fn dirs(paths: impl IntoIterator<Item = impl Into<String>>) -> Op {
    Op::Dirs(paths.into_iter().map(|p| p.into()).collect())
}

pub fn copy_tree(source: impl Into<PathBuf>, destination: impl Into<String>) -> Op {
    Op::CopyTree {
        source: source.into(),
        destination: destination.into(),
    }
}

pub fn group(name: impl Into<String>, gid: u32) -> Op {
    Op::Group {
        name: name.into(),
        gid,
    }
}

pub fn user(name: impl Into<String>, uid: u32, gid: u32, home: impl Into<String>) -> Op {
    Op::User {
        name: name.into(),
        uid,
        gid,
        home: home.into(),
        shell: "/bin/bash".to_string(),
    }
}

pub fn chown(path: impl Into<String>, user: impl Into<String>, group: impl Into<String>) -> Op {
    Op::Chown {
        path: path.into(),
        user: user.into(),
        group: group.into(),
    }
}

pub fn system_packages(packages: impl IntoIterator<Item = impl Into<String>>) -> Op {
    Op::SystemPackages(packages.into_iter().map(|p| p.into()).collect())
}

pub fn run(command: impl Into<String>) -> Op {
    Op::Run(command.into())
}

/// Wrap ops in a scoped elevation block.
pub fn elevated(reason: impl Into<String>, ops: Vec<Op>) -> StageAction {
    StageAction::Elevated {
        reason: reason.into(),
        ops,
    }
}
