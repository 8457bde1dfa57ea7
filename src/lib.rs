//! Staged image builder for an ML-backed HTTP service.
//!
//! Resolves a hardware/environment profile, installs dependencies in a
//! verified order, gates the result on smoke checks, and derives separate
//! `development` and `production` images, each with one foreground process
//! and a shared health contract.
//!
//! - **Profile** - Build flags to a fixed [`BuildProfile`]
//! - **Installer** - Ordered, condition-gated install steps
//! - **Verification Gate** - Library-load and entry-point checks
//! - **Stages** - `base` snapshot plus a diff list per runtime stage
//! - **Runtime** - Launcher, runtime contract and health tracking
//!
//! # Architecture
//!
//! ```text
//! BuildFlags ──resolve──▶ BuildProfile
//!                             │
//!                   install (InstallPlan)
//!                             │
//!                         BuiltBase ──verify──▶ VerifiedBase
//!                                                 │
//!                              ┌──────────────────┴──────────────────┐
//!                     build_stage(development)             build_stage(production)
//!                              │                                     │
//!                      Launcher (uvicorn --reload)       Launcher (gunicorn workers)
//! ```
//!
//! # Example
//!
//! ```rust
//! use image_builder::profile::{resolve, BuildFlags};
//! use image_builder::install::default_plan;
//! use image_builder::BuildConfig;
//!
//! let profile = resolve(&BuildFlags::new(Some("production"), Some("true")));
//! let plan = default_plan(&BuildConfig::default());
//! plan.validate().unwrap();
//! for step in plan.resolve(&profile) {
//!     println!("{}: {:?}", step.name, step.command);
//! }
//! ```

pub mod component;
pub mod config;
pub mod error;
pub mod executor;
pub mod image;
pub mod install;
pub mod orchestrator;
pub mod preflight;
pub mod profile;
pub mod render;
pub mod runtime;
pub mod stage_runs;
pub mod stages;
pub mod verify;

pub use config::BuildConfig;
pub use error::{BuildError, BuildResult, CheckKind};
pub use orchestrator::{BuildRequest, Orchestrator};
pub use profile::{resolve, BuildFlags, BuildProfile};
pub use stages::StageName;
