//! Containerfile rendering.
//!
//! Emits the multi-stage Containerfile equivalent to what the staged build
//! does, from the same plan, checks and stage definitions. Profile choices
//! stay build arguments: GPU-only steps and the tensor index are shell
//! branches on `$ENABLE_GPU` compared against the exact literal `"true"`.

use std::fmt::Write as _;

use crate::component::{Op, StageAction};
use crate::config::BuildConfig;
use crate::executor::shell_quote;
use crate::install::{apt_command, default_plan, InstallPlan};
use crate::profile::DEFAULT_ENVIRONMENT;
use crate::runtime::RuntimeSpec;
use crate::stages::base::runtime_dirs;
use crate::stages::StageDef;
use crate::verify::default_checks;

pub fn render_containerfile(config: &BuildConfig) -> String {
    render_with_plan(config, &default_plan(config))
}

pub fn render_with_plan(config: &BuildConfig, plan: &InstallPlan) -> String {
    let mut out = String::new();
    let image = &config.image;

    line(&mut out, format!("ARG ENVIRONMENT={DEFAULT_ENVIRONMENT}"));
    line(&mut out, "ARG ENABLE_GPU=false");
    line(&mut out, "");

    // base
    line(&mut out, format!("FROM {} AS base", image.base_image));
    line(&mut out, "ARG ENVIRONMENT");
    line(&mut out, "ARG ENABLE_GPU");
    let venv = image.venv.trim_end_matches('/');
    line(&mut out, format!("ENV VIRTUAL_ENV={venv} \\"));
    line(&mut out, format!("    PATH={venv}/bin:$PATH \\"));
    line(&mut out, "    PYTHONUNBUFFERED=1 \\");
    line(&mut out, "    PYTHONDONTWRITEBYTECODE=1 \\");
    line(&mut out, "    PIP_NO_CACHE_DIR=1 \\");
    line(&mut out, format!("    PYTHONPATH={} \\", image.app_root));
    line(&mut out, "    ENVIRONMENT=${ENVIRONMENT}");
    line(&mut out, format!("WORKDIR {}", image.app_root));
    line(
        &mut out,
        format!("COPY {} ./", config.packages.requirements_file),
    );
    for step in plan.steps.iter().filter(|step| !step.action.is_empty()) {
        line(&mut out, format!("# {}", step.name));
        line(
            &mut out,
            format!("RUN {}", step.containerfile_command(&plan.python)),
        );
    }
    line(&mut out, "COPY . .");
    let dirs = runtime_dirs(config)
        .iter()
        .map(|d| shell_quote(d))
        .collect::<Vec<_>>()
        .join(" ");
    line(&mut out, format!("RUN mkdir -p {dirs}"));
    for check in default_checks(config) {
        line(&mut out, format!("# verify: {}", check.kind));
        line(&mut out, format!("RUN {}", check.command));
    }

    for def in StageDef::runtime_stages(config) {
        line(&mut out, "");
        render_stage(&mut out, &def);
    }
    out
}

fn render_stage(out: &mut String, def: &StageDef) {
    line(out, format!("FROM base AS {}", def.name));
    for op in def.setup_ops() {
        line(out, render_op(&op));
    }
    let app_user = format!("USER {}", def.identity.name);
    line(out, &app_user);

    for action in &def.actions {
        match action {
            StageAction::Op(op) => line(out, render_op(op)),
            StageAction::Elevated { reason, ops } => {
                line(out, format!("# elevated: {reason}"));
                line(out, "USER root");
                for op in ops {
                    line(out, render_op(op));
                }
                line(out, &app_user);
            }
        }
    }

    if let Some(runtime) = &def.runtime {
        render_runtime(out, runtime);
    }
}

fn render_runtime(out: &mut String, runtime: &RuntimeSpec) {
    let health = &runtime.health_check;
    line(out, format!("EXPOSE {}", runtime.exposed_port));
    line(
        out,
        format!(
            "HEALTHCHECK --interval={}s --timeout={}s --start-period={}s --retries={} \\",
            health.interval_seconds,
            health.timeout_seconds,
            health.start_period_seconds,
            health.retries
        ),
    );
    line(
        out,
        format!("    CMD {}", health.check_command(runtime.exposed_port)),
    );
    let argv = runtime
        .process_command
        .iter()
        .map(|arg| json_string(arg))
        .collect::<Vec<_>>()
        .join(", ");
    line(out, format!("CMD [{argv}]"));
}

fn render_op(op: &Op) -> String {
    match op {
        Op::Env(key, value) => format!("ENV {key}={}", json_string_if_needed(value)),
        Op::Workdir(path) => format!("WORKDIR {path}"),
        Op::Dirs(paths) => format!(
            "RUN mkdir -p {}",
            paths
                .iter()
                .map(|p| shell_quote(p))
                .collect::<Vec<_>>()
                .join(" ")
        ),
        Op::SystemPackages(packages) => format!("RUN {}", apt_command(packages)),
        Op::CopyTree { destination, .. } => format!("COPY . {destination}"),
        Op::Group { name, gid } => format!("RUN groupadd -g {gid} {name}"),
        Op::User {
            name,
            uid,
            gid,
            home,
            shell,
        } => format!("RUN useradd -m -u {uid} -g {gid} -d {home} -s {shell} {name}"),
        Op::Chown { path, user, group } => format!("RUN chown -R {user}:{group} {path}"),
        Op::Run(command) => format!("RUN {command}"),
    }
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""))
}

fn json_string_if_needed(value: &str) -> String {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"') {
        json_string(value)
    } else {
        value.to_string()
    }
}

fn line(out: &mut String, text: impl AsRef<str>) {
    let _ = writeln!(out, "{}", text.as_ref());
}
