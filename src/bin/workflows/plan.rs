use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image_builder::component::StageAction;
use image_builder::install::default_plan;
use image_builder::render::render_containerfile;
use image_builder::stages::StageDef;
use image_builder::verify::default_checks;
use image_builder::{BuildConfig, BuildProfile};

pub(crate) fn plan(config: &BuildConfig, profile: &BuildProfile) -> Result<()> {
    let install = default_plan(config);
    install
        .validate()
        .map_err(|err| anyhow!("invalid install plan: {err}"))?;

    println!("profile: {profile}");
    println!();
    println!("install:");
    for step in install.resolve(profile) {
        match step.command {
            Some(command) => println!("  {:<24} {command}", step.name),
            None => println!("  {:<24} (skipped)", step.name),
        }
    }

    println!();
    println!("verify:");
    for check in default_checks(config) {
        println!("  {:<24} {}", check.kind.to_string(), check.command);
    }

    for def in StageDef::runtime_stages(config) {
        println!();
        println!("stage {} (from base):", def.name);
        for op in def.setup_ops() {
            println!("  [root] {op}");
        }
        for action in &def.actions {
            match action {
                StageAction::Op(op) => println!("  {op}"),
                StageAction::Elevated { reason, ops } => {
                    for op in ops {
                        println!("  [root: {reason}] {op}");
                    }
                }
            }
        }
        println!("  user {}", def.final_identity());
        if let Some(runtime) = &def.runtime {
            println!("  expose {}", runtime.exposed_port);
            println!(
                "  health {} every {}s",
                runtime.health_check.url(runtime.exposed_port),
                runtime.health_check.interval_seconds
            );
            println!("  cmd {}", runtime.command_line());
        }
    }
    Ok(())
}

pub(crate) fn render(config: &BuildConfig, output: Option<&Path>) -> Result<()> {
    let text = render_containerfile(config);
    match output {
        Some(path) => {
            fs::write(path, &text).with_context(|| format!("writing '{}'", path.display()))?;
            println!("[render] wrote {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}
