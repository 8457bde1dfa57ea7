use std::path::Path;

use anyhow::Result;
use image_builder::stage_runs::load_runs_metadata;
use image_builder::{BuildConfig, StageName};

pub(crate) fn runs(
    config: &BuildConfig,
    cwd: &Path,
    stage: StageName,
    output: Option<&Path>,
) -> Result<()> {
    let stage_root = crate::workflows::output_root(config, cwd, output).join(stage.as_str());
    let runs = load_runs_metadata(&stage_root)?;
    if runs.is_empty() {
        println!("[runs:{stage}] none under {}", stage_root.display());
        return Ok(());
    }

    for run in runs {
        let digest = run
            .image_digest
            .as_deref()
            .map(|d| d.trim_start_matches("sha256:").chars().take(12).collect())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<8} {:<24} {}  {}",
            run.run_id,
            run.status.to_string(),
            run.profile,
            digest,
            run.finished_at_utc.as_deref().unwrap_or(&run.created_at_utc)
        );
        if let Some(failure) = &run.failure {
            println!("    {failure}");
        }
    }
    Ok(())
}
