//! Directory operation handlers: Op::Dirs, Op::Workdir

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::files::staged_path;

/// Handle Op::Dirs: Create multiple directories
pub fn handle_dirs(staging: &Path, paths: &[String]) -> Result<()> {
    for path in paths {
        let full_path = staged_path(staging, path)?;
        fs::create_dir_all(&full_path)
            .with_context(|| format!("creating image directory '{}'", full_path.display()))?;
    }
    Ok(())
}

/// Handle Op::Workdir: the directory must exist before commands run in it.
pub fn handle_workdir(staging: &Path, path: &str) -> Result<()> {
    let full_path = staged_path(staging, path)?;
    fs::create_dir_all(&full_path)
        .with_context(|| format!("creating working directory '{}'", full_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_staging() -> (TempDir, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        (temp, staging)
    }

    #[test]
    fn test_handle_dirs_creates_runtime_layout() {
        let (_temp, staging) = temp_staging();

        let paths = vec![
            "/app/data/repositories".to_string(),
            "/app/data/embeddings".to_string(),
            "/app/logs".to_string(),
        ];
        handle_dirs(&staging, &paths).unwrap();

        for path in &paths {
            assert!(
                staging.join(path.trim_start_matches('/')).is_dir(),
                "{} should exist",
                path
            );
        }
    }

    #[test]
    fn test_handle_dirs_idempotent() {
        let (_temp, staging) = temp_staging();

        let paths = vec!["/app/tmp".to_string()];
        handle_dirs(&staging, &paths).unwrap();
        handle_dirs(&staging, &paths).unwrap();

        assert!(staging.join("app/tmp").is_dir());
    }

    #[test]
    fn test_handle_workdir_creates_directory() {
        let (_temp, staging) = temp_staging();

        handle_workdir(&staging, "/app").unwrap();

        assert!(staging.join("app").is_dir());
    }
}
