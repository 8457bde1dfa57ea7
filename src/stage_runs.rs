//! Stage run directories.
//!
//! Each stage build writes a fresh `<output>/<stage>/<run_id>/` directory and
//! never touches earlier runs. Run ids are sortable base62 strings, the run
//! manifest (`run-manifest.json`) moves from `running` to `success` or
//! `failed`, and only `success` runs are ever handed out as ready.

use std::cmp::Reverse;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const LOCK_FILENAME: &str = ".lock";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub stage: String,
    pub profile: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub image_digest: Option<String>,
    /// Failing unit and detail for `failed` runs.
    pub failure: Option<String>,
}

impl RunMetadata {
    pub fn started(run_id: &str, stage: &str, profile: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            profile: profile.to_string(),
            status: RunStatus::Running,
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            image_digest: None,
            failure: None,
        }
    }

    pub fn succeed(&mut self, image_digest: &str) {
        self.status = RunStatus::Success;
        self.finished_at_utc = Some(now_utc_compact());
        self.image_digest = Some(image_digest.to_string());
    }

    pub fn fail(&mut self, failure: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.finished_at_utc = Some(now_utc_compact());
        self.failure = Some(failure.into());
    }
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

pub fn write_run_metadata(run_dir: &Path, metadata: &RunMetadata) -> Result<()> {
    let path = manifest_path(run_dir);
    write_json_atomic(&path, metadata)
        .with_context(|| format!("writing stage run metadata '{}'", path.display()))
}

/// Serialize `value` next to `path` and rename it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing json payload")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn load_runs_metadata(stage_root_dir: &Path) -> Result<Vec<RunMetadata>> {
    if !stage_root_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(stage_root_dir).with_context(|| {
        format!(
            "reading stage runs directory '{}'",
            stage_root_dir.display()
        )
    })? {
        let entry = entry.with_context(|| {
            format!(
                "iterating stage runs directory '{}'",
                stage_root_dir.display()
            )
        })?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading stage run metadata '{}'", path.display()))?;
        let parsed: RunMetadata = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing stage run metadata '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs)
}

pub fn latest_successful_run_id(stage_root_dir: &Path) -> Result<Option<String>> {
    let runs = load_runs_metadata(stage_root_dir)?;
    Ok(runs
        .into_iter()
        .find(|run| run.status == RunStatus::Success)
        .map(|run| run.run_id))
}

/// Remove all but the `keep` newest runs. `running` runs are left alone.
pub fn prune_old_runs(stage_root_dir: &Path, keep: usize) -> Result<()> {
    let runs = load_runs_metadata(stage_root_dir)?;
    for run in runs
        .into_iter()
        .filter(|run| run.status != RunStatus::Running)
        .skip(keep.max(1))
    {
        let path = stage_root_dir.join(&run.run_id);
        fs::remove_dir_all(&path).with_context(|| {
            format!("removing expired stage run directory '{}'", path.display())
        })?;
    }
    Ok(())
}

fn run_sort_key(run: &RunMetadata) -> (String, String) {
    (
        run.finished_at_utc
            .clone()
            .unwrap_or_else(|| run.created_at_utc.clone()),
        run.run_id.clone(),
    )
}

pub fn allocate_run_dir(stage_root_dir: &Path) -> Result<(String, PathBuf)> {
    for _ in 0..32 {
        let run_id = generate_run_id()?;
        let run_root = stage_root_dir.join(&run_id);
        if run_root.exists() {
            continue;
        }
        fs::create_dir_all(&run_root).with_context(|| {
            format!(
                "creating stage run output directory '{}'",
                run_root.display()
            )
        })?;
        return Ok((run_id, run_root));
    }
    bail!(
        "failed allocating unique stage run directory under '{}'",
        stage_root_dir.display()
    )
}

/// Sortable run id: base62 of nanosecond time, salted with pid and a counter.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating stage run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let suffix = base62_encode_u128(entropy);
    if suffix.len() > 20 {
        bail!("sortable stage run id overflow while generating run identifier")
    }
    Ok(suffix)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        let idx = (value % 62) as usize;
        bytes.push(ALPHABET[idx] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Exclusive hold on a stage output root. Released on drop.
#[derive(Debug)]
pub struct StageLock {
    _file: File,
}

/// Lock a stage root so two builders never write the same stage at once.
pub fn lock_stage(stage_root_dir: &Path) -> Result<StageLock> {
    fs::create_dir_all(stage_root_dir).with_context(|| {
        format!(
            "creating stage output root directory '{}'",
            stage_root_dir.display()
        )
    })?;
    let path = stage_root_dir.join(LOCK_FILENAME);
    // Never unlink the lock file: a second process could then lock a fresh
    // inode at the same path.
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("opening stage lock '{}'", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        bail!(
            "stage output is locked by another build: {}",
            path.display()
        );
    }
    Ok(StageLock { _file: file })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_run(root: &Path, id: &str, status: RunStatus, finished: &str) {
        let mut meta = RunMetadata::started(id, "production", "production/cpu");
        meta.created_at_utc = "20260101T000000Z".into();
        meta.status = status;
        meta.finished_at_utc = Some(finished.into());
        write_run_metadata(&root.join(id), &meta).unwrap();
    }

    #[test]
    fn test_run_ids_sort_by_creation() {
        let first = generate_run_id().unwrap();
        let second = generate_run_id().unwrap();
        assert_eq!(first.len(), second.len());
        assert!(first < second);
    }

    #[test]
    fn test_latest_success_ignores_failed_and_running() {
        let temp = TempDir::new().unwrap();
        write_run(temp.path(), "A", RunStatus::Success, "20260101T000100Z");
        write_run(temp.path(), "B", RunStatus::Failed, "20260101T000200Z");
        write_run(temp.path(), "C", RunStatus::Running, "20260101T000300Z");

        assert_eq!(
            latest_successful_run_id(temp.path()).unwrap(),
            Some("A".to_string())
        );
    }

    #[test]
    fn test_prune_keeps_newest_runs() {
        let temp = TempDir::new().unwrap();
        write_run(temp.path(), "A", RunStatus::Success, "20260101T000100Z");
        write_run(temp.path(), "B", RunStatus::Failed, "20260101T000200Z");
        write_run(temp.path(), "C", RunStatus::Success, "20260101T000300Z");

        prune_old_runs(temp.path(), 2).unwrap();

        assert!(!temp.path().join("A").exists());
        assert!(temp.path().join("B").exists());
        assert!(temp.path().join("C").exists());
    }

    #[test]
    fn test_allocate_creates_distinct_dirs() {
        let temp = TempDir::new().unwrap();
        let (a, dir_a) = allocate_run_dir(temp.path()).unwrap();
        let (b, dir_b) = allocate_run_dir(temp.path()).unwrap();
        assert_ne!(a, b);
        assert!(dir_a.is_dir() && dir_b.is_dir());
    }

    #[test]
    fn test_stage_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let held = lock_stage(temp.path()).unwrap();
        assert!(lock_stage(temp.path()).is_err());
        drop(held);
        lock_stage(temp.path()).unwrap();
    }

    #[test]
    fn test_failed_run_records_failure() {
        let mut meta = RunMetadata::started("X", "development", "development/cpu");
        meta.fail("verify:entry-point");
        assert_eq!(meta.status, RunStatus::Failed);
        assert_eq!(meta.failure.as_deref(), Some("verify:entry-point"));
        assert!(meta.finished_at_utc.is_some());
    }
}
