//! File operation handlers: Op::CopyTree and stage snapshots
//!
//! Image paths are absolute (`/app/main.py`); they are resolved under the
//! staging root with [`staged_path`].

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Map an image path onto the staging root.
///
/// Rejects `..` so an op can never write outside the staging root.
pub fn staged_path(staging: &Path, image_path: &str) -> Result<PathBuf> {
    let relative = Path::new(image_path.trim_start_matches('/'));
    for component in relative.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            bail!("image path '{}' escapes the staging root", image_path);
        }
    }
    Ok(staging.join(relative))
}

/// Handle Op::CopyTree: Copy a host directory into the image.
///
/// Entries whose file name is in `exclude` are skipped, as is anything under
/// `staging` itself (the output tree commonly lives inside the source tree).
pub fn handle_copytree(
    staging: &Path,
    source: &Path,
    destination: &str,
    exclude: &[String],
) -> Result<usize> {
    if !source.is_dir() {
        bail!("copy source directory not found: {}", source.display());
    }
    let dst_root = staged_path(staging, destination)?;
    fs::create_dir_all(&dst_root)
        .with_context(|| format!("creating copy destination '{}'", dst_root.display()))?;

    let staging_abs = fs::canonicalize(staging).unwrap_or_else(|_| staging.to_path_buf());
    let mut copied = 0;

    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let excluded = entry
                .file_name()
                .to_str()
                .map(|name| exclude.iter().any(|e| e == name))
                .unwrap_or(false);
            let inside_staging = fs::canonicalize(entry.path())
                .map(|p| p.starts_with(&staging_abs))
                .unwrap_or(false);
            !excluded && !inside_staging
        });

    for entry in walker {
        let entry =
            entry.with_context(|| format!("walking copy source '{}'", source.display()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dst_path = dst_root.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dst_path)
                .with_context(|| format!("creating directory '{}'", dst_path.display()))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("reading link '{}'", entry.path().display()))?;
            if dst_path.is_symlink() || dst_path.exists() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("creating symlink '{}'", dst_path.display()))?;
            copied += 1;
        } else {
            fs::copy(entry.path(), &dst_path).with_context(|| {
                format!(
                    "copying '{}' to '{}'",
                    entry.path().display(),
                    dst_path.display()
                )
            })?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Copy a whole staging tree, preserving symlinks and permissions.
///
/// Used to seed a derived stage from its parent's snapshot.
pub fn copy_snapshot(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst)
            .with_context(|| format!("removing stale snapshot '{}'", dst.display()))?;
    }
    fs::create_dir_all(dst).with_context(|| format!("creating snapshot '{}'", dst.display()))?;

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking snapshot '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dst_path = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dst_path)?;
            let perms = fs::metadata(entry.path())?.permissions();
            fs::set_permissions(&dst_path, perms)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("creating symlink '{}'", dst_path.display()))?;
        } else {
            fs::copy(entry.path(), &dst_path)
                .with_context(|| format!("copying snapshot file '{}'", dst_path.display()))?;
        }
    }
    Ok(())
}

/// Content digest of a tree: relative paths, symlink targets and file bytes,
/// visited in sorted order. Ownership and timestamps are ignored.
pub fn digest_tree(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        let rel = entry.path().strip_prefix(root)?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            hasher.update(b"L");
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            hasher.update(b"F");
            hasher.update(
                fs::read(entry.path())
                    .with_context(|| format!("reading '{}'", entry.path().display()))?,
            );
        } else {
            hasher.update(b"D");
        }
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_dirs() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let staging = temp.path().join("staging");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&staging).unwrap();
        (temp, source, staging)
    }

    #[test]
    fn test_staged_path_rejects_traversal() {
        let staging = Path::new("/tmp/staging");
        assert_eq!(
            staged_path(staging, "/app/logs").unwrap(),
            PathBuf::from("/tmp/staging/app/logs")
        );
        assert!(staged_path(staging, "/app/../../etc").is_err());
    }

    #[test]
    fn test_handle_copytree_skips_excluded_entries() {
        let (_temp, source, staging) = temp_dirs();
        fs::write(source.join("main.py"), "app = object()\n").unwrap();
        fs::create_dir_all(source.join("app/api")).unwrap();
        fs::write(source.join("app/api/health.py"), "").unwrap();
        fs::create_dir_all(source.join(".git")).unwrap();
        fs::write(source.join(".git/HEAD"), "ref").unwrap();

        let copied =
            handle_copytree(&staging, &source, "/app", &[".git".to_string()]).unwrap();

        assert_eq!(copied, 2);
        assert!(staging.join("app/main.py").is_file());
        assert!(staging.join("app/app/api/health.py").is_file());
        assert!(!staging.join("app/.git").exists());
    }

    #[test]
    fn test_handle_copytree_skips_staging_inside_source() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().to_path_buf();
        let staging = source.join("out/rootfs");
        fs::create_dir_all(&staging).unwrap();
        fs::write(source.join("main.py"), "").unwrap();

        handle_copytree(&staging, &source, "/app", &[]).unwrap();

        assert!(staging.join("app/main.py").is_file());
        assert!(!staging.join("app/out/rootfs/app").exists());
    }

    #[test]
    fn test_digest_tree_tracks_content() {
        let (_temp, source, _staging) = temp_dirs();
        fs::write(source.join("main.py"), "app = 1\n").unwrap();
        let first = digest_tree(&source).unwrap();
        assert_eq!(first, digest_tree(&source).unwrap());

        fs::write(source.join("main.py"), "app = 2\n").unwrap();
        assert_ne!(first, digest_tree(&source).unwrap());
    }

    #[test]
    fn test_copy_snapshot_preserves_symlinks() {
        let (temp, source, _staging) = temp_dirs();
        fs::create_dir_all(source.join("usr/bin")).unwrap();
        fs::write(source.join("usr/bin/python3"), "elf").unwrap();
        std::os::unix::fs::symlink("python3", source.join("usr/bin/python")).unwrap();

        let snapshot = temp.path().join("snapshot");
        copy_snapshot(&source, &snapshot).unwrap();

        assert!(snapshot.join("usr/bin/python3").is_file());
        assert_eq!(
            fs::read_link(snapshot.join("usr/bin/python")).unwrap(),
            PathBuf::from("python3")
        );
    }
}
