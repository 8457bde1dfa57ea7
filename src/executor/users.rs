//! Identity operation handlers: Op::User, Op::Group, Op::Chown
//!
//! Users and groups are written straight into the staging root's
//! `etc/passwd` and `etc/group`, so the image gains its app identity without
//! running `useradd` inside it.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use super::files::staged_path;

/// Read a user's UID/GID from the staging passwd file.
///
/// Returns:
/// - Ok(Some((uid, gid))) if user found
/// - Ok(None) if user not found or file doesn't exist
/// - Err if file exists but is corrupted/unreadable
pub fn read_uid(staging: &Path, username: &str) -> Result<Option<(u32, u32)>> {
    let passwd_path = staging.join("etc/passwd");
    if !passwd_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&passwd_path)
        .with_context(|| format!("reading passwd file at {}", passwd_path.display()))?;

    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 4 && parts[0] == username {
            let uid: u32 = parts[2].parse().with_context(|| {
                format!(
                    "corrupted passwd file: invalid UID '{}' for user '{}' at {}",
                    parts[2],
                    username,
                    passwd_path.display()
                )
            })?;
            let gid: u32 = parts[3].parse().with_context(|| {
                format!(
                    "corrupted passwd file: invalid GID '{}' for user '{}' at {}",
                    parts[3],
                    username,
                    passwd_path.display()
                )
            })?;
            return Ok(Some((uid, gid)));
        }
    }
    Ok(None)
}

/// Read a group's GID from the staging group file.
pub fn read_gid(staging: &Path, groupname: &str) -> Result<Option<u32>> {
    let group_path = staging.join("etc/group");
    if !group_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&group_path)
        .with_context(|| format!("reading group file at {}", group_path.display()))?;

    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == groupname {
            let gid: u32 = parts[2].parse().with_context(|| {
                format!(
                    "corrupted group file: invalid GID '{}' for group '{}' at {}",
                    parts[2],
                    groupname,
                    group_path.display()
                )
            })?;
            return Ok(Some(gid));
        }
    }
    Ok(None)
}

/// Handle Op::User: ensure a passwd entry and a home directory exist.
///
/// An existing entry wins over the requested ids, so re-running a stage keeps
/// ownership stable.
pub fn ensure_user(
    staging: &Path,
    username: &str,
    uid: u32,
    gid: u32,
    home: &str,
    shell: &str,
) -> Result<(u32, u32)> {
    if uid == 0 {
        bail!("refusing to create '{}' with UID 0", username);
    }
    if let Some(existing) = read_uid(staging, username)? {
        return Ok(existing);
    }

    let passwd_path = staging.join("etc/passwd");
    fs::create_dir_all(staging.join("etc"))
        .with_context(|| format!("creating etc under {}", staging.display()))?;
    let mut passwd = if passwd_path.exists() {
        fs::read_to_string(&passwd_path)
            .with_context(|| format!("reading passwd file at {}", passwd_path.display()))?
    } else {
        String::new()
    };
    if !passwd.is_empty() && !passwd.ends_with('\n') {
        passwd.push('\n');
    }
    passwd.push_str(&format!(
        "{}:x:{}:{}:{}:{}:{}\n",
        username, uid, gid, username, home, shell
    ));
    fs::write(&passwd_path, passwd)
        .with_context(|| format!("writing passwd for user {}", username))?;

    let home_dir = staged_path(staging, home)?;
    fs::create_dir_all(&home_dir)
        .with_context(|| format!("creating home directory '{}'", home_dir.display()))?;
    Ok((uid, gid))
}

/// Handle Op::Group: ensure a group entry exists.
pub fn ensure_group(staging: &Path, groupname: &str, gid: u32) -> Result<u32> {
    if let Some(existing) = read_gid(staging, groupname)? {
        return Ok(existing);
    }

    let group_path = staging.join("etc/group");
    fs::create_dir_all(staging.join("etc"))
        .with_context(|| format!("creating etc under {}", staging.display()))?;
    let mut group = if group_path.exists() {
        fs::read_to_string(&group_path)
            .with_context(|| format!("reading group file at {}", group_path.display()))?
    } else {
        String::new()
    };
    if !group.is_empty() && !group.ends_with('\n') {
        group.push('\n');
    }
    group.push_str(&format!("{}:x:{}:\n", groupname, gid));
    fs::write(&group_path, group)
        .with_context(|| format!("writing group for {}", groupname))?;
    Ok(gid)
}

/// Ownership assignment recorded for a tree.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OwnershipRecord {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    /// Whether ownership was applied on disk (requires running as root).
    pub applied: bool,
}

/// Handle Op::Chown: hand a tree to a user/group defined in the staging root.
///
/// When the builder runs unprivileged the assignment is only recorded; the
/// image manifest carries it so a packer can apply it.
pub fn handle_chown(
    staging: &Path,
    path: &str,
    user: &str,
    group: &str,
) -> Result<OwnershipRecord> {
    let (uid, _) = read_uid(staging, user)?.ok_or_else(|| {
        anyhow::anyhow!("chown: user '{}' is not defined in the image", user)
    })?;
    let gid = read_gid(staging, group)?.ok_or_else(|| {
        anyhow::anyhow!("chown: group '{}' is not defined in the image", group)
    })?;
    let target = staged_path(staging, path)?;
    if !target.exists() {
        bail!("chown target '{}' does not exist", target.display());
    }

    let applied = running_as_root();
    if applied {
        for entry in WalkDir::new(&target).follow_links(false) {
            let entry =
                entry.with_context(|| format!("walking chown target '{}'", target.display()))?;
            std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))
                .with_context(|| format!("changing owner of '{}'", entry.path().display()))?;
        }
    }

    Ok(OwnershipRecord {
        path: path.to_string(),
        uid,
        gid,
        applied,
    })
}

pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_staging() -> (TempDir, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        fs::create_dir_all(staging.join("etc")).unwrap();
        (temp, staging)
    }

    #[test]
    fn test_read_uid() {
        let (_temp, staging) = temp_staging();
        fs::write(
            staging.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nappuser:x:1000:1000::/home/appuser:/bin/bash\n",
        )
        .unwrap();

        assert_eq!(read_uid(&staging, "root").unwrap(), Some((0, 0)));
        assert_eq!(read_uid(&staging, "appuser").unwrap(), Some((1000, 1000)));
        assert_eq!(read_uid(&staging, "nobody").unwrap(), None);
    }

    #[test]
    fn test_read_uid_corrupted() {
        let (_temp, staging) = temp_staging();
        fs::write(staging.join("etc/passwd"), "appuser:x:abc:1000::/:/bin/sh\n").unwrap();

        assert!(read_uid(&staging, "appuser").is_err());
    }

    #[test]
    fn test_ensure_user_creates_entry_and_home() {
        let (_temp, staging) = temp_staging();

        let ids = ensure_user(&staging, "appuser", 1000, 1000, "/home/appuser", "/bin/bash")
            .unwrap();

        assert_eq!(ids, (1000, 1000));
        let passwd = fs::read_to_string(staging.join("etc/passwd")).unwrap();
        assert!(passwd.contains("appuser:x:1000:1000:appuser:/home/appuser:/bin/bash"));
        assert!(staging.join("home/appuser").is_dir());
    }

    #[test]
    fn test_ensure_user_idempotent_and_keeps_existing_ids() {
        let (_temp, staging) = temp_staging();
        fs::write(
            staging.join("etc/passwd"),
            "appuser:x:1234:5678::/home/appuser:/bin/sh",
        )
        .unwrap();

        let ids = ensure_user(&staging, "appuser", 1000, 1000, "/home/appuser", "/bin/bash")
            .unwrap();
        ensure_user(&staging, "appuser", 1000, 1000, "/home/appuser", "/bin/bash").unwrap();

        assert_eq!(ids, (1234, 5678));
        let passwd = fs::read_to_string(staging.join("etc/passwd")).unwrap();
        let entries = passwd
            .lines()
            .filter(|line| line.starts_with("appuser:"))
            .count();
        assert_eq!(entries, 1, "should only have one passwd entry for appuser");
    }

    #[test]
    fn test_ensure_user_rejects_uid_zero() {
        let (_temp, staging) = temp_staging();
        assert!(ensure_user(&staging, "toor", 0, 0, "/root", "/bin/sh").is_err());
    }

    #[test]
    fn test_ensure_group_creates_entry() {
        let (_temp, staging) = temp_staging();

        ensure_group(&staging, "appuser", 1000).unwrap();

        let group = fs::read_to_string(staging.join("etc/group")).unwrap();
        assert!(group.contains("appuser:x:1000:"));
        assert_eq!(read_gid(&staging, "appuser").unwrap(), Some(1000));
    }

    #[test]
    fn test_handle_chown_records_ownership() {
        let (_temp, staging) = temp_staging();
        fs::create_dir_all(staging.join("app/logs")).unwrap();
        ensure_group(&staging, "appuser", 1000).unwrap();
        ensure_user(&staging, "appuser", 1000, 1000, "/home/appuser", "/bin/bash").unwrap();

        let record = handle_chown(&staging, "/app", "appuser", "appuser").unwrap();

        assert_eq!(record.path, "/app");
        assert_eq!((record.uid, record.gid), (1000, 1000));
        assert_eq!(record.applied, running_as_root());
    }

    #[test]
    fn test_handle_chown_requires_known_user() {
        let (_temp, staging) = temp_staging();
        fs::create_dir_all(staging.join("app")).unwrap();

        let err = handle_chown(&staging, "/app", "ghost", "ghost").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_running_as_root_follows_effective_uid() {
        let status = fs::read_to_string("/proc/self/status").unwrap();
        let euid = status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|ids| ids.split_whitespace().nth(1))
            .unwrap();
        assert_eq!(running_as_root(), euid == "0");
    }
}
