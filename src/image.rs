//! Image artifacts: manifest, content digest and rootfs export.
//!
//! An image is a staging rootfs plus its [`ImageManifest`]. The digest is a
//! sha256 over every manifest input (stage, parent digest, profile, env,
//! identity, runtime and the recorded layers, where copied trees carry their
//! own content hash), so identical inputs give identical digests and any
//! change gives a new one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::executor::users::OwnershipRecord;
use crate::executor::Staging;
use crate::profile::BuildProfile;
use crate::runtime::RuntimeSpec;
use crate::stage_runs::write_json_atomic;
use crate::stages::StageName;

pub const IMAGE_MANIFEST_FILENAME: &str = "image.json";
pub const ROOTFS_DIRNAME: &str = "rootfs";
pub const EXPORT_FILENAME: &str = "rootfs.tar.zst";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub stage: StageName,
    pub parent_digest: Option<String>,
    pub profile: BuildProfile,
    pub base_image: String,
    pub env: BTreeMap<String, String>,
    pub user: String,
    pub workdir: String,
    pub exposed_port: Option<u16>,
    pub runtime: Option<RuntimeSpec>,
    pub layers: Vec<String>,
    pub ownership: Vec<OwnershipRecord>,
    pub digest: String,
}

/// Digest inputs; ownership `applied` flags depend on the builder's euid and
/// are left out.
#[derive(Serialize)]
struct DigestInput<'a> {
    stage: StageName,
    parent_digest: Option<&'a str>,
    profile: &'a BuildProfile,
    base_image: &'a str,
    env: &'a BTreeMap<String, String>,
    user: &'a str,
    workdir: &'a str,
    runtime: Option<&'a RuntimeSpec>,
    layers: &'a [String],
}

impl ImageManifest {
    pub fn from_staging(
        stage: StageName,
        parent_digest: Option<&str>,
        profile: &BuildProfile,
        base_image: &str,
        staging: &Staging,
        runtime: Option<&RuntimeSpec>,
    ) -> Result<Self> {
        let input = DigestInput {
            stage,
            parent_digest,
            profile,
            base_image,
            env: &staging.env,
            user: staging.identity.name(),
            workdir: &staging.workdir,
            runtime,
            layers: &staging.layers,
        };
        let payload = serde_json::to_vec(&input).context("serializing image digest input")?;
        let digest = format!("sha256:{:x}", Sha256::digest(&payload));

        Ok(Self {
            stage,
            parent_digest: parent_digest.map(str::to_string),
            profile: profile.clone(),
            base_image: base_image.to_string(),
            env: staging.env.clone(),
            user: staging.identity.name().to_string(),
            workdir: staging.workdir.clone(),
            exposed_port: runtime.map(|r| r.exposed_port),
            runtime: runtime.cloned(),
            layers: staging.layers.clone(),
            ownership: staging.ownership.clone(),
            digest,
        })
    }

    pub fn short_digest(&self) -> &str {
        let hex = self.digest.trim_start_matches("sha256:");
        &hex[..hex.len().min(12)]
    }

    pub fn write(&self, run_dir: &Path) -> Result<PathBuf> {
        let path = run_dir.join(IMAGE_MANIFEST_FILENAME);
        write_json_atomic(&path, self)
            .with_context(|| format!("writing image manifest '{}'", path.display()))?;
        Ok(path)
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(IMAGE_MANIFEST_FILENAME);
        let bytes =
            fs::read(&path).with_context(|| format!("reading image manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing image manifest '{}'", path.display()))
    }
}

/// A finished stage image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub rootfs: PathBuf,
    pub manifest: ImageManifest,
}

/// Pack `rootfs` into a deterministic `tar.zst`.
///
/// Entries are sorted, mtimes zeroed and ownership taken from `ownership`
/// (the innermost matching record wins), defaulting to root.
pub fn export_rootfs(rootfs: &Path, out_path: &Path, ownership: &[OwnershipRecord]) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("creating export archive '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(rootfs).follow_links(false) {
        let ent = ent.with_context(|| format!("walking rootfs '{}'", rootfs.display()))?;
        if ent.path() == rootfs {
            continue;
        }
        entries.push(ent.path().to_path_buf());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(rootfs).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(rootfs).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(rootfs)
            .unwrap_or(&p)
            .to_string_lossy()
            .into_owned();
        let (uid, gid) = owner_for(&rel, ownership);
        let md = fs::symlink_metadata(&p)?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(uid.into());
        header.set_gid(gid.into());
        {
            use std::os::unix::fs::PermissionsExt;
            header.set_mode(md.permissions().mode());
        }

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, &rel, &mut f)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("finalizing tar builder")?;
    encoder.finish()?;
    Ok(())
}

fn owner_for(rel: &str, ownership: &[OwnershipRecord]) -> (u32, u32) {
    ownership
        .iter()
        .filter(|record| {
            let root = record.path.trim_matches('/');
            root.is_empty() || rel == root || rel.starts_with(&format!("{root}/"))
        })
        .max_by_key(|record| record.path.trim_matches('/').len())
        .map(|record| (record.uid, record.gid))
        .unwrap_or((0, 0))
}
