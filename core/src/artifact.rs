//! Temp-artifact layout for in-flight downloads.
//!
//! A transfer for `dest` writes into `dest.part` in the same directory and
//! keeps its resume validators in `dest.part.json`. Only a completed,
//! verified `.part` is renamed onto `dest`, so the final name never points
//! at a half-written file.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

pub const PART_SUFFIX: &str = ".part";
pub const META_SUFFIX: &str = ".part.json";
const TMP_SUFFIX: &str = ".tmp";

/// What the remote looked like when the partial bytes were fetched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeMeta {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub total_bytes: Option<u64>,
}

impl ResumeMeta {
    pub fn validator(&self) -> Option<String> {
        self.etag.clone().or_else(|| self.last_modified.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub dest: PathBuf,
    pub part: PathBuf,
    pub meta: PathBuf,
}

impl Artifact {
    pub fn for_dest(dest: &Path) -> Self {
        Self {
            dest: dest.to_path_buf(),
            part: with_suffix(dest, PART_SUFFIX),
            meta: with_suffix(dest, META_SUFFIX),
        }
    }

    pub fn partial_len(&self) -> Option<u64> {
        fs::metadata(&self.part).ok().map(|meta| meta.len())
    }

    pub fn load_meta(&self) -> Option<ResumeMeta> {
        let raw = fs::read(&self.meta).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!("unreadable resume metadata {}: {}", self.meta.display(), err);
                None
            }
        }
    }

    pub fn save_meta(&self, meta: &ResumeMeta) -> CoreResult<()> {
        let raw = serde_json::to_vec(meta).map_err(|err| CoreError::Disk(err.to_string()))?;
        write_atomic(&self.meta, &raw)
    }

    /// Removes the partial file and its sidecar. Missing files are fine.
    pub fn discard(&self) -> CoreResult<()> {
        remove_if_exists(&self.part)?;
        remove_if_exists(&self.meta)?;
        remove_if_exists(&with_suffix(&self.meta, TMP_SUFFIX))
    }

    /// Atomically moves the completed partial file onto the destination.
    pub fn promote(&self) -> CoreResult<()> {
        fs::rename(&self.part, &self.dest).map_err(|err| {
            CoreError::Disk(format!(
                "rename {} -> {}: {}",
                self.part.display(),
                self.dest.display(),
                err
            ))
        })?;
        remove_if_exists(&self.meta)
    }

    pub fn exists(&self) -> bool {
        self.part.exists() || self.meta.exists()
    }
}

/// Write-then-rename so readers see either the old file or the whole new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let tmp = with_suffix(path, TMP_SUFFIX);
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    result.map_err(|err| {
        let _ = fs::remove_file(&tmp);
        CoreError::Disk(format!("{}: {}", path.display(), err))
    })
}

pub fn remove_if_exists(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CoreError::Disk(format!("{}: {}", path.display(), err))),
    }
}

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Destination a temp artifact belongs to, if `path` is one.
pub fn artifact_owner(path: &Path) -> Option<PathBuf> {
    let name = path.to_str()?;
    for suffix in [META_SUFFIX, PART_SUFFIX] {
        if let Some(dest) = name.strip_suffix(suffix) {
            return Some(PathBuf::from(dest));
        }
    }
    let tmp = name.strip_suffix(TMP_SUFFIX)?;
    tmp.strip_suffix(META_SUFFIX).map(PathBuf::from)
}

/// Deletes temp artifacts under `root` whose destination is not in `keep`,
/// and sidecars whose partial file has vanished. A `.part` with no sidecar
/// next to it was not written by a transfer and is left alone. Returns the
/// number of files removed.
pub fn sweep_stale(root: &Path, keep: &HashSet<PathBuf>) -> CoreResult<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0usize;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|err| CoreError::Disk(err.to_string()))?;
        let mut doomed = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if is_stale(&path, keep) {
                doomed.push(path);
            }
        }
        // Decided before deleting, so removing a sidecar cannot change the
        // verdict on its partial file.
        for path in doomed {
            debug!("removing stale artifact {}", path.display());
            remove_if_exists(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_stale(path: &Path, keep: &HashSet<PathBuf>) -> bool {
    let Some(owner) = artifact_owner(path) else {
        return false;
    };
    let kept = keep.contains(&owner);
    let name = path.to_string_lossy();
    if name.ends_with(META_SUFFIX) {
        !kept || !with_suffix(&owner, PART_SUFFIX).exists()
    } else if name.ends_with(PART_SUFFIX) {
        !kept && with_suffix(&owner, META_SUFFIX).exists()
    } else {
        !kept
    }
}

/// Free bytes on the volume that holds `path`, or `None` when no mounted
/// disk matches.
pub fn available_space(path: &Path) -> Option<u64> {
    let mut target = path.to_path_buf();
    while !target.exists() {
        if !target.pop() {
            return None;
        }
    }
    let target = fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let depth = mount.as_os_str().len();
            match best {
                Some((best_depth, _)) if best_depth >= depth => {}
                _ => best = Some((depth, disk.available_space())),
            }
        }
    }
    best.map(|(_, available)| available)
}
