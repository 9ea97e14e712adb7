//! Read-only view of the backup artifacts the service writes.

use crate::error::{HarnessError, Result};
use qbsdiff::Bspatch;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extension of diff artifacts.
pub const DIFF_EXTENSION: &str = "diff";

/// Suffix appended to a data file's path to name its backup directory.
pub const BACKUP_DIR_SUFFIX: &str = ".backups";

/// SHA-256 over some content, used for equality checks only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Full copy; carries the source file's extension
    Snapshot,
    /// Binary diff against a snapshot
    Diff,
    /// Anything else found in the directory
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
}

impl BackupArtifact {
    pub fn read(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| HarnessError::file(&self.path, e))
    }
}

/// Files found under `<data file>.backups`, sorted by path.
#[derive(Debug, Clone)]
pub struct BackupArtifactSet {
    root: PathBuf,
    artifacts: Vec<BackupArtifact>,
}

impl BackupArtifactSet {
    /// Backup directory the service uses for `source`.
    pub fn directory_for(source: &Path) -> PathBuf {
        let mut name = OsString::from(source.as_os_str());
        name.push(BACKUP_DIR_SUFFIX);
        PathBuf::from(name)
    }

    /// Lists the artifacts for `source`, or `None` if no backup directory exists.
    pub fn scan(source: &Path) -> Result<Option<Self>> {
        let root = Self::directory_for(source);
        if !root.is_dir() {
            return Ok(None);
        }

        let snapshot_ext = source.extension();
        let mut artifacts = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                HarnessError::file(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            let kind = match path.extension() {
                Some(ext) if ext == DIFF_EXTENSION => ArtifactKind::Diff,
                ext if ext == snapshot_ext => ArtifactKind::Snapshot,
                _ => ArtifactKind::Other,
            };
            artifacts.push(BackupArtifact { path, kind });
        }

        Ok(Some(Self { root, artifacts }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackupArtifact> {
        self.artifacts.iter()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &BackupArtifact> {
        self.of_kind(ArtifactKind::Snapshot)
    }

    pub fn diffs(&self) -> impl Iterator<Item = &BackupArtifact> {
        self.of_kind(ArtifactKind::Diff)
    }

    fn of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &BackupArtifact> {
        self.artifacts.iter().filter(move |a| a.kind == kind)
    }

    /// Rebuilds the newest state from a chain of one snapshot and one diff.
    pub fn reconstruct_latest(&self) -> Result<Vec<u8>> {
        let snapshot = single(self.snapshots(), "snapshot")?;
        let diff = single(self.diffs(), "diff")?;
        apply_diff(&snapshot.read()?, &diff.read()?)
    }
}

fn single<'a>(
    mut artifacts: impl Iterator<Item = &'a BackupArtifact>,
    what: &str,
) -> Result<&'a BackupArtifact> {
    match (artifacts.next(), artifacts.next()) {
        (Some(artifact), None) => Ok(artifact),
        (None, _) => Err(HarnessError::Assertion(format!("no {what} artifact"))),
        (Some(_), Some(_)) => Err(HarnessError::Assertion(format!("more than one {what} artifact"))),
    }
}

/// Applies a BSDIFF40 patch to `snapshot`.
///
/// The target size in the patch header comes from the service under test, so
/// it only bounds the initial allocation and is checked against the output.
pub fn apply_diff(snapshot: &[u8], diff: &[u8]) -> Result<Vec<u8>> {
    let patcher = Bspatch::new(diff)?;
    let expected = patcher.hint_target_size();
    let capacity = expected.min(snapshot.len() as u64 * 4 + 4096);
    let mut target = Vec::with_capacity(capacity as usize);

    let written = patcher.apply(snapshot, &mut target)?;
    if written != expected {
        return Err(HarnessError::Assertion(format!(
            "diff header announces {expected} bytes, patch produced {written}"
        )));
    }
    Ok(target)
}
