//! Volume discovery and path confinement.
//!
//! A volume is a named root directory. Roots come from `--volume name=path`
//! and, when filesystem types are configured, from mount points listed in
//! `/proc/mounts`. Every client path is joined onto a root through
//! [`join_checked`], which refuses to leave it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::ErrorKind;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const MOUNTS_FILE: &str = "/proc/mounts";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub root: PathBuf,
}

impl FromStr for VolumeSpec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, root) = value
            .split_once('=')
            .ok_or_else(|| format!("volume must be name=path, got {value:?}"))?;
        let name = name.trim();
        let root = root.trim();
        if name.is_empty() || root.is_empty() {
            return Err(format!("volume must be name=path, got {value:?}"));
        }
        if name.contains(['/', '\\']) {
            return Err(format!("volume name {name:?} cannot contain separators"));
        }
        Ok(Self {
            name: name.to_string(),
            root: PathBuf::from(root),
        })
    }
}

#[derive(Debug)]
pub enum VolumeError {
    UnknownVolume(String),
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for VolumeError {
    fn from(err: io::Error) -> Self {
        VolumeError::Io(err)
    }
}

/// Disk usage of one volume, as reported by `GET /info`.
#[derive(Debug, Serialize)]
pub struct SpaceReport {
    pub path: String,
    pub volume_label: String,
    pub available_free_space: u64,
    pub total_free_space: u64,
    pub total_size: u64,
}

#[derive(Debug)]
pub struct VolumeRegistry {
    configured: BTreeMap<String, PathBuf>,
    mount_fs_types: Vec<String>,
    mounts_file: PathBuf,
    discovered: RwLock<BTreeMap<String, PathBuf>>,
}

impl VolumeRegistry {
    pub fn new(configured: Vec<VolumeSpec>, mount_fs_types: Vec<String>) -> Self {
        Self::with_mounts_file(configured, mount_fs_types, PathBuf::from(MOUNTS_FILE))
    }

    pub fn with_mounts_file(
        configured: Vec<VolumeSpec>,
        mount_fs_types: Vec<String>,
        mounts_file: PathBuf,
    ) -> Self {
        let configured = configured
            .into_iter()
            .map(|spec| (spec.name, spec.root))
            .collect();
        Self {
            configured,
            mount_fs_types,
            mounts_file,
            discovered: RwLock::new(BTreeMap::new()),
        }
    }

    /// Re-reads the mount table. Does nothing when no filesystem types are
    /// configured. Returns the number of discovered volumes.
    pub async fn refresh(&self) -> usize {
        if self.mount_fs_types.is_empty() {
            return 0;
        }
        let contents = match fs::read_to_string(&self.mounts_file).await {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = ?self.mounts_file, error = %err, "failed to read mount table");
                return self.discovered.read().await.len();
            }
        };
        let mounts: BTreeMap<String, PathBuf> = parse_mounts(&contents, &self.mount_fs_types)
            .into_iter()
            .filter(|(label, _)| !self.configured.contains_key(label))
            .collect();
        let count = mounts.len();
        let mut discovered = self.discovered.write().await;
        if discovered.len() != count {
            debug!(count, "mounted volumes changed");
        }
        *discovered = mounts;
        count
    }

    /// Root directory of the volume called `label`.
    pub async fn resolve(&self, label: &str) -> Result<PathBuf, VolumeError> {
        if let Some(root) = self.lookup(label).await {
            return Ok(root);
        }
        self.refresh().await;
        self.lookup(label)
            .await
            .ok_or_else(|| VolumeError::UnknownVolume(label.to_string()))
    }

    /// All known volumes, configured ones first.
    pub async fn list(&self) -> Vec<(String, PathBuf)> {
        self.refresh().await;
        let discovered = self.discovered.read().await;
        self.configured
            .iter()
            .chain(discovered.iter())
            .map(|(label, root)| (label.clone(), root.clone()))
            .collect()
    }

    async fn lookup(&self, label: &str) -> Option<PathBuf> {
        if let Some(root) = self.configured.get(label) {
            return Some(root.clone());
        }
        self.discovered.read().await.get(label).cloned()
    }
}

/// Joins a client supplied relative path onto `root`.
///
/// Leading separators are ignored. `..`, absolute and prefix components are
/// rejected, as is any existing component that is a symlink or a non-directory
/// in the middle of the path. With `allow_missing` the tail of the path may not
/// exist yet.
pub async fn join_checked(
    root: &Path,
    relative: &str,
    allow_missing: bool,
) -> Result<PathBuf, VolumeError> {
    let mut normalized = PathBuf::new();
    let trimmed = relative.trim_start_matches(['/', '\\']);
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(VolumeError::InvalidPath);
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Ok(root.to_path_buf());
    }

    let mut current = root.to_path_buf();
    let mut components = normalized.components().peekable();
    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(VolumeError::InvalidPath);
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(VolumeError::InvalidPath);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound && allow_missing => break,
            Err(err) => return Err(VolumeError::Io(err)),
        }
    }

    Ok(root.join(normalized))
}

/// Disk space of the filesystem holding `root`.
pub fn space_report(label: &str, root: &Path) -> io::Result<SpaceReport> {
    Ok(SpaceReport {
        path: root.to_string_lossy().into_owned(),
        volume_label: label.to_string(),
        available_free_space: fs2::available_space(root)?,
        total_free_space: fs2::free_space(root)?,
        total_size: fs2::total_space(root)?,
    })
}

/// Extracts `(label, mount point)` pairs for the given filesystem types from
/// a `/proc/mounts` style table.
pub fn parse_mounts(contents: &str, fs_types: &[String]) -> Vec<(String, PathBuf)> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = unescape_mount_field(fields.next()?);
            let fs_type = fields.next()?;
            if !fs_types.iter().any(|wanted| wanted == fs_type) {
                return None;
            }
            let path = PathBuf::from(mount_point);
            let label = path.file_name()?.to_string_lossy().into_owned();
            Some((label, path))
        })
        .collect()
}

/// The kernel writes space, tab, newline and backslash in mount points as
/// three digit octal escapes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\'
            && let Some(digits) = field.get(index + 1..index + 4)
            && digits.bytes().all(|digit| (b'0'..=b'7').contains(&digit))
            && let Ok(value) = u8::from_str_radix(digits, 8)
        {
            out.push(value);
            index += 4;
            continue;
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
