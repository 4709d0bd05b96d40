//! Directory listing inside a volume.

use axum::extract::{Extension, Path, Query};
use axum::response::Json as JsonResponse;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

use crate::error::ApiError;
use crate::http::parse_bool_flag;
use crate::volumes::{VolumeRegistry, join_checked};

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    folder: Option<String>,
    hidden: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EntryInfo {
    pub name: String,
    /// Unix mode bits.
    pub attributes: u32,
    pub extension: String,
    pub created: Option<String>,
    pub accessed: Option<String>,
    pub modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

#[derive(Debug, Default, Serialize)]
pub struct FolderListing {
    pub directories: Vec<EntryInfo>,
    pub files: Vec<EntryInfo>,
}

/// Lists the directories and files of one folder.
pub async fn list_folder(
    Path(volume): Path<String>,
    Query(query): Query<ListQuery>,
    Extension(volumes): Extension<Arc<VolumeRegistry>>,
) -> Result<JsonResponse<FolderListing>, ApiError> {
    let show_hidden = match query.hidden.as_deref() {
        None | Some("") => false,
        Some(value) => parse_bool_flag(value)
            .ok_or_else(|| ApiError::BadRequest("hidden must be a boolean".into()))?,
    };
    let folder = query.folder.as_deref().unwrap_or("");
    let root = volumes.resolve(&volume).await?;
    let target = join_checked(&root, folder, false).await?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(crate::volumes::VolumeError::from)?;
    if !metadata.is_dir() {
        return Err(ApiError::BadRequest("folder is not a directory".into()));
    }

    let mut listing = FolderListing::default();
    let mut dir = fs::read_dir(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') && !show_hidden {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // Entry vanished between read_dir and stat.
            Err(_) => continue,
        };
        if metadata.is_dir() {
            listing.directories.push(entry_info(name, &metadata, None));
        } else {
            let length = metadata.len();
            listing.files.push(entry_info(name, &metadata, Some(length)));
        }
    }

    listing
        .directories
        .sort_by_key(|entry| entry.name.to_lowercase());
    listing.files.sort_by_key(|entry| entry.name.to_lowercase());
    info!(
        volume,
        folder,
        directories = listing.directories.len(),
        files = listing.files.len(),
        "list folder"
    );
    Ok(JsonResponse(listing))
}

fn entry_info(name: String, metadata: &Metadata, length: Option<u64>) -> EntryInfo {
    let times = entry_times(metadata);
    EntryInfo {
        extension: extension_of(&name).to_string(),
        name,
        attributes: mode_bits(metadata),
        created: times.0,
        accessed: times.1,
        modified: times.2,
        length,
    }
}

/// Everything from the last dot, dot included.
fn extension_of(name: &str) -> &str {
    name.rfind('.').map(|index| &name[index..]).unwrap_or("")
}

#[cfg(unix)]
fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn mode_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() { 0o444 } else { 0o644 }
}

type EntryTimes = (Option<String>, Option<String>, Option<String>);

/// Status change, access and modification times. On unix "created" is the
/// inode change time.
#[cfg(unix)]
fn entry_times(metadata: &Metadata) -> EntryTimes {
    use std::os::unix::fs::MetadataExt;
    (
        format_unix(metadata.ctime(), metadata.ctime_nsec()),
        format_unix(metadata.atime(), metadata.atime_nsec()),
        format_unix(metadata.mtime(), metadata.mtime_nsec()),
    )
}

#[cfg(not(unix))]
fn entry_times(metadata: &Metadata) -> EntryTimes {
    let format = |time: std::io::Result<std::time::SystemTime>| {
        time.ok()
            .map(|time| DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true))
    };
    (
        format(metadata.created()),
        format(metadata.accessed()),
        format(metadata.modified()),
    )
}

#[cfg(unix)]
fn format_unix(secs: i64, nanos: i64) -> Option<String> {
    let nanos = u32::try_from(nanos).ok()?;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
}
