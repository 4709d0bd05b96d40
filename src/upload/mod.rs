//! Resumable upload engine.
//!
//! Uploads follow a create / probe / append / terminate protocol modeled on
//! tus 1.0. Session state is in memory only and is lost on restart.

pub mod checksum;
pub mod handlers;
pub mod metadata;
pub mod registry;
pub mod store;

use axum::http::HeaderName;
use chrono::Utc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::upload::registry::{SessionHandle, SessionRegistry};
use crate::upload::store::FileWorker;

pub use handlers::{append_upload, create_upload, probe_upload, terminate_upload, upload_options};

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const PROTOCOL_EXTENSIONS: &str = "creation,creation-defer-length,checksum,expiration,termination";

pub const PROTOCOL_RESUMABLE: HeaderName = HeaderName::from_static("protocol-resumable");
pub const PROTOCOL_VERSION_HEADER: HeaderName = HeaderName::from_static("protocol-version");
pub const PROTOCOL_EXTENSION: HeaderName = HeaderName::from_static("protocol-extension");
pub const PROTOCOL_CHECKSUM_ALGORITHM: HeaderName =
    HeaderName::from_static("protocol-checksum-algorithm");
pub const PROTOCOL_MAX_SIZE: HeaderName = HeaderName::from_static("protocol-max-size");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");
pub const UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");

/// Headers a browser client needs to read from upload responses.
pub const EXPOSED_HEADERS: [HeaderName; 9] = [
    axum::http::header::LOCATION,
    PROTOCOL_RESUMABLE,
    PROTOCOL_VERSION_HEADER,
    PROTOCOL_EXTENSION,
    PROTOCOL_CHECKSUM_ALGORITHM,
    UPLOAD_LENGTH,
    UPLOAD_DEFER_LENGTH,
    UPLOAD_OFFSET,
    UPLOAD_EXPIRES,
];

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub session_ttl: Duration,
    pub max_chunk_size: u64,
    /// 0 disables the limit.
    pub max_upload_size: u64,
    pub io_timeout: Duration,
    pub lock_timeout: Duration,
    pub public_url: Option<String>,
}

/// Owns the session registry and the file worker. Shared by the handlers
/// through an `Arc`.
#[derive(Debug)]
pub struct UploadService {
    config: UploadConfig,
    registry: SessionRegistry,
    worker: FileWorker,
}

impl UploadService {
    pub fn new(config: UploadConfig) -> Self {
        let worker = FileWorker::new(config.io_timeout);
        Self {
            config,
            registry: SessionRegistry::new(),
            worker,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn worker(&self) -> &FileWorker {
        &self.worker
    }

    /// Resource location for a session, relative unless a public URL is set.
    pub fn location(&self, id: &Uuid) -> String {
        let base = self
            .config
            .public_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or("");
        format!("{base}/upload/{}", id.simple())
    }

    /// Closes a session that was already removed from the registry and
    /// deletes its backing file. Waits for an in-flight append to finish first;
    /// if that takes longer than the lock timeout the cleanup continues in the
    /// background.
    pub async fn retire(&self, id: Uuid, handle: SessionHandle, reason: &'static str) {
        let worker = self.worker.clone();
        let cleanup = tokio::spawn(async move {
            let mut session = handle.lock_owned().await;
            if session.is_closed() {
                return;
            }
            session.close();
            match worker.remove(&session.file_path).await {
                Ok(()) => info!(upload_id = %id.simple(), reason, "upload file removed"),
                Err(err) => warn!(
                    upload_id = %id.simple(),
                    path = ?session.file_path,
                    error = ?err,
                    "failed to remove upload file"
                ),
            }
        });
        if time::timeout(self.config.lock_timeout, cleanup).await.is_err() {
            debug!(upload_id = %id.simple(), "upload cleanup continues in background");
        }
    }

    /// Removes expired idle sessions and their partial files.
    pub async fn reap_expired(&self) -> usize {
        let expired = self.registry.take_expired(Utc::now()).await;
        let count = expired.len();
        for (id, handle) in expired {
            self.retire(id, handle, "expired").await;
        }
        if count > 0 {
            let remaining = self.registry.len().await;
            info!(count, remaining, "reaped expired uploads");
        }
        count
    }

    /// Drops every in-flight session. Their files stay on disk.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain().await;
        for (_, handle) in &sessions {
            handle.lock().await.close();
        }
        if !sessions.is_empty() {
            warn!(
                count = sessions.len(),
                "dropping in-flight uploads; they cannot be resumed after restart"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::registry::UploadSession;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    pub(crate) fn test_config() -> UploadConfig {
        UploadConfig {
            session_ttl: Duration::from_secs(3600),
            max_chunk_size: 1024 * 1024,
            max_upload_size: 0,
            io_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(2),
            public_url: None,
        }
    }

    #[test]
    fn location_uses_simple_id_and_public_url() {
        let id = Uuid::new_v4();
        let service = UploadService::new(test_config());
        assert_eq!(service.location(&id), format!("/upload/{}", id.simple()));

        let service = UploadService::new(UploadConfig {
            public_url: Some("https://files.example.com/".into()),
            ..test_config()
        });
        assert_eq!(
            service.location(&id),
            format!("https://files.example.com/upload/{}", id.simple())
        );
    }

    #[tokio::test]
    async fn reap_removes_expired_sessions_and_files() {
        let temp = tempdir().expect("tempdir");
        let stale_path = temp.path().join("stale.bin");
        let live_path = temp.path().join("live.bin");
        std::fs::write(&stale_path, b"partial").expect("seed stale");
        std::fs::write(&live_path, b"partial").expect("seed live");

        let service = UploadService::new(test_config());
        let stale = Uuid::new_v4();
        let live = Uuid::new_v4();
        service
            .registry()
            .insert(
                stale,
                UploadSession::new(stale_path.clone(), 10, Utc::now() - ChronoDuration::seconds(1)),
            )
            .await;
        service
            .registry()
            .insert(
                live,
                UploadSession::new(live_path.clone(), 10, Utc::now() + ChronoDuration::hours(1)),
            )
            .await;

        assert_eq!(service.reap_expired().await, 1);
        assert!(service.registry().get(&stale).await.is_none());
        assert!(service.registry().get(&live).await.is_some());
        assert!(!stale_path.exists());
        assert!(live_path.exists());
    }

    #[tokio::test]
    async fn shutdown_drops_sessions_but_keeps_files() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("file.bin");
        std::fs::write(&path, b"partial").expect("seed");

        let service = UploadService::new(test_config());
        let id = Uuid::new_v4();
        service
            .registry()
            .insert(
                id,
                UploadSession::new(path.clone(), 10, Utc::now() + ChronoDuration::hours(1)),
            )
            .await;
        service.shutdown().await;

        assert_eq!(service.registry().len().await, 0);
        assert!(path.exists());
    }
}
