//! 过期令牌清理与过期上传清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::{AuthState, prune_expired_tokens};
use crate::config::TOKEN_PRUNE_INTERVAL_SECS;
use crate::upload::UploadService;

/// 启动后台任务。`upload_reap_interval` 为零时不清理过期上传。
pub fn spawn_background_tasks(
    auth: Arc<AuthState>,
    uploads: Arc<UploadService>,
    upload_reap_interval: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(TOKEN_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match prune_expired_tokens(&auth).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "pruned expired tokens"),
                Err(err) => warn!(error = %err, "failed to prune expired tokens"),
            }
        }
    });

    if upload_reap_interval.is_zero() {
        debug!("expired upload sweep disabled");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(upload_reap_interval);
        loop {
            interval.tick().await;
            uploads.reap_expired().await;
        }
    });
}
