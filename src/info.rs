//! Volume capacity report.

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use std::sync::Arc;
use tokio::task;
use tracing::warn;

use crate::error::ApiError;
use crate::volumes::{SpaceReport, VolumeRegistry, space_report};

/// Returns free and total space for every known volume. Volumes whose
/// statistics cannot be read are left out.
pub async fn get_info(
    Extension(volumes): Extension<Arc<VolumeRegistry>>,
) -> Result<JsonResponse<Vec<SpaceReport>>, ApiError> {
    let known = volumes.list().await;
    let reports = task::spawn_blocking(move || {
        known
            .into_iter()
            .filter_map(|(label, root)| match space_report(&label, &root) {
                Ok(report) => Some(report),
                Err(err) => {
                    warn!(volume = label, path = ?root, error = %err, "failed to read volume space");
                    None
                }
            })
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(JsonResponse(reports))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volumes::VolumeSpec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reports_readable_volumes_only() {
        let temp = tempdir().expect("tempdir");
        let volumes = Arc::new(VolumeRegistry::new(
            vec![
                VolumeSpec {
                    name: "data".into(),
                    root: temp.path().to_path_buf(),
                },
                VolumeSpec {
                    name: "gone".into(),
                    root: temp.path().join("does-not-exist"),
                },
            ],
            Vec::new(),
        ));

        let JsonResponse(reports) = get_info(Extension(volumes)).await.expect("info");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].volume_label, "data");
        assert!(reports[0].total_size > 0);
    }
}
