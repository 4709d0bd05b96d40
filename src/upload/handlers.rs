//! Upload protocol handlers: create, probe, append, terminate and options.

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::http::parse_bool_flag;
use crate::upload::checksum::{SUPPORTED_ALGORITHMS, parse_checksum_header, verify_checksum};
use crate::upload::metadata::{decode_filename, parse_metadata};
use crate::upload::registry::{LockError, UploadSession};
use crate::upload::{
    PROTOCOL_CHECKSUM_ALGORITHM, PROTOCOL_EXTENSION, PROTOCOL_EXTENSIONS, PROTOCOL_MAX_SIZE,
    PROTOCOL_RESUMABLE, PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, UPLOAD_CHECKSUM,
    UPLOAD_DEFER_LENGTH, UPLOAD_EXPIRES, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
    UploadService,
};
use crate::volumes::{VolumeRegistry, join_checked};

#[derive(Deserialize)]
pub(crate) struct CreateUploadQuery {
    overwrite: Option<String>,
}

/// How a request states the total upload length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LengthDirective {
    Deferred,
    Known(u64),
}

/// Validated intent of one append, computed against a session state.
#[derive(Clone, Copy, Debug)]
struct AppendPlan {
    offset: u64,
    /// Total length after this append, `None` while still deferred.
    declared_size: Option<u64>,
}

/// Creates an upload session and its preallocated backing file.
pub async fn create_upload(
    Path(volume): Path<String>,
    Query(query): Query<CreateUploadQuery>,
    headers: HeaderMap,
    Extension(volumes): Extension<Arc<VolumeRegistry>>,
    Extension(uploads): Extension<Arc<UploadService>>,
) -> Result<Response, ApiError> {
    require_protocol_version(&headers)?;
    let overwrite = match query.overwrite.as_deref() {
        None | Some("") => false,
        Some(value) => parse_bool_flag(value)
            .ok_or_else(|| ApiError::BadRequest("overwrite must be a boolean".into()))?,
    };

    let metadata = parse_metadata(header_str(&headers, &UPLOAD_METADATA)?.unwrap_or(""));
    let relative = decode_filename(&metadata)?;
    let root = volumes.resolve(&volume).await?;
    let file_path = join_checked(&root, &relative, true).await?;
    if file_path == root {
        return Err(ApiError::BadRequest("filename must name a file".into()));
    }

    let declared_size = match parse_length_directive(&headers)? {
        Some(LengthDirective::Deferred) => 0,
        Some(LengthDirective::Known(size)) => size,
        None => {
            return Err(ApiError::BadRequest(
                "Upload-Length or Upload-Defer-Length is required".into(),
            ));
        }
    };
    check_max_size(&uploads, declared_size)?;

    uploads
        .worker()
        .create_and_preallocate(&file_path, !overwrite, declared_size)
        .await?;

    let id = Uuid::new_v4();
    let expires_at = Utc::now() + uploads.config().session_ttl;
    uploads
        .registry()
        .insert(
            id,
            UploadSession::new(file_path.clone(), declared_size, expires_at),
        )
        .await;
    info!(
        upload_id = %id.simple(),
        volume,
        path = ?file_path,
        declared_size,
        overwrite,
        "upload created"
    );

    let mut response_headers = resumable_headers();
    response_headers.insert(header::LOCATION, header_value(&uploads.location(&id))?);
    response_headers.insert(UPLOAD_EXPIRES, header_value(&format_expiry(expires_at))?);
    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// Reports the current offset of an upload. Waits out a chunk write in
/// progress, up to the file operation timeout.
pub async fn probe_upload(
    Path(id): Path<String>,
    Extension(uploads): Extension<Arc<UploadService>>,
) -> Result<Response, ApiError> {
    let id = parse_upload_id(&id)?;
    let config = uploads.config();
    let session = uploads
        .registry()
        .snapshot(&id, config.lock_timeout.max(config.io_timeout))
        .await
        .map_err(|error| match error {
            LockError::NotFound => ApiError::BadRequest("upload not found".into()),
            LockError::Busy => ApiError::Unavailable("upload is busy".into()),
        })?;

    let mut response_headers = session_headers(&session)?;
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if session.is_length_deferred() {
        response_headers.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1"));
    } else {
        response_headers.insert(
            UPLOAD_LENGTH,
            header_value(&session.declared_size.to_string())?,
        );
    }
    Ok((StatusCode::OK, response_headers).into_response())
}

/// Appends one chunk at the offset the client asserts.
///
/// Headers are validated against a snapshot before the body is read, so a
/// stale offset is rejected without consuming the chunk. The authoritative
/// check, the write and the offset update then run under the session lock.
pub async fn append_upload(
    Path(id): Path<String>,
    headers: HeaderMap,
    Extension(uploads): Extension<Arc<UploadService>>,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let id = parse_upload_id(&id)?;
    let config = uploads.config();
    let snapshot = uploads
        .registry()
        .snapshot(&id, config.lock_timeout)
        .await
        .map_err(session_lock_error)?;
    let plan = plan_append(&snapshot, &headers)?;
    check_max_size(&uploads, plan.declared_size.unwrap_or(0))?;

    let content_length = parse_content_length(&headers)?;
    let remaining = match plan.declared_size {
        Some(size) => size - plan.offset,
        None if config.max_upload_size > 0 => config.max_upload_size.saturating_sub(plan.offset),
        None => u64::MAX,
    };
    let limit = config.max_chunk_size.min(remaining);
    if content_length.is_some_and(|length| length > limit) {
        return Err(ApiError::BadRequest("chunk exceeds the allowed length".into()));
    }
    let chunk = read_chunk(body, content_length, limit).await?;

    if !chunk.is_empty()
        && let Some(value) = header_str(&headers, &UPLOAD_CHECKSUM)?
    {
        let (algorithm, digest) = parse_checksum_header(value)
            .ok_or_else(|| ApiError::BadRequest("invalid Upload-Checksum".into()))?;
        if !verify_checksum(&chunk, algorithm, digest) {
            warn!(upload_id = %id.simple(), algorithm, "chunk checksum mismatch");
            return Err(ApiError::BadRequest("checksum mismatch".into()));
        }
    }

    let session = uploads
        .registry()
        .acquire(&id, config.lock_timeout)
        .await
        .map_err(session_lock_error)?;
    let plan = plan_append(&session, &headers)?;
    let chunk_len = chunk.len() as u64;
    if plan
        .declared_size
        .is_some_and(|size| plan.offset + chunk_len > size)
    {
        return Err(ApiError::BadRequest("chunk exceeds Upload-Length".into()));
    }

    // The write job owns the lock until it stops, even past a timeout.
    let mut session = if chunk_len > 0 {
        let file_path = session.file_path.clone();
        uploads
            .worker()
            .write_at(&file_path, chunk, plan.offset, session)
            .await?
    } else {
        session
    };
    session.offset = plan.offset + chunk_len;
    if let Some(size) = plan.declared_size {
        session.declared_size = size;
    }
    debug!(
        upload_id = %id.simple(),
        offset = session.offset,
        bytes = chunk_len,
        "upload chunk accepted"
    );

    let response_headers = session_headers(&session)?;
    if session.is_complete() {
        session.close();
        uploads.registry().remove(&id).await;
        info!(
            upload_id = %id.simple(),
            path = ?session.file_path,
            size = session.declared_size,
            "upload complete"
        );
    }
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

/// Removes an upload session and deletes its partial file.
pub async fn terminate_upload(
    Path(id): Path<String>,
    Extension(uploads): Extension<Arc<UploadService>>,
) -> Result<Response, ApiError> {
    let id = parse_upload_id(&id)?;
    let handle = uploads
        .registry()
        .remove(&id)
        .await
        .ok_or_else(|| ApiError::NotFound("upload not found".into()))?;
    uploads.retire(id, handle, "terminated").await;
    info!(upload_id = %id.simple(), "upload terminated");
    Ok((StatusCode::NO_CONTENT, resumable_headers()).into_response())
}

/// Advertises the protocol version, extensions and checksum algorithms.
pub async fn upload_options(
    Extension(uploads): Extension<Arc<UploadService>>,
) -> Result<Response, ApiError> {
    let mut response_headers = resumable_headers();
    response_headers.insert(
        PROTOCOL_VERSION_HEADER,
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    response_headers.insert(
        PROTOCOL_EXTENSION,
        HeaderValue::from_static(PROTOCOL_EXTENSIONS),
    );
    response_headers.insert(
        PROTOCOL_CHECKSUM_ALGORITHM,
        HeaderValue::from_static(SUPPORTED_ALGORITHMS),
    );
    let max_size = uploads.config().max_upload_size;
    if max_size > 0 {
        response_headers.insert(PROTOCOL_MAX_SIZE, header_value(&max_size.to_string())?);
    }
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

fn plan_append(session: &UploadSession, headers: &HeaderMap) -> Result<AppendPlan, ApiError> {
    let declared_size = if session.is_length_deferred() {
        match parse_length_directive(headers)? {
            Some(LengthDirective::Deferred) => None,
            Some(LengthDirective::Known(size)) => Some(size),
            None => {
                return Err(ApiError::BadRequest(
                    "Upload-Length or Upload-Defer-Length is required".into(),
                ));
            }
        }
    } else {
        if let Some(value) = header_str(headers, &UPLOAD_LENGTH)?
            && parse_decimal(value) != Some(session.declared_size)
        {
            return Err(ApiError::BadRequest("Upload-Length cannot change".into()));
        }
        Some(session.declared_size)
    };

    let offset = header_str(headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| ApiError::BadRequest("Upload-Offset is required".into()))?;
    let offset =
        parse_decimal(offset).ok_or_else(|| ApiError::BadRequest("invalid Upload-Offset".into()))?;
    if offset != session.offset {
        return Err(ApiError::Conflict(format!(
            "offset mismatch: expected {}",
            session.offset
        )));
    }
    if declared_size.is_some_and(|size| size < offset) {
        return Err(ApiError::BadRequest(
            "Upload-Length is smaller than the current offset".into(),
        ));
    }

    Ok(AppendPlan {
        offset,
        declared_size,
    })
}

fn parse_length_directive(headers: &HeaderMap) -> Result<Option<LengthDirective>, ApiError> {
    if let Some(defer) = header_str(headers, &UPLOAD_DEFER_LENGTH)? {
        if defer != "1" {
            return Err(ApiError::BadRequest("Upload-Defer-Length must be 1".into()));
        }
        if headers.contains_key(UPLOAD_LENGTH) {
            return Err(ApiError::BadRequest(
                "Upload-Length and Upload-Defer-Length are exclusive".into(),
            ));
        }
        return Ok(Some(LengthDirective::Deferred));
    }

    match header_str(headers, &UPLOAD_LENGTH)? {
        None => Ok(None),
        Some(value) => match parse_decimal(value) {
            Some(size) if size > 0 => Ok(Some(LengthDirective::Known(size))),
            _ => Err(ApiError::BadRequest("invalid Upload-Length".into())),
        },
    }
}

fn check_max_size(uploads: &UploadService, declared_size: u64) -> Result<(), ApiError> {
    let max_size = uploads.config().max_upload_size;
    if max_size > 0 && declared_size > max_size {
        return Err(ApiError::BadRequest("upload size exceeds limit".into()));
    }
    Ok(())
}

fn require_protocol_version(headers: &HeaderMap) -> Result<(), ApiError> {
    match header_str(headers, &PROTOCOL_RESUMABLE)? {
        Some(PROTOCOL_VERSION) => Ok(()),
        _ => Err(ApiError::MethodNotAllowed(format!(
            "Protocol-Resumable must be {PROTOCOL_VERSION}"
        ))),
    }
}

fn parse_upload_id(value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value).map_err(|_| ApiError::BadRequest("upload id is invalid".into()))
}

/// Probe and append treat an unknown id as a client error.
fn session_lock_error(error: LockError) -> ApiError {
    match error {
        LockError::NotFound => ApiError::BadRequest("upload not found".into()),
        LockError::Busy => ApiError::Conflict("upload is busy".into()),
    }
}

fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    header_str(headers, &header::CONTENT_LENGTH)?
        .map(|value| {
            parse_decimal(value).ok_or_else(|| ApiError::BadRequest("invalid Content-Length".into()))
        })
        .transpose()
}

/// Plain unsigned decimal. Signs and whitespace are rejected.
fn parse_decimal(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Reads the request body, refusing more than `limit` bytes and anything that
/// disagrees with the declared content length.
async fn read_chunk(
    body: AxumBody,
    content_length: Option<u64>,
    limit: u64,
) -> Result<Vec<u8>, ApiError> {
    let capacity = content_length.unwrap_or(0).min(limit) as usize;
    let mut buffer = Vec::with_capacity(capacity);
    let mut data_stream = BodyExt::into_data_stream(body);
    while let Some(chunk) = data_stream.next().await {
        let chunk = chunk.map_err(|err: AxumError| ApiError::BadRequest(err.to_string()))?;
        if buffer.len() as u64 + chunk.len() as u64 > limit {
            return Err(ApiError::BadRequest("chunk exceeds the allowed length".into()));
        }
        buffer.extend_from_slice(&chunk);
    }
    if let Some(expected) = content_length
        && expected != buffer.len() as u64
    {
        return Err(ApiError::BadRequest(
            "body length does not match Content-Length".into(),
        ));
    }
    Ok(buffer)
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &header::HeaderName,
) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| ApiError::BadRequest(format!("invalid {name} header")))
        })
        .transpose()
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}

fn resumable_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(PROTOCOL_RESUMABLE, HeaderValue::from_static(PROTOCOL_VERSION));
    headers
}

fn session_headers(session: &UploadSession) -> Result<HeaderMap, ApiError> {
    let mut headers = resumable_headers();
    headers.insert(UPLOAD_OFFSET, header_value(&session.offset.to_string())?);
    headers.insert(
        UPLOAD_EXPIRES,
        header_value(&format_expiry(session.expires_at))?,
    );
    Ok(headers)
}

fn format_expiry(expires_at: DateTime<Utc>) -> String {
    expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
