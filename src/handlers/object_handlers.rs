//! HTTP handlers for uploads, downloads and object status.
//! Streams bodies in both directions and delegates lifecycle decisions to
//! `ObjectService`.

use crate::{
    errors::{AppError, StoreError},
    handlers::AppState,
    models::object::{ConsumptionPolicy, CreatedObject, ObjectMeta, ObjectStatus},
    services::{
        id_generator::ObjectId,
        object_service::{ObjectDownload, UploadRequest},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::{fmt::Write as _, io, time::Duration};

/// Per-upload overrides. Both can only tighten the configured defaults.
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    /// `true` forces single-use, `false` keeps the link alive until the TTL.
    pub once: Option<bool>,
    /// Shorter TTL in seconds; values above the configured TTL are capped.
    pub ttl: Option<u64>,
}

/// `POST /api/upload` - multipart upload; the first file field is stored.
pub async fn upload_multipart(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<CreatedObject>, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.file_name().is_none() && field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field.content_type().unwrap_or_default().to_string();
        let request = upload_request(&state, &query, original_name, mime_type, None);
        let stream = field.map(|chunk| chunk.map_err(io::Error::other));

        let meta = state.objects.create(stream, request).await?;
        return Ok(Json(created_response(&state, &headers, &meta)));
    }

    Err(AppError::bad_request("multipart body has no file field"))
}

/// `PUT /api/upload/{filename}` - raw body upload.
pub async fn upload_raw(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<CreatedObject>, AppError> {
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let request = upload_request(&state, &query, filename, mime_type, declared_size);
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let meta = state.objects.create(stream, request).await?;
    Ok(Json(created_response(&state, &headers, &meta)))
}

/// `GET /d/{id}` - stream the object as an attachment.
pub async fn download_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let ObjectDownload { meta, body } = state.objects.fetch(&id).await?;

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `GET /api/objects/{id}` - metadata only; never consumes the object.
pub async fn object_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ObjectStatus>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(state.objects.status(&id)?))
}

/// `DELETE /api/objects/{id}`
pub async fn delete_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id)?;
    state.objects.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Malformed ids cannot exist; answer as if they had never been stored.
fn parse_id(raw: &str) -> Result<ObjectId, AppError> {
    ObjectId::parse(raw).ok_or_else(|| AppError::from(StoreError::NotFound))
}

fn upload_request(
    state: &AppState,
    query: &UploadQuery,
    original_name: String,
    mime_type: String,
    declared_size: Option<u64>,
) -> UploadRequest {
    let mut request = state.objects.upload_request(original_name, mime_type);
    request.declared_size = declared_size;
    if let Some(once) = query.once {
        request.policy = if once {
            ConsumptionPolicy::SingleUse
        } else {
            ConsumptionPolicy::TtlOnly
        };
    }
    if let Some(secs) = query.ttl.filter(|s| *s > 0) {
        request.ttl = request.ttl.min(Duration::from_secs(secs));
    }
    request
}

fn created_response(state: &AppState, headers: &HeaderMap, meta: &ObjectMeta) -> CreatedObject {
    CreatedObject {
        id: meta.id.clone(),
        url: share_url(state.public_url.as_deref(), headers, &meta.id),
        expires_at: meta.expires_at,
        size: meta.size_bytes,
        original_name: meta.original_name.clone(),
        policy: meta.policy,
    }
}

/// Absolute download link when a base is known, otherwise a relative one.
fn share_url(public_url: Option<&str>, headers: &HeaderMap, id: &ObjectId) -> String {
    if let Some(base) = public_url {
        return format!("{}/d/{}", base, id);
    }
    match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => format!("http://{}/d/{}", host, id),
        None => format!("/d/{}", id),
    }
}

fn set_download_headers(headers: &mut HeaderMap, meta: &ObjectMeta) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&meta.original_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8
/// name. The name is already sanitized; this only deals with encoding.
fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect();

    let mut encoded = String::with_capacity(name.len() * 3);
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{:02X}", byte);
        }
    }

    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", ascii, encoded)
}
