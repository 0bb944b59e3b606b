//! HTTP handlers for image upload, download and record lookup.
//! Storage and bookkeeping are delegated to `CacheService`.

use crate::{
    errors::AppError,
    models::image::ImageRecord,
    services::cache_service::{CacheLookup, PutOutcome},
    state::AppState,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Base64 digest of the body (RFC 1864).
pub const CONTENT_MD5_HEADER: &str = "content-md5";
/// Hex MD5 supplied by clients that do not send `Content-MD5`.
pub const IMAGE_MD5_HEADER: &str = "x-image-md5";
pub const DOWNLOAD_COUNT_HEADER: &str = "x-download-count";

/// Query params accepted by both upload routes.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub format: String,
    pub app_code: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub guid: String,
    pub path: String,
    pub size: u64,
    pub md5: String,
}

impl From<PutOutcome> for UploadResponse {
    fn from(outcome: PutOutcome) -> Self {
        Self {
            guid: outcome.record.guid,
            path: outcome.path.display().to_string(),
            size: outcome.size,
            md5: outcome.record.md5,
        }
    }
}

/// `PUT /images/{guid}?format=&app_code=`
pub async fn put_image(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    store(&state, &guid, &query, &headers, body).await
}

/// `POST /images?format=&app_code=`, storing under a generated guid.
pub async fn post_image(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let guid = Uuid::new_v4().simple().to_string();
    store(&state, &guid, &query, &headers, body).await
}

async fn store(
    state: &AppState,
    guid: &str,
    query: &UploadQuery,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let md5 = request_md5(headers, &body)?;
    let outcome = state
        .cache
        .put(guid, body, &query.format, &query.app_code, &md5)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// `GET /images/{guid}`: the blob, with its ETag and download count.
pub async fn get_image(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Response, AppError> {
    let image = match state.cache.get(&guid).await? {
        CacheLookup::Hit(image) => image,
        CacheLookup::Miss => return Err(AppError::not_found(format!("image `{guid}` not found"))),
    };

    let mut response = Response::new(Body::from(image.bytes));
    *response.status_mut() = StatusCode::OK;
    set_image_headers(response.headers_mut(), &image.record, image.size);
    Ok(response)
}

/// `GET /images/{guid}/info`
pub async fn image_info(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<ImageRecord>, AppError> {
    state
        .cache
        .info(&guid)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("image `{guid}` not found")))
}

/// Lowercase hex MD5 for an upload: `Content-MD5` (base64) wins, then
/// `x-image-md5` (hex, validated by the cache), else computed from the body.
fn request_md5(headers: &HeaderMap, body: &[u8]) -> Result<String, AppError> {
    if let Some(value) = headers.get(CONTENT_MD5_HEADER) {
        let encoded = value
            .to_str()
            .map_err(|_| AppError::bad_request("Content-MD5 is not valid ASCII"))?;
        let digest = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| AppError::bad_request(format!("invalid Content-MD5: {err}")))?;
        if digest.len() != 16 {
            return Err(AppError::bad_request("Content-MD5 must decode to 16 bytes"));
        }
        return Ok(digest.iter().map(|b| format!("{b:02x}")).collect());
    }

    if let Some(value) = headers.get(IMAGE_MD5_HEADER) {
        let hex = value
            .to_str()
            .map_err(|_| AppError::bad_request("x-image-md5 is not valid ASCII"))?;
        return Ok(hex.trim().to_string());
    }

    Ok(format!("{:x}", md5::compute(body)))
}

fn set_image_headers(headers: &mut HeaderMap, record: &ImageRecord, size: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&record.file_storage_format)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", record.md5)) {
        headers.insert(header::ETAG, etag);
    }
    headers.insert(
        HeaderName::from_static(DOWNLOAD_COUNT_HEADER),
        HeaderValue::from(record.download_count),
    );
}

fn content_type_for(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "avif" => "image/avif",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_prefers_content_md5_then_hex_header_then_body() {
        let body = b"hello";
        let computed = format!("{:x}", md5::compute(body));

        let mut headers = HeaderMap::new();
        assert_eq!(request_md5(&headers, body).unwrap(), computed);

        headers.insert(
            IMAGE_MD5_HEADER,
            HeaderValue::from_static("D41D8CD98F00B204E9800998ECF8427E"),
        );
        assert_eq!(
            request_md5(&headers, body).unwrap(),
            "D41D8CD98F00B204E9800998ECF8427E"
        );

        let encoded = general_purpose::STANDARD.encode(md5::compute(body).0);
        headers.insert(
            CONTENT_MD5_HEADER,
            HeaderValue::from_str(&encoded).unwrap(),
        );
        assert_eq!(request_md5(&headers, body).unwrap(), computed);
    }

    #[test]
    fn malformed_content_md5_is_a_bad_request() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_MD5_HEADER, HeaderValue::from_static("not base64!"));
        let err = request_md5(&headers, b"x").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        headers.insert(CONTENT_MD5_HEADER, HeaderValue::from_static("AAAA"));
        assert!(request_md5(&headers, b"x").is_err());
    }

    #[test]
    fn content_type_follows_storage_format() {
        assert_eq!(content_type_for("JPG"), "image/jpeg");
        assert_eq!(content_type_for("webp"), "image/webp");
        assert_eq!(content_type_for("raw"), "application/octet-stream");
    }
}
