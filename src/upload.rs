use crate::dimensions::{CropRect, Dimensions, parse_crop_points};
use crate::http::{ApiError, client_ip, throttle_auth_failure};
use crate::media::{Category, extension_of, is_image_filename, safe_filename};
use crate::pending::{ImageMeta, Reservation};
use crate::render::{RenderError, probe_image};
use crate::state::AppState;
use crate::transform::build_transform_request;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const FILE_NAME_HEADER: &str = "file-name";
const FILE_CONTENT_TYPE_HEADER: &str = "file-content-type";

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub points: Option<String>,
}

pub async fn upload_grouped(
    State(state): State<Arc<AppState>>,
    Path((category, group)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    request: Request<Body>,
) -> Response {
    let category = match Category::from_segment(&category) {
        Some(Category::Emojis) | None => return ApiError::not_found("Not found").into_response(),
        Some(category) => category,
    };
    upload(&state, category, Some(&group), &query, request).await
}

pub async fn upload_ungrouped(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    request: Request<Body>,
) -> Response {
    upload(&state, Category::Emojis, None, &query, request).await
}

async fn upload(
    state: &AppState,
    category: Category,
    group: Option<&str>,
    query: &UploadQuery,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let token = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let claims = match state.tokens.verify(token) {
        Ok(claims) => claims,
        Err(err) => {
            debug!(error = %err, "upload token rejected");
            let ip = client_ip(&parts.headers, &parts.extensions, state);
            if let Some(response) = throttle_auth_failure(state, ip) {
                return response;
            }
            return ApiError::unauthorized("Unauthorized").into_response();
        }
    };
    match stage_upload(state, category, group, query, &parts.headers, body, claims.user_id).await
    {
        Ok(id) => Json(serde_json::json!({ "fileId": id.to_string() })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn stage_upload(
    state: &AppState,
    category: Category,
    group: Option<&str>,
    query: &UploadQuery,
    headers: &HeaderMap,
    body: Body,
    user_id: i64,
) -> Result<i64, ApiError> {
    let max_upload = state.config.max_upload_bytes;
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(-1);
    if content_length > i64::try_from(max_upload).unwrap_or(i64::MAX) {
        return Err(ApiError::bad_request("File too large"));
    }
    if content_length <= 0 {
        return Err(ApiError::bad_request("Invalid content length"));
    }
    let group_id = match group {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| ApiError::bad_request("Invalid group id"))?,
        None => 0,
    };
    let crop = if category.policy().croppable {
        parse_crop_points(query.points.as_deref())
            .map_err(|err| ApiError::bad_request("Invalid points").with_log_detail(err.to_string()))?
    } else {
        None
    };

    let original_filename = header_text(headers, FILE_NAME_HEADER);
    let safe_name = safe_filename(&original_filename);
    let is_image = is_image_filename(&safe_name);
    if category.requires_image() && !is_image {
        return Err(ApiError::bad_request("Invalid file type"));
    }
    let mime_type = header_text(headers, FILE_CONTENT_TYPE_HEADER);

    let id = state.flake.generate();
    let staged = state.storage.staged_path(id, &extension_of(&safe_name));
    let result = finish_upload(state, category, is_image, crop, body, &staged).await;
    let (path, file_size, image) = match result {
        Ok(finished) => finished,
        Err(err) => {
            discard(&staged).await;
            return Err(err);
        }
    };
    info!(
        id,
        category = category.as_segment(),
        group_id,
        file_size,
        rendered = image.is_some(),
        "upload staged"
    );
    state.pending.insert(Reservation {
        id,
        user_id: Some(user_id),
        group_id,
        category,
        original_filename,
        path,
        mime_type,
        file_size,
        image,
        expires_at: state.pending.expiry_after(state.config.pending_ttl),
    });
    Ok(id)
}

async fn finish_upload(
    state: &AppState,
    category: Category,
    is_image: bool,
    crop: Option<CropRect>,
    body: Body,
    staged: &FsPath,
) -> Result<(PathBuf, u64, Option<ImageMeta>), ApiError> {
    let written = write_body(body, staged, state.config.max_upload_bytes).await?;
    let renderable = is_image && written <= state.config.max_image_render_bytes;
    if category.requires_image() && !renderable {
        return Err(ApiError::bad_request("Image exceeds size limit"));
    }
    if !renderable {
        return Ok((staged.to_path_buf(), written, None));
    }
    match render_staged(state, category, crop, staged).await {
        Ok((path, size, meta)) => Ok((path, size, Some(meta))),
        Err(err) if category == Category::Attachments => {
            warn!(error = %err, path = ?staged, "attachment render failed, keeping original");
            Ok((staged.to_path_buf(), written, None))
        }
        Err(err) => {
            warn!(error = %err, path = ?staged, "image render failed");
            Err(ApiError::internal("Failed to compress image"))
        }
    }
}

async fn write_body(body: Body, path: &FsPath, limit: u64) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path).await.map_err(|err| {
        warn!(error = ?err, path = ?path, "failed to create staged file");
        ApiError::internal("Failed to create file")
    })?;
    let mut stream = body.into_data_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            ApiError::bad_request("Failed to read body").with_log_detail(err.to_string())
        })?;
        written = written.saturating_add(chunk.len() as u64);
        if written > limit {
            return Err(ApiError::bad_request("File exceeds size limit"));
        }
        file.write_all(&chunk).await.map_err(|err| {
            warn!(error = ?err, path = ?path, "failed to write staged file");
            ApiError::internal("Failed to write file")
        })?;
    }
    file.flush().await.map_err(|err| {
        warn!(error = ?err, path = ?path, "failed to flush staged file");
        ApiError::internal("Failed to write file")
    })?;
    Ok(written)
}

async fn render_staged(
    state: &AppState,
    category: Category,
    crop: Option<CropRect>,
    staged: &FsPath,
) -> Result<(PathBuf, u64, ImageMeta), RenderError> {
    let original = probe_image(staged).await?;
    let request = build_transform_request(
        category,
        &staged.to_string_lossy(),
        Dimensions::new(original.width, original.height),
        crop,
    )
    .map_err(|err| RenderError::Probe(err.to_string()))?;
    let rendered = state.render.render_to_file(&request, staged).await?;
    let meta = probe_image(&rendered).await?;
    let size = tokio::fs::metadata(&rendered).await?.len();
    Ok((rendered, size, meta))
}

async fn discard(staged: &FsPath) {
    let rendered = staged.with_extension("webp");
    for path in [staged, rendered.as_path()] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(error = ?err, path = ?path, "failed to remove staged upload"),
        }
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    let raw = headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default();
    match urlencoding::decode(&raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw,
    }
}
