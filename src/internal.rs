use crate::http::{ApiError, client_ip, throttle_auth_failure};
use crate::media::{Category, extension_of};
use crate::pending::{ClaimError, Reservation};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{Request, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

const MAX_INTERNAL_BODY_BYTES: usize = 64 * 1024;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate-token", post(generate_token))
        .route("/verify-file", post(verify_file))
        .route("/embed-token", post(embed_token))
        .layer(middleware::from_fn_with_state(state, require_internal))
        .layer(RequestBodyLimitLayer::new(MAX_INTERNAL_BODY_BYTES))
}

async fn require_internal(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .map(|value| value.as_bytes())
        .unwrap_or_default();
    let expected = state.config.internal_secret.as_bytes();
    if !expected.is_empty() && bool::from(presented.ct_eq(expected)) {
        return next.run(request).await;
    }
    let ip = client_ip(request.headers(), request.extensions(), &state);
    warn!(ip = ?ip, path = %request.uri().path(), "internal secret rejected");
    if let Some(response) = throttle_auth_failure(&state, ip) {
        return response;
    }
    ApiError::unauthorized("Unauthorized").into_response()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdField {
    Text(String),
    Number(i64),
}

impl IdField {
    fn parse(&self) -> Option<i64> {
        match self {
            IdField::Text(text) => text.trim().parse().ok(),
            IdField::Number(number) => Some(*number),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateTokenRequest {
    user_id: Option<IdField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyFileRequest {
    user_id: Option<IdField>,
    file_id: Option<IdField>,
    group_id: Option<IdField>,
}

#[derive(Debug, Deserialize)]
struct EmbedTokenRequest {
    path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ClaimedFile {
    original_filename: String,
    file_id: i64,
    group_id: i64,
    user_id: i64,
    path: String,
    #[serde(rename = "Type")]
    category: Category,
    image_compressed: bool,
    mime_type: String,
    duration: u32,
    height: u32,
    width: u32,
    animated: bool,
    file_size: u64,
    expires_at: String,
}

impl ClaimedFile {
    fn new(reservation: Reservation, public_path: &Path) -> Self {
        let image = reservation.image.unwrap_or_default();
        let expires_at = OffsetDateTime::from(reservation.expires_at)
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            original_filename: reservation.original_filename,
            file_id: reservation.id,
            group_id: reservation.group_id,
            user_id: reservation.user_id.unwrap_or_default(),
            path: public_path.to_string_lossy().replace('\\', "/"),
            category: reservation.category,
            image_compressed: reservation.image.is_some(),
            mime_type: reservation.mime_type,
            duration: 0,
            height: image.height,
            width: image.width,
            animated: image.animated,
            file_size: reservation.file_size,
            expires_at,
        }
    }
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(body)| body).map_err(|rejection| {
        ApiError::bad_request("Invalid request body").with_log_detail(rejection.body_text())
    })
}

fn required_id(field: Option<&IdField>, message: &str) -> Result<i64, ApiError> {
    field
        .and_then(IdField::parse)
        .ok_or_else(|| ApiError::bad_request(message))
}

async fn generate_token(
    State(state): State<Arc<AppState>>,
    body: Result<Json<GenerateTokenRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = parse_body(body)?;
    let user_id = required_id(body.user_id.as_ref(), "Invalid user Id")?;
    let token = state.tokens.issue(user_id).map_err(|err| {
        warn!(error = %err, user_id, "token issue failed");
        ApiError::internal("Failed to generate token")
    })?;
    Ok(Json(serde_json::json!({ "token": token })))
}

async fn verify_file(
    State(state): State<Arc<AppState>>,
    body: Result<Json<VerifyFileRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = parse_body(body)?;
    let user_id = required_id(body.user_id.as_ref(), "Invalid user Id")?;
    let file_id = required_id(body.file_id.as_ref(), "Invalid file Id")?;
    let group_id = match body.group_id.as_ref() {
        None => 0,
        Some(IdField::Text(text)) if text.trim().is_empty() => 0,
        Some(field) => required_id(Some(field), "Invalid group Id")?,
    };

    let reservation = state
        .pending
        .claim(file_id, user_id, group_id)
        .map_err(|err| match err {
            ClaimError::NotFound | ClaimError::Expired => {
                ApiError::not_found(&err.to_string()).with_log_detail(format!("file {file_id}"))
            }
            ClaimError::Unauthorized => ApiError::unauthorized("Unauthorized")
                .with_log_detail(format!("file {file_id} user {user_id} group {group_id}")),
        })?;

    let public_path = match state.storage.promote(&reservation).await {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, id = file_id, path = ?reservation.path, "failed to promote claimed file");
            let _ = tokio::fs::remove_file(&reservation.path).await;
            return Err(ApiError::internal("Failed to store file"));
        }
    };
    info!(id = file_id, user_id, group_id, path = ?public_path, "upload claimed");
    let file = ClaimedFile::new(reservation, &public_path);
    Ok(Json(serde_json::json!({ "file": file })))
}

async fn embed_token(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EmbedTokenRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = parse_body(body)?;
    let path = body.path.trim().trim_start_matches('/');
    let resolved = state
        .storage
        .resolve_plain(path)
        .map_err(|_| ApiError::bad_request("Invalid path"))?;
    if state.storage.locate(resolved).await.is_err() {
        return Err(ApiError::not_found("File not found"));
    }
    let token = state.embed.encode(path).map_err(|err| {
        warn!(error = %err, "embed token encode failed");
        ApiError::internal("Failed to generate token")
    })?;
    let url = format!(
        "{}/external-embed/{token}{}",
        state.config.public_base_url,
        extension_of(path)
    );
    Ok(Json(serde_json::json!({ "token": token, "url": url })))
}
