use crate::internal;
use crate::media::{Category, is_audio_video_path, is_image_path};
use crate::state::AppState;
use crate::storage::StorageError;
use crate::transform::PreviewRequest;
use crate::upload;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{Extensions, HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::fs::Metadata;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, warn};

const MAX_FORWARDED_HOPS: usize = 20;
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const AUDIO_VIDEO_CACHE_CONTROL: &str = "public, max-age=3600";
const IMAGE_CACHE_CONTROL: &str = "public, max-age=43200";

#[derive(Debug, Default, Deserialize)]
pub struct ContentQuery {
    pub size: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .route("/emojis", post(upload::upload_ungrouped))
        .route("/external-embed/{*token}", get(serve_external_embed))
        .route(
            "/{category}/{*rest}",
            get(serve_content).post(upload::upload_grouped),
        )
        .nest("/internal", internal::router(state.clone()))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    (StatusCode::OK, "media gateway online")
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn serve_content(
    State(state): State<Arc<AppState>>,
    Path((category, _rest)): Path<(String, String)>,
    Query(query): Query<ContentQuery>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    if Category::from_segment(&category).is_none() {
        return Err(ApiError::not_found("Not found"));
    }
    // The raw path keeps percent-escapes so each segment is decoded once.
    let resolved = state
        .storage
        .resolve(request.uri().path())
        .map_err(map_storage_error)?;
    let (path, metadata) = state
        .storage
        .locate(resolved)
        .await
        .map_err(map_storage_error)?;
    serve_located(&state, path, &metadata, &query, request).await
}

async fn serve_external_embed(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(query): Query<ContentQuery>,
    request: Request<Body>,
) -> Response {
    let token = token.split('.').next().unwrap_or_default();
    let decoded = match state.embed.decode(token) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(error = %err, "external embed rejected");
            return StatusCode::FORBIDDEN.into_response();
        }
    };
    let located = match state.storage.resolve_plain(&decoded) {
        Ok(resolved) => state.storage.locate(resolved).await,
        Err(err) => Err(err),
    };
    match located {
        Ok((path, metadata)) => serve_located(&state, path, &metadata, &query, request)
            .await
            .unwrap_or_else(IntoResponse::into_response),
        Err(err) => map_storage_error(err).into_response(),
    }
}

async fn serve_located(
    state: &AppState,
    path: PathBuf,
    metadata: &Metadata,
    query: &ContentQuery,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    if is_image_path(&path) && metadata.len() <= state.config.max_preview_source_bytes {
        let source = path.to_string_lossy();
        if let Some(preview) =
            PreviewRequest::from_query(&source, query.size.as_deref(), query.kind.as_deref())
        {
            return proxy_preview(state, &preview).await;
        }
    }
    Ok(serve_file(path, request).await)
}

async fn proxy_preview(state: &AppState, preview: &PreviewRequest) -> Result<Response, ApiError> {
    let upstream = state.render.fetch_preview(preview).await.map_err(|err| {
        warn!(error = %err, source = %preview.source, "preview render failed");
        ApiError::new(StatusCode::BAD_GATEWAY, "Failed to process image")
    })?;
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or(HeaderValue::from_static("image/webp"));
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(IMAGE_CACHE_CONTROL),
    );
    Ok(response)
}

async fn serve_file(path: PathBuf, request: Request<Body>) -> Response {
    let cache_control = if is_audio_video_path(&path) {
        Some(AUDIO_VIDEO_CACHE_CONTROL)
    } else if is_image_path(&path) {
        Some(IMAGE_CACHE_CONTROL)
    } else {
        None
    };
    let disposition = if cache_control.is_none() {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(attachment_disposition)
    } else {
        None
    };
    let mut response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };
    let status = response.status();
    if !(status.is_success() || status == StatusCode::NOT_MODIFIED) {
        return response;
    }
    let headers = response.headers_mut();
    if let Some(cache_control) = cache_control {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(cache_control),
        );
    }
    if let Some(value) = disposition.and_then(|value| HeaderValue::from_str(&value).ok()) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

fn attachment_disposition(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii_graphic() || ch == ' ' => ch,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{cleaned}\"")
}

fn map_storage_error(error: StorageError) -> ApiError {
    match error {
        StorageError::Forbidden => ApiError::forbidden("Forbidden"),
        StorageError::NotFound => ApiError::not_found("File not found"),
        StorageError::Io(err) => ApiError::from(anyhow::Error::new(err).context("storage io")),
    }
}

pub(crate) fn throttle_auth_failure(state: &AppState, ip: Option<IpAddr>) -> Option<Response> {
    let ip = ip?;
    let wait = state.auth_fail_limiter.record_failure(ip)?;
    warn!(ip = %ip, retry_after = wait.as_secs(), "too many failed authentications");
    Some(too_many_requests(wait))
}

fn too_many_requests(wait: Duration) -> Response {
    let mut response =
        ApiError::new(StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(wait.as_secs().max(1)));
    response
}

// Forwarded hops are only believed when the socket peer is a trusted proxy.
// The client is the nearest hop, walking back from the peer, that is not a
// proxy itself.
pub(crate) fn client_ip(
    headers: &HeaderMap,
    extensions: &Extensions,
    state: &AppState,
) -> Option<IpAddr> {
    let ConnectInfo(peer) = extensions.get::<ConnectInfo<SocketAddr>>()?;
    let peer = peer.ip();
    let proxies = &state.config.trusted_proxies;
    let is_proxy = |ip: &IpAddr| proxies.iter().any(|net| net.contains(ip));
    if !is_proxy(&peer) {
        return Some(peer);
    }
    let hops = forwarded_for(headers);
    let client = hops
        .iter()
        .rev()
        .find(|&&hop| !is_proxy(&hop))
        .or_else(|| hops.first())
        .copied();
    Some(client.unwrap_or(peer))
}

fn forwarded_for(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .take(MAX_FORWARDED_HOPS)
        .filter_map(|hop| {
            let hop = hop.trim();
            hop.parse::<IpAddr>()
                .ok()
                .or_else(|| hop.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
        })
        .collect()
}

#[allow(clippy::result_large_err)]
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
    pub log_detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "message": message }),
            log_detail: None,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn with_log_detail(mut self, detail: String) -> Self {
        if !detail.is_empty() {
            self.log_detail = Some(detail);
        }
        self
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        warn!(error = ?error, "request failed");
        Self::internal("Internal server error").with_log_detail(format!("{error:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(detail) = self.log_detail.as_deref() {
            debug!(status = self.status.as_u16(), detail, "request rejected");
        }
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use axum::body::to_bytes;
    use std::net::Ipv4Addr;
    use std::path::Path as FsPath;

    async fn test_state(dir: &FsPath) -> Arc<AppState> {
        test_state_with(Config::for_tests(dir)).await
    }

    async fn test_state_with(config: Config) -> Arc<AppState> {
        let state = AppState::new(config, Arc::new(ManualClock::new())).unwrap();
        state.storage.reset_staging().await.unwrap();
        Arc::new(state)
    }

    async fn put_file(state: &AppState, relative: &str, contents: &[u8]) {
        let path = state.storage.root().join(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, contents).await.unwrap();
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn root_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()).await);
        let response = get(app.clone(), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "media gateway online");
        assert_eq!(get(app, "/healthz").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn serves_images_with_long_cache() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        put_file(&state, "emojis/10.webp", b"webp-bytes").await;
        let response = get(router(state), "/emojis/10.webp").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            IMAGE_CACHE_CONTROL
        );
        assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "webp-bytes");
    }

    #[tokio::test]
    async fn serves_video_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        put_file(&state, "attachments/1/2/clip.mp4", b"0123456789").await;
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/attachments/1/2/clip.mp4")
                    .header(header::RANGE, "bytes=2-5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            AUDIO_VIDEO_CACHE_CONTROL
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "2345");
    }

    #[tokio::test]
    async fn other_files_download_as_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        put_file(&state, "attachments/1/2/notes v2.txt", b"hello").await;
        let response = get(router(state), "/attachments/1/2/notes%20v2.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"notes v2.txt\""
        );
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
    }

    #[tokio::test]
    async fn rejects_traversal_and_unknown_paths() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        tokio::fs::write(dir.path().join("secret.txt"), b"nope")
            .await
            .unwrap();
        let app = router(state);
        let response = get(app.clone(), "/attachments/%2e%2e/%2e%2e/secret.txt").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = get(app.clone(), "/attachments/..%2f..%2fsecret.txt").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = get(app.clone(), "/emojis/404.png").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["message"], "File not found");
        let response = get(app, "/stickers/1.png").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn external_embed_serves_decoded_path() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        put_file(&state, "attachments/5/6/cat.png", b"png-bytes").await;
        let token = state.embed.encode("attachments/5/6/cat.png").unwrap();
        let app = router(state);

        let response = get(app.clone(), &format!("/external-embed/{token}.png")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "png-bytes");

        let response = get(app, &format!("/external-embed/{token}")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn external_embed_rejects_bad_tokens_with_empty_403() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        put_file(&state, "emojis/1.png", b"x").await;
        let mut token = state.embed.encode("emojis/1.png").unwrap();
        let last = token.pop().unwrap();
        token.push(if last == 'A' { 'B' } else { 'A' });
        let app = router(state);
        for uri in [
            format!("/external-embed/{token}.png"),
            "/external-embed/not-a-token".to_string(),
            "/external-embed/.png".to_string(),
        ] {
            let response = get(app.clone(), &uri).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn external_embed_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let token = state.embed.encode("../secret.txt").unwrap();
        let response = get(router(state), &format!("/external-embed/{token}")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn previews_come_from_render_service() {
        let upstream = Router::new().fallback(|request: Request<Body>| async move {
            let path = request.uri().path().to_string();
            ([(header::CONTENT_TYPE, "image/webp")], path)
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, upstream).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.imgproxy_url = format!("http://{addr}/pr:sharp/");
        let state = test_state_with(config).await;
        put_file(&state, "emojis/3.gif", b"gif-bytes").await;
        let source = state.storage.root().join("emojis/3.gif");
        let app = router(state);

        let response = get(app.clone(), "/emojis/3.gif?size=64&type=webp").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/webp"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let expected_source =
            urlencoding::encode(&format!("local:///{}", source.to_string_lossy().trim_start_matches("./")))
                .into_owned();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            format!("/pr:sharp/page:0/rs:fit:64:64/plain/{expected_source}@webp")
        );

        let response = get(app, "/emojis/3.gif").await;
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "gif-bytes");
    }

    #[tokio::test]
    async fn preview_failure_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        put_file(&state, "emojis/3.png", b"png").await;
        let response = get(router(state), "/emojis/3.png?size=32").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn auth_failures_are_throttled_per_ip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.auth_failure_rate_limit_per_minute = 1;
        config.auth_failure_rate_limit_burst = 2;
        let state = test_state_with(config).await;
        let ip = Some(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));
        assert!(throttle_auth_failure(&state, ip).is_none());
        assert!(throttle_auth_failure(&state, ip).is_none());
        let response = throttle_auth_failure(&state, ip).unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
        assert!(response.headers().get("x-ratelimit-limit").is_none());
        assert!(throttle_auth_failure(&state, None).is_none());
    }

    fn connected(peer: &str) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        extensions
    }

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[tokio::test]
    async fn client_ip_walks_back_past_trusted_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.trusted_proxies = vec!["10.0.0.0/8".parse().unwrap()];
        let state = test_state_with(config).await;
        let headers = forwarded("203.0.113.9, 198.51.100.4:4711, 10.0.0.3");

        let ip = client_ip(&headers, &connected("10.0.0.1:5000"), &state);
        assert_eq!(ip, Some("198.51.100.4".parse().unwrap()));

        let ip = client_ip(&headers, &connected("192.0.2.1:5000"), &state);
        assert_eq!(ip, Some("192.0.2.1".parse().unwrap()));

        let ip = client_ip(&forwarded("10.9.9.9, junk"), &connected("10.0.0.1:5000"), &state);
        assert_eq!(ip, Some("10.9.9.9".parse().unwrap()));

        let ip = client_ip(&HeaderMap::new(), &connected("10.0.0.1:5000"), &state);
        assert_eq!(ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(client_ip(&headers, &Extensions::new(), &state), None);
    }

    #[tokio::test]
    async fn forwarded_header_is_ignored_without_trusted_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let ip = client_ip(
            &forwarded("203.0.113.9"),
            &connected("127.0.0.1:5000"),
            &state,
        );
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn disposition_strips_unsafe_characters() {
        assert_eq!(
            attachment_disposition("a\"b\\c\u{e9}.txt"),
            "attachment; filename=\"a_b_c_.txt\""
        );
    }
}
