#![allow(clippy::collapsible_if)]

mod clock;
mod config;
mod dimensions;
mod embed;
mod flake;
mod http;
mod internal;
mod media;
mod pending;
mod rate_limit;
mod render;
mod state;
mod storage;
mod token;
mod transform;
mod upload;

use crate::config::Config;
use crate::state::AppState;
use axum::Router;
use axum::body::HttpBody;
use axum::http::{Response, header};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    CompressionLayer,
    predicate::{DefaultPredicate, Predicate},
};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{info, warn};

// Media bodies are already compressed, and ranged responses must keep
// their byte offsets.
#[derive(Clone)]
struct NoMediaCompression {
    inner: DefaultPredicate,
}

impl NoMediaCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoMediaCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if ["image/", "audio/", "video/"]
                    .iter()
                    .any(|prefix| content_type.starts_with(prefix))
                {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    http::router(state)
        .layer(CompressionLayer::new().compress_when(NoMediaCompression::new()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let state = Arc::new(AppState::new(config, clock::system_clock())?);
    info!(
        storage_dir = ?state.storage.root(),
        staging_dir = ?state.storage.staging(),
        node_id = state.flake.node_id(),
        pending_ttl_seconds = state.config.pending_ttl.as_secs(),
        max_upload_bytes = state.config.max_upload_bytes,
        imgproxy_url = %state.config.imgproxy_url,
        embed_accept_legacy = state.embed.accepts_legacy(),
        auth_failure_rate_limit_per_minute = state.config.auth_failure_rate_limit_per_minute,
        "startup config summary"
    );
    state.storage.reset_staging().await?;

    let shutdown = CancellationToken::new();
    let sweeper = pending::spawn_sweeper(
        state.pending.clone(),
        state.config.pending_sweep_interval,
        shutdown.clone(),
    );

    let app = build_app(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "media gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_signal())
    .await?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = ?err, "pending sweeper did not stop cleanly");
    }
    info!(pending = state.pending.len(), "media gateway stopped");
    Ok(())
}

async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
