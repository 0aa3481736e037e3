use crate::clock::SharedClock;
use crate::config::Config;
use crate::embed::EmbedCodec;
use crate::flake::Flake;
use crate::pending::PendingRegistry;
use crate::rate_limit::AuthFailureLimiter;
use crate::render::RenderClient;
use crate::storage::Storage;
use crate::token::TokenService;
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub flake: Arc<Flake>,
    pub pending: PendingRegistry,
    pub tokens: TokenService,
    pub embed: EmbedCodec,
    pub storage: Storage,
    pub render: RenderClient,
    pub auth_fail_limiter: AuthFailureLimiter,
}

impl AppState {
    pub fn new(config: Config, clock: SharedClock) -> Result<Self> {
        let flake = Flake::new(config.node_id, clock.clone()).context("NODE_ID")?;
        let pending = PendingRegistry::new(clock.clone());
        let tokens = TokenService::new(&config.jwt_secret, clock.clone());
        let embed = EmbedCodec::new(&config.external_embed_secret, config.embed_accept_legacy);
        let storage = Storage::new(config.storage_dir.clone(), config.staging_dir.clone());
        let render = RenderClient::new(
            &config.imgproxy_url,
            config.imgproxy_timeout,
            config.max_upload_bytes,
        )?;
        let auth_fail_limiter = AuthFailureLimiter::new(
            config.auth_failure_rate_limit_per_minute,
            config.auth_failure_rate_limit_burst,
            clock.clone(),
        );
        Ok(Self {
            config: Arc::new(config),
            clock,
            flake: Arc::new(flake),
            pending,
            tokens,
            embed,
            storage,
            render,
            auth_fail_limiter,
        })
    }
}
