use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use url::Url;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub jwt_secret: String,
    pub internal_secret: String,
    pub external_embed_secret: String,
    pub node_id: u64,
    pub pending_ttl: Duration,
    pub pending_sweep_interval: Duration,
    pub max_upload_bytes: u64,
    pub max_image_render_bytes: u64,
    pub max_preview_source_bytes: u64,
    pub imgproxy_url: String,
    pub imgproxy_timeout: Duration,
    pub public_base_url: String,
    pub embed_accept_legacy: bool,
    pub max_in_flight_requests: usize,
    pub auth_failure_rate_limit_per_minute: u64,
    pub auth_failure_rate_limit_burst: u64,
    pub trusted_proxies: Vec<IpNet>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 3000);
        let storage_dir =
            PathBuf::from(env::var("STORAGE_DIR").unwrap_or_else(|_| "public".to_string()));
        let staging_dir =
            PathBuf::from(env::var("STAGING_DIR").unwrap_or_else(|_| "temp".to_string()));
        if storage_dir == staging_dir {
            return Err(anyhow!("STAGING_DIR must differ from STORAGE_DIR"));
        }

        let jwt_secret = required_secret("JWT_SECRET")?;
        let internal_secret = required_secret("INTERNAL_SECRET")?;
        let external_embed_secret = required_secret("EXTERNAL_EMBED_SECRET")?;

        let node_id = parse_u64("NODE_ID", 45);
        let pending_ttl = Duration::from_secs(parse_u64("PENDING_TTL_SECONDS", 120));
        let pending_sweep_interval =
            Duration::from_secs(parse_u64("PENDING_SWEEP_INTERVAL_SECONDS", 60));
        if pending_sweep_interval.is_zero() {
            return Err(anyhow!("PENDING_SWEEP_INTERVAL_SECONDS must be positive"));
        }

        let max_upload_bytes = parse_u64("MAX_UPLOAD_BYTES", 50 * MIB);
        let max_image_render_bytes = parse_u64("MAX_IMAGE_RENDER_BYTES", 12 * MIB);
        let max_preview_source_bytes = parse_u64("MAX_PREVIEW_SOURCE_BYTES", 20 * MIB);

        let imgproxy_url = parse_imgproxy_url("IMGPROXY_URL")?;
        let imgproxy_timeout = Duration::from_secs(parse_u64("IMGPROXY_TIMEOUT_SECONDS", 30));
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_default()
            .trim()
            .trim_end_matches('/')
            .to_string();
        let embed_accept_legacy = parse_bool("EMBED_ACCEPT_LEGACY", false);
        if embed_accept_legacy {
            warn!("EMBED_ACCEPT_LEGACY=true: fixed-IV embed links are still accepted");
        }

        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 512);
        let auth_failure_rate_limit_per_minute =
            parse_u64("AUTH_FAILURE_RATE_LIMIT_PER_MINUTE", 0);
        let auth_failure_rate_limit_burst = parse_u64("AUTH_FAILURE_RATE_LIMIT_BURST", 0);
        let trusted_proxies = parse_trusted_proxies("TRUSTED_PROXY_CIDRS")?;
        warn_on_broad_proxy_ranges(&trusted_proxies);

        Ok(Self {
            host,
            port,
            storage_dir,
            staging_dir,
            jwt_secret,
            internal_secret,
            external_embed_secret,
            node_id,
            pending_ttl,
            pending_sweep_interval,
            max_upload_bytes,
            max_image_render_bytes,
            max_preview_source_bytes,
            imgproxy_url,
            imgproxy_timeout,
            public_base_url,
            embed_accept_legacy,
            max_in_flight_requests,
            auth_failure_rate_limit_per_minute,
            auth_failure_rate_limit_burst,
            trusted_proxies,
        })
    }

    #[cfg(test)]
    pub fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            storage_dir: dir.join("public"),
            staging_dir: dir.join("temp"),
            jwt_secret: "jwt-test-secret".to_string(),
            internal_secret: "internal-test-secret".to_string(),
            external_embed_secret: "embed-test-secret".to_string(),
            node_id: 45,
            pending_ttl: Duration::from_secs(120),
            pending_sweep_interval: Duration::from_secs(60),
            max_upload_bytes: 50 * MIB,
            max_image_render_bytes: 12 * MIB,
            max_preview_source_bytes: 20 * MIB,
            imgproxy_url: "http://127.0.0.1:9/pr:sharp/".to_string(),
            imgproxy_timeout: Duration::from_secs(2),
            public_base_url: "https://cdn.example.test".to_string(),
            embed_accept_legacy: false,
            max_in_flight_requests: 64,
            auth_failure_rate_limit_per_minute: 0,
            auth_failure_rate_limit_burst: 0,
            trusted_proxies: Vec::new(),
        }
    }
}

fn required_secret(key: &str) -> Result<String> {
    let value = env::var(key).with_context(|| format!("{key} is required"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("{key} must not be empty"));
    }
    Ok(value)
}

fn parse_imgproxy_url(key: &str) -> Result<String> {
    let raw = env::var(key).unwrap_or_else(|_| "http://localhost:8888/pr:sharp/".to_string());
    let parsed = Url::parse(raw.trim()).with_context(|| format!("invalid {key}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(anyhow!("{key} must be an http(s) url"));
    }
    let mut value = parsed.to_string();
    if !value.ends_with('/') {
        value.push('/');
    }
    Ok(value)
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).ok()
    } else {
        let list = raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        if list.is_empty() { None } else { Some(list) }
    }
}

fn parse_trusted_proxies(key: &str) -> Result<Vec<IpNet>> {
    let values = match parse_list_env(key) {
        Some(values) => values,
        None => return Ok(Vec::new()),
    };
    let mut parsed = Vec::new();
    for value in values {
        if let Ok(net) = value.parse::<IpNet>() {
            parsed.push(net);
            continue;
        }
        if let Ok(addr) = value.parse::<IpAddr>() {
            parsed.push(IpNet::from(addr));
            continue;
        }
        return Err(anyhow!("invalid trusted proxy entry: {value}"));
    }
    Ok(parsed)
}

fn warn_on_broad_proxy_ranges(trusted: &[IpNet]) {
    for net in trusted {
        let prefix = net.prefix_len();
        let broad = if net.addr().is_ipv4() {
            prefix <= 8
        } else {
            prefix <= 32
        };
        if broad {
            warn!(
                cidr = %net,
                "trusted proxy range is very broad; clients may spoof IPs"
            );
        }
    }
}
