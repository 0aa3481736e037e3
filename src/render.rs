use crate::pending::ImageMeta;
use crate::storage::temp_path_for;
use crate::transform::{PreviewRequest, TransformRequest};
use anyhow::{Context, Result};
use image::codecs::gif::GifDecoder;
use image::codecs::webp::WebPDecoder;
use image::{AnimationDecoder, ImageFormat, ImageReader};
use reqwest::StatusCode;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task;
use tracing::debug;

const RENDERED_EXTENSION: &str = "webp";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render service returned {0}")]
    UpstreamStatus(StatusCode),
    #[error("rendered output exceeds {0} bytes")]
    TooLarge(u64),
    #[error("render request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("render io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("image probe failed: {0}")]
    Probe(String),
}

#[derive(Clone)]
pub struct RenderClient {
    client: reqwest::Client,
    base_url: String,
    max_output_bytes: u64,
}

impl RenderClient {
    pub fn new(base_url: &str, timeout: Duration, max_output_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("media-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build render client")?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            max_output_bytes,
        })
    }

    pub fn url_for(&self, instruction: &str) -> String {
        format!("{}{instruction}", self.base_url)
    }

    /// Renders `staged` through the service and replaces it with a `.webp`
    /// sibling. The original is only removed once the replacement is in place.
    pub async fn render_to_file(
        &self,
        request: &TransformRequest,
        staged: &Path,
    ) -> Result<PathBuf, RenderError> {
        let url = self.url_for(&request.instruction());
        let mut response = self.send(&url).await?;
        let target = staged.with_extension(RENDERED_EXTENSION);
        let temp_path = temp_path_for(&target);
        if let Err(err) = self.write_body(&mut response, &temp_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&temp_path, &target).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        if target != staged {
            let _ = tokio::fs::remove_file(staged).await;
        }
        debug!(url = %url, path = ?target, "rendered upload");
        Ok(target)
    }

    pub async fn fetch_preview(&self, request: &PreviewRequest) -> Result<reqwest::Response, RenderError> {
        self.send(&self.url_for(&request.instruction())).await
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, RenderError> {
        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(RenderError::UpstreamStatus(response.status()));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_output_bytes {
                return Err(RenderError::TooLarge(self.max_output_bytes));
            }
        }
        Ok(response)
    }

    async fn write_body(
        &self,
        response: &mut reqwest::Response,
        path: &Path,
    ) -> Result<(), RenderError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut total = 0u64;
        while let Some(chunk) = response.chunk().await? {
            total = total.saturating_add(chunk.len() as u64);
            if total > self.max_output_bytes {
                return Err(RenderError::TooLarge(self.max_output_bytes));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

pub async fn probe_image(path: &Path) -> Result<ImageMeta, RenderError> {
    let path = path.to_path_buf();
    task::spawn_blocking(move || probe_image_sync(&path))
        .await
        .map_err(|err| RenderError::Probe(err.to_string()))?
}

fn probe_image_sync(path: &Path) -> Result<ImageMeta, RenderError> {
    let reader = ImageReader::open(path)?
        .with_guessed_format()
        .map_err(RenderError::Io)?;
    let format = reader.format();
    let (width, height) = reader
        .into_dimensions()
        .map_err(|err| RenderError::Probe(err.to_string()))?;
    let animated = match format {
        Some(ImageFormat::Gif) => {
            let decoder = GifDecoder::new(BufReader::new(File::open(path)?))
                .map_err(|err| RenderError::Probe(err.to_string()))?;
            decoder.into_frames().take(2).count() > 1
        }
        Some(ImageFormat::WebP) => WebPDecoder::new(BufReader::new(File::open(path)?))
            .map_err(|err| RenderError::Probe(err.to_string()))?
            .has_animation(),
        _ => false,
    };
    Ok(ImageMeta {
        width,
        height,
        animated,
    })
}
