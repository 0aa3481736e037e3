use crate::dimensions::{CropRect, Dimensions, fit_within_bounds};
use crate::media::{Category, ResizeMode};
use thiserror::Error;

const LOCAL_SCHEME: &str = "local:///";
const OUTPUT_SUFFIX: &str = "@webp";
pub const MAX_PREVIEW_SIZE: u32 = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("image has no usable dimensions ({width}x{height})")]
    EmptyDimensions { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub source: String,
    pub mode: ResizeMode,
    pub target: Dimensions,
    pub crop: Option<CropRect>,
}

pub fn build_transform_request(
    category: Category,
    source: &str,
    original: Dimensions,
    crop: Option<CropRect>,
) -> Result<TransformRequest, TransformError> {
    if original.is_empty() {
        return Err(TransformError::EmptyDimensions {
            width: original.width,
            height: original.height,
        });
    }
    let policy = category.policy();
    let max = Dimensions::new(policy.max_width, policy.max_height);
    let target = fit_within_bounds(original, max, max.aspect_ratio());
    Ok(TransformRequest {
        source: source.to_string(),
        mode: policy.mode,
        target,
        crop: crop.filter(|_| policy.croppable),
    })
}

impl TransformRequest {
    pub fn instruction(&self) -> String {
        let mode = match self.mode {
            ResizeMode::Fit => "fit",
            ResizeMode::Fill => "fill",
        };
        let mut parts = vec![format!(
            "rs:{mode}:{}:{}",
            self.target.width, self.target.height
        )];
        if let Some(crop) = self.crop {
            parts.push(format!(
                "crop:{}:{}:nowe:{}:{}",
                crop.width, crop.height, crop.x, crop.y
            ));
        }
        parts.push(plain_source(&self.source));
        format!("{}{OUTPUT_SUFFIX}", parts.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    pub source: String,
    pub first_frame_only: bool,
    pub size: Option<u32>,
}

impl PreviewRequest {
    pub fn from_query(source: &str, size: Option<&str>, kind: Option<&str>) -> Option<Self> {
        let size = size.filter(|value| !value.is_empty());
        let kind = kind.filter(|value| !value.is_empty());
        if size.is_none() && kind.is_none() {
            return None;
        }
        Some(Self {
            source: source.to_string(),
            first_frame_only: kind == Some("webp"),
            size: size
                .and_then(|value| value.trim().parse::<u32>().ok())
                .filter(|value| *value > 0)
                .map(|value| value.min(MAX_PREVIEW_SIZE)),
        })
    }

    pub fn instruction(&self) -> String {
        let mut parts = Vec::new();
        if self.first_frame_only {
            parts.push("page:0".to_string());
        }
        if let Some(size) = self.size {
            parts.push(format!("rs:fit:{size}:{size}"));
        }
        parts.push(plain_source(&self.source));
        format!("{}{OUTPUT_SUFFIX}", parts.join("/"))
    }
}

fn plain_source(source: &str) -> String {
    let source = source.trim_start_matches("./");
    format!("plain/{}", urlencoding::encode(&format!("{LOCAL_SCHEME}{source}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_request_fills_and_crops() {
        let crop = CropRect {
            x: 10,
            y: 10,
            width: 40,
            height: 60,
        };
        let request = build_transform_request(
            Category::Avatars,
            "temp/1234.png",
            Dimensions::new(800, 600),
            Some(crop),
        )
        .unwrap();
        assert_eq!(request.target, Dimensions::new(200, 200));
        assert_eq!(request.mode, ResizeMode::Fill);
        assert_eq!(
            request.instruction(),
            "rs:fill:200:200/crop:40:60:nowe:10:10/plain/local%3A%2F%2F%2Ftemp%2F1234.png@webp"
        );
    }

    #[test]
    fn crop_dropped_for_fit_categories() {
        let crop = CropRect {
            x: 0,
            y: 0,
            width: 5,
            height: 5,
        };
        let request = build_transform_request(
            Category::Emojis,
            "temp/1.gif",
            Dimensions::new(64, 64),
            Some(crop),
        )
        .unwrap();
        assert_eq!(request.crop, None);
        assert_eq!(request.target, Dimensions::new(64, 64));
        assert!(request.instruction().starts_with("rs:fit:64:64/plain/"));
    }

    #[test]
    fn rejects_zero_dimensions() {
        let err = build_transform_request(
            Category::Attachments,
            "temp/1.png",
            Dimensions::new(0, 10),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            TransformError::EmptyDimensions {
                width: 0,
                height: 10
            }
        );
    }

    #[test]
    fn instruction_is_deterministic_and_escapes_spaces() {
        let request = build_transform_request(
            Category::Attachments,
            "./temp/my cat.png",
            Dimensions::new(4000, 3000),
            None,
        )
        .unwrap();
        let first = request.instruction();
        assert_eq!(first, request.instruction());
        assert_eq!(
            first,
            "rs:fit:1920:1080/plain/local%3A%2F%2F%2Ftemp%2Fmy%20cat.png@webp"
        );
    }

    #[test]
    fn preview_from_query() {
        assert_eq!(PreviewRequest::from_query("public/a.png", None, None), None);
        assert_eq!(PreviewRequest::from_query("public/a.png", Some(""), Some("")), None);

        let preview = PreviewRequest::from_query("public/a.gif", Some("128"), Some("webp")).unwrap();
        assert_eq!(
            preview.instruction(),
            "page:0/rs:fit:128:128/plain/local%3A%2F%2F%2Fpublic%2Fa.gif@webp"
        );

        let preview = PreviewRequest::from_query("public/a.png", Some("abc"), None).unwrap();
        assert_eq!(preview.size, None);
        assert!(!preview.first_frame_only);
        assert_eq!(
            preview.instruction(),
            "plain/local%3A%2F%2F%2Fpublic%2Fa.png@webp"
        );

        let preview = PreviewRequest::from_query("public/a.png", Some("999999"), None).unwrap();
        assert_eq!(preview.size, Some(MAX_PREVIEW_SIZE));
    }
}
