use serde::Serialize;
use thiserror::Error;

pub const MAX_CROP_COORDINATE: f64 = 9999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CropError {
    #[error("crop points must be a JSON array of numbers")]
    Malformed,
    #[error("expected 4 crop points, got {0}")]
    WrongCount(usize),
    #[error("crop point out of range")]
    OutOfRange,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

/// Largest `aspect_ratio` rectangle inside `original`, then scaled down (never
/// up) until it also fits `max`. Inputs must be non-zero and the ratio finite.
pub fn fit_within_bounds(original: Dimensions, max: Dimensions, aspect_ratio: f64) -> Dimensions {
    let original_width = original.width as f64;
    let original_height = original.height as f64;
    let (target_width, target_height) = if original.aspect_ratio() > aspect_ratio {
        (original_height * aspect_ratio, original_height)
    } else {
        (original_width, original_width / aspect_ratio)
    };
    let width_scale = max.width as f64 / target_width;
    let height_scale = max.height as f64 / target_height;
    let scale = width_scale.min(height_scale).min(1.0);
    Dimensions {
        width: (target_width * scale).round() as u32,
        height: (target_height * scale).round() as u32,
    }
}

pub fn points_to_crop(points: &[f64]) -> Result<CropRect, CropError> {
    let [x0, y0, x1, y1] = points else {
        return Err(CropError::WrongCount(points.len()));
    };
    if points
        .iter()
        .any(|point| !point.is_finite() || *point < 0.0 || *point > MAX_CROP_COORDINATE)
    {
        return Err(CropError::OutOfRange);
    }
    Ok(CropRect {
        x: x0.round() as u32,
        y: y0.round() as u32,
        width: (x1 - x0).abs().round() as u32,
        height: (y1 - y0).abs().round() as u32,
    })
}

pub fn parse_crop_points(raw: Option<&str>) -> Result<Option<CropRect>, CropError> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    let points: Vec<f64> = serde_json::from_str(raw).map_err(|_| CropError::Malformed)?;
    points_to_crop(&points).map(Some)
}
