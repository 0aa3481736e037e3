use serde::Serialize;
use std::path::{Component, Path};

const IMAGE_EXTENSIONS: &[&str] = &["webp", "png", "jpg", "jpeg", "gif"];
const AUDIO_VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "ogg", "mp3", "wav"];
const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Attachments,
    Emojis,
    Avatars,
    ProfileBanners,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    Fit,
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryPolicy {
    pub max_width: u32,
    pub max_height: u32,
    pub mode: ResizeMode,
    pub croppable: bool,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Attachments,
        Category::Emojis,
        Category::Avatars,
        Category::ProfileBanners,
    ];

    pub fn from_segment(segment: &str) -> Option<Self> {
        let segment = segment.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_segment() == segment)
    }

    pub fn as_segment(self) -> &'static str {
        match self {
            Category::Attachments => "attachments",
            Category::Emojis => "emojis",
            Category::Avatars => "avatars",
            Category::ProfileBanners => "profile_banners",
        }
    }

    pub fn policy(self) -> CategoryPolicy {
        match self {
            Category::Attachments => CategoryPolicy {
                max_width: 1920,
                max_height: 1080,
                mode: ResizeMode::Fit,
                croppable: false,
            },
            Category::Emojis => CategoryPolicy {
                max_width: 100,
                max_height: 100,
                mode: ResizeMode::Fit,
                croppable: false,
            },
            Category::Avatars => CategoryPolicy {
                max_width: 200,
                max_height: 200,
                mode: ResizeMode::Fill,
                croppable: true,
            },
            Category::ProfileBanners => CategoryPolicy {
                max_width: 1920,
                max_height: 1080,
                mode: ResizeMode::Fill,
                croppable: true,
            },
        }
    }

    pub fn requires_image(self) -> bool {
        self != Category::Attachments
    }
}

pub fn safe_filename(filename: &str) -> String {
    let name: String = filename
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    match Path::new(&name).components().next() {
        Some(Component::Normal(_)) => name,
        _ => "unnamed".to_string(),
    }
}

// Dotfiles count: `.png` has the extension `png`.
fn dotted_extension(filename: &str) -> Option<&str> {
    let (_, ext) = filename.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= MAX_EXTENSION_LEN && !ext.contains(['/', '\\']))
        .then_some(ext)
}

pub fn extension_of(filename: &str) -> String {
    dotted_extension(filename)
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

pub fn is_image_path(path: &Path) -> bool {
    has_extension(path, IMAGE_EXTENSIONS)
}

pub fn is_audio_video_path(path: &Path) -> bool {
    has_extension(path, AUDIO_VIDEO_EXTENSIONS)
}

pub fn is_image_filename(filename: &str) -> bool {
    is_image_path(Path::new(filename))
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(dotted_extension)
        .is_some_and(|ext| allowed.iter().any(|candidate| candidate.eq_ignore_ascii_case(ext)))
}
