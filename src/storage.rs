use crate::media::{Category, extension_of, safe_filename};
use crate::pending::Reservation;
use anyhow::{Context, Result};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path escapes the storage root")]
    Forbidden,
    #[error("file not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    staging: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf, staging: PathBuf) -> Self {
        Self { root, staging }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Reservations do not survive a restart, so neither do their files.
    pub async fn reset_staging(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.staging).await {
            Ok(()) => info!(dir = ?self.staging, "staging directory flushed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("flush {}", self.staging.display()));
            }
        }
        tokio::fs::create_dir_all(&self.staging)
            .await
            .with_context(|| format!("create {}", self.staging.display()))?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("create {}", self.root.display()))?;
        Ok(())
    }

    pub fn staged_path(&self, id: i64, extension: &str) -> PathBuf {
        self.staging.join(format!("{id}{extension}"))
    }

    pub fn resolve(&self, request_path: &str) -> Result<PathBuf, StorageError> {
        let mut segments = Vec::new();
        for raw in request_path.split('/').filter(|raw| !raw.is_empty()) {
            let segment = urlencoding::decode(raw).map_err(|_| StorageError::Forbidden)?;
            segments.push(segment.into_owned());
        }
        self.join_segments(segments.iter().map(String::as_str))
    }

    pub fn resolve_plain(&self, path: &str) -> Result<PathBuf, StorageError> {
        self.join_segments(path.split('/').filter(|segment| !segment.is_empty()))
    }

    fn join_segments<'a>(
        &self,
        segments: impl Iterator<Item = &'a str>,
    ) -> Result<PathBuf, StorageError> {
        let mut resolved = self.root.clone();
        let mut count = 0usize;
        for segment in segments {
            if segment == "."
                || segment == ".."
                || segment.contains(['/', '\\', '\0'])
                || !matches!(
                    Path::new(segment).components().next(),
                    Some(Component::Normal(_))
                )
            {
                return Err(StorageError::Forbidden);
            }
            resolved.push(segment);
            count += 1;
        }
        if count == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(resolved)
    }

    pub async fn locate(&self, path: PathBuf) -> Result<(PathBuf, Metadata), StorageError> {
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_file() {
            return Err(StorageError::NotFound);
        }
        let canonical_root = tokio::fs::canonicalize(&self.root).await?;
        let canonical = tokio::fs::canonicalize(&path).await?;
        if !canonical.starts_with(&canonical_root) {
            return Err(StorageError::Forbidden);
        }
        Ok((path, metadata))
    }

    pub fn public_path(&self, reservation: &Reservation) -> PathBuf {
        let staged_ext = reservation
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let id = reservation.id;
        let owner = reservation.user_id.unwrap_or_default();
        let category = PathBuf::from(reservation.category.as_segment());
        match reservation.category {
            Category::Attachments => {
                let name = safe_filename(&reservation.original_filename);
                let name = if extension_of(&name).eq_ignore_ascii_case(&staged_ext) {
                    name
                } else {
                    let stem = Path::new(&name)
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .unwrap_or("unnamed")
                        .to_string();
                    format!("{stem}{staged_ext}")
                };
                category
                    .join(reservation.group_id.to_string())
                    .join(id.to_string())
                    .join(name)
            }
            Category::Emojis => category.join(format!("{id}{staged_ext}")),
            Category::Avatars | Category::ProfileBanners => category
                .join(owner.to_string())
                .join(format!("{id}{staged_ext}")),
        }
    }

    pub async fn promote(&self, reservation: &Reservation) -> Result<PathBuf, StorageError> {
        let relative = self.public_path(reservation);
        let destination = self.root.join(&relative);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_file(&reservation.path, &destination).await?;
        debug!(id = reservation.id, path = ?destination, "upload promoted");
        Ok(relative)
    }
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload");
    let nonce: u64 = rand::random();
    parent.join(format!(".{file_name}.tmp-{nonce:016x}"))
}

async fn move_file(from: &Path, to: &Path) -> Result<(), StorageError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
        Err(_) => {
            // Staging and root may sit on different filesystems.
            let temp_path = temp_path_for(to);
            if let Err(err) = tokio::fs::copy(from, &temp_path).await {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
            if let Err(err) = tokio::fs::rename(&temp_path, to).await {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
            let _ = tokio::fs::remove_file(from).await;
            Ok(())
        }
    }
}
