use crate::clock::SharedClock;
use crate::media::Category;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub animated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: i64,
    pub user_id: Option<i64>,
    pub group_id: i64,
    pub category: Category,
    pub original_filename: String,
    pub path: PathBuf,
    pub mime_type: String,
    pub file_size: u64,
    pub image: Option<ImageMeta>,
    pub expires_at: SystemTime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("file not found")]
    NotFound,
    #[error("file expired")]
    Expired,
    #[error("unauthorized")]
    Unauthorized,
}

#[derive(Clone)]
pub struct PendingRegistry {
    clock: SharedClock,
    inner: Arc<Mutex<HashMap<i64, Reservation>>>,
}

impl PendingRegistry {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn insert(&self, reservation: Reservation) {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(previous) = inner.insert(reservation.id, reservation) {
            warn!(id = previous.id, "pending reservation replaced");
        }
    }

    /// Removes and returns the reservation when it is live and owned by the
    /// caller. A mismatch leaves the entry in place; an expired entry is left
    /// for the sweep, which also owns its file.
    pub fn claim(
        &self,
        id: i64,
        expected_user: i64,
        expected_group: i64,
    ) -> Result<Reservation, ClaimError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let reservation = inner.get(&id).ok_or(ClaimError::NotFound)?;
        if now > reservation.expires_at {
            return Err(ClaimError::Expired);
        }
        if reservation.user_id != Some(expected_user) {
            return Err(ClaimError::Unauthorized);
        }
        if reservation.group_id != 0 && reservation.group_id != expected_group {
            return Err(ClaimError::Unauthorized);
        }
        inner.remove(&id).ok_or(ClaimError::NotFound)
    }

    pub fn sweep(&self) -> Vec<Reservation> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let expired: Vec<i64> = inner
            .values()
            .filter(|reservation| now > reservation.expires_at)
            .map(|reservation| reservation.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| inner.remove(&id))
            .collect()
    }

    pub async fn sweep_and_delete(&self) -> usize {
        let expired = self.sweep();
        for reservation in &expired {
            match tokio::fs::remove_file(&reservation.path).await {
                Ok(()) => debug!(id = reservation.id, path = ?reservation.path, "expired upload removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = ?err, id = reservation.id, path = ?reservation.path, "failed to remove expired upload")
                }
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn expiry_after(&self, ttl: Duration) -> SystemTime {
        self.clock.now() + ttl
    }
}

pub fn spawn_sweeper(
    registry: PendingRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let removed = registry.sweep_and_delete().await;
            if removed > 0 {
                info!(removed, remaining = registry.len(), "pending uploads swept");
            }
        }
        debug!("pending sweeper stopped");
    })
}
