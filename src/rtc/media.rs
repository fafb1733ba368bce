use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::negotiation::engine::{MediaConstraints, MediaHandle, MediaSource, TrackKind};
use crate::negotiation::error::DeviceError;

/// Hands out media handles describing the requested tracks without opening a
/// real device.
#[derive(Debug, Default)]
pub struct SyntheticMedia {
    next_id: AtomicU64,
}

impl SyntheticMedia {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaSource for SyntheticMedia {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, DeviceError> {
        let mut tracks = vec![];
        if constraints.audio {
            tracks.push(TrackKind::Audio);
        }
        if constraints.video {
            tracks.push(TrackKind::Video);
        }
        if tracks.is_empty() {
            return Err(DeviceError::Unavailable);
        }

        let id = format!("synthetic-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        info!("Acquired {} with tracks {:?}", id, tracks);
        Ok(MediaHandle { id, tracks })
    }

    fn release(&self, handle: MediaHandle) {
        info!("Released {}", handle.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_follow_constraints() {
        let media = SyntheticMedia::new();

        let handle = media.acquire(&MediaConstraints::default()).await.unwrap();
        assert_eq!(handle.tracks, vec![TrackKind::Video]);

        let both = MediaConstraints {
            audio: true,
            video: true,
        };
        let handle = media.acquire(&both).await.unwrap();
        assert_eq!(handle.tracks, vec![TrackKind::Audio, TrackKind::Video]);
    }

    #[tokio::test]
    async fn nothing_requested_is_unavailable() {
        let none = MediaConstraints {
            audio: false,
            video: false,
        };
        let err = SyntheticMedia::new().acquire(&none).await.unwrap_err();
        assert!(matches!(err, DeviceError::Unavailable));
    }
}
