use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One captured track. Shared by every link it is attached to; toggling
/// `enabled` mutes it everywhere at once.
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: format!("{kind}-{}", Uuid::new_v4()),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Flip every track of `kind`; returns false when there is none.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut touched = false;
        for track in self.tracks_of(kind) {
            track.set_enabled(enabled);
            touched = true;
        }
        touched
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        video: true,
        audio: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        video: false,
        audio: true,
    };
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("no {0} device available")]
    DeviceNotFound(TrackKind),
    #[error("permission denied for {0}")]
    PermissionDenied(TrackKind),
    #[error("capture failed: {0}")]
    Capture(String),
}

/// Capture capability: `acquire(video, audio) -> stream | failure`.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Devices with fixed availability. Produces tracks without capturing
/// anything, which is all negotiation needs.
#[derive(Debug)]
pub struct StaticMediaDevices {
    camera: bool,
    microphone: bool,
    requests: Mutex<Vec<MediaConstraints>>,
}

impl StaticMediaDevices {
    pub fn new(camera: bool, microphone: bool) -> Self {
        Self {
            camera,
            microphone,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn none() -> Self {
        Self::new(false, false)
    }

    /// Every constraint set asked for so far, oldest first.
    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for StaticMediaDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        self.requests.lock().push(constraints);
        if constraints.video && !self.camera {
            return Err(MediaError::DeviceNotFound(TrackKind::Video));
        }
        if constraints.audio && !self.microphone {
            return Err(MediaError::DeviceNotFound(TrackKind::Audio));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Audio)));
        }
        if constraints.video {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video)));
        }
        Ok(LocalStream::new(tracks))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaMode {
    AudioVideo,
    AudioOnly,
    NoMedia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaStatus {
    pub mode: MediaMode,
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub stream: Arc<LocalStream>,
    pub mode: MediaMode,
}

impl LocalMedia {
    pub fn status(&self) -> MediaStatus {
        let enabled = |kind| self.stream.tracks_of(kind).any(|track| track.is_enabled());
        MediaStatus {
            mode: self.mode,
            video_enabled: enabled(TrackKind::Video),
            audio_enabled: enabled(TrackKind::Audio),
        }
    }
}

/// Video+audio, then audio only, then nothing. Never fails.
pub async fn acquire_with_fallback(devices: &dyn MediaDevices) -> LocalMedia {
    match devices.acquire(MediaConstraints::AUDIO_VIDEO).await {
        Ok(stream) => {
            debug!(target = "tidepool::media", tracks = stream.tracks().len(), "acquired audio+video");
            return LocalMedia {
                stream: Arc::new(stream),
                mode: MediaMode::AudioVideo,
            };
        }
        Err(err) => {
            info!(target = "tidepool::media", error = %err, "audio+video unavailable; trying audio only");
        }
    }
    match devices.acquire(MediaConstraints::AUDIO_ONLY).await {
        Ok(stream) => LocalMedia {
            stream: Arc::new(stream),
            mode: MediaMode::AudioOnly,
        },
        Err(err) => {
            warn!(target = "tidepool::media", error = %err, "no local media; continuing without tracks");
            LocalMedia {
                stream: Arc::new(LocalStream::empty()),
                mode: MediaMode::NoMedia,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_capture_when_everything_is_present() {
        let devices = StaticMediaDevices::new(true, true);
        let media = acquire_with_fallback(&devices).await;
        assert_eq!(media.mode, MediaMode::AudioVideo);
        assert!(media.stream.has(TrackKind::Video));
        assert!(media.stream.has(TrackKind::Audio));
        assert_eq!(devices.requests(), vec![MediaConstraints::AUDIO_VIDEO]);
    }

    #[tokio::test]
    async fn missing_camera_degrades_to_audio_only() {
        let devices = StaticMediaDevices::new(false, true);
        let media = acquire_with_fallback(&devices).await;
        assert_eq!(media.mode, MediaMode::AudioOnly);
        let status = media.status();
        assert!(!status.video_enabled);
        assert!(status.audio_enabled);
        assert_eq!(
            devices.requests(),
            vec![MediaConstraints::AUDIO_VIDEO, MediaConstraints::AUDIO_ONLY]
        );
    }

    #[tokio::test]
    async fn no_devices_yields_empty_stream() {
        let devices = StaticMediaDevices::none();
        let media = acquire_with_fallback(&devices).await;
        assert_eq!(media.mode, MediaMode::NoMedia);
        assert!(media.stream.is_empty());
    }

    #[test]
    fn toggles_apply_to_shared_tracks() {
        let stream = LocalStream::new(vec![Arc::new(LocalTrack::new(TrackKind::Audio))]);
        assert!(stream.set_enabled(TrackKind::Audio, false));
        assert!(!stream.tracks()[0].is_enabled());
        assert!(!stream.set_enabled(TrackKind::Video, false));
    }
}
