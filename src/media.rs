//! Захват локального медиа для роли streamer.

use crate::peer::types::TrackKind;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacingConstraint {
    pub mode: FacingMode,
    /// При `exact` без такой камеры захват невозможен
    #[serde(default)]
    pub exact: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub facing_mode: Option<FacingConstraint>,
}

fn enabled() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub video: VideoConstraints,
    #[serde(default = "enabled")]
    pub audio: bool,
}

impl Constraints {
    /// Задняя камера, строго
    pub fn rear_camera() -> Self {
        Self {
            video: VideoConstraints {
                enabled: true,
                facing_mode: Some(FacingConstraint {
                    mode: FacingMode::Environment,
                    exact: true,
                }),
            },
            audio: true,
        }
    }

    /// Любая камера
    pub fn any_camera() -> Self {
        Self {
            video: VideoConstraints {
                enabled: true,
                facing_mode: None,
            },
            audio: true,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("requested device not found")]
    NotFound,
    #[error("constraint `{0}` cannot be satisfied")]
    Overconstrained(String),
    #[error("{0}")]
    Other(String),
}

impl MediaError {
    /// Ошибки, после которых пробуем ослабленные ограничения
    pub fn is_unsatisfiable(&self) -> bool {
        matches!(self, MediaError::NotFound | MediaError::Overconstrained(_))
    }
}

/// Локальный трек для отправки
#[derive(Clone)]
pub struct MediaTrack {
    pub kind: TrackKind,
    pub track: Arc<dyn TrackLocal + Send + Sync>,
}

/// Захваченный локальный источник
pub trait LocalMedia: Send + Sync {
    fn id(&self) -> &str;
    fn tracks(&self) -> Vec<MediaTrack>;
    /// Освобождает устройство; повторный вызов безвреден
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    async fn acquire(&self, constraints: &Constraints) -> Result<Arc<dyn LocalMedia>, MediaError>;
}

/// Основной профиль; при неудовлетворимых ограничениях ровно одна попытка с запасным
pub async fn acquire_with_fallback(
    acquirer: &dyn MediaAcquirer,
    primary: &Constraints,
    fallback: &Constraints,
) -> Result<Arc<dyn LocalMedia>, MediaError> {
    match acquirer.acquire(primary).await {
        Ok(media) => {
            info!(media = media.id(), "Stream obtained with primary constraints");
            Ok(media)
        }
        Err(e) if e.is_unsatisfiable() => {
            warn!("Primary constraints unsatisfiable ({e}), falling back to default camera");
            let media = acquirer.acquire(fallback).await?;
            info!(media = media.id(), "Stream obtained with fallback constraints");
            Ok(media)
        }
        Err(e) => Err(e),
    }
}

/// ========== SAMPLE MEDIA ==========

/// VP8 + Opus треки, в которые внешний конвейер захвата пишет сэмплы
pub struct SampleMedia {
    id: String,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio: Option<Arc<TrackLocalStaticSample>>,
    stopped: AtomicBool,
}

impl SampleMedia {
    pub fn new(id: impl Into<String>, video: bool, audio: bool) -> Self {
        let id = id.into();
        let video = video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                id.clone(),
            ))
        });
        let audio = audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                id.clone(),
            ))
        });
        Self {
            id,
            video,
            audio,
            stopped: AtomicBool::new(false),
        }
    }

    /// После `stop` сэмплы отбрасываются
    pub async fn write_sample(&self, kind: TrackKind, data: Bytes, duration: Duration) -> crate::Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let track = match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        };
        if let Some(track) = track {
            track
                .write_sample(&Sample {
                    data,
                    duration,
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }
}

impl LocalMedia for SampleMedia {
    fn id(&self) -> &str {
        &self.id
    }

    fn tracks(&self) -> Vec<MediaTrack> {
        let mut tracks = Vec::new();
        if let Some(v) = &self.video {
            tracks.push(MediaTrack {
                kind: TrackKind::Video,
                track: v.clone(),
            });
        }
        if let Some(a) = &self.audio {
            tracks.push(MediaTrack {
                kind: TrackKind::Audio,
                track: a.clone(),
            });
        }
        tracks
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(media = %self.id, "Local tracks stopped");
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Набор устройств, против которого разрешаются ограничения
#[derive(Debug, Clone)]
pub struct StaticDevices {
    pub cameras: Vec<FacingMode>,
    pub microphone: bool,
}

impl StaticDevices {
    pub fn new(cameras: Vec<FacingMode>, microphone: bool) -> Self {
        Self {
            cameras,
            microphone,
        }
    }
}

#[async_trait]
impl MediaAcquirer for StaticDevices {
    async fn acquire(&self, constraints: &Constraints) -> Result<Arc<dyn LocalMedia>, MediaError> {
        if constraints.video.enabled {
            if self.cameras.is_empty() {
                return Err(MediaError::NotFound);
            }
            if let Some(facing) = constraints.video.facing_mode {
                if facing.exact && !self.cameras.contains(&facing.mode) {
                    return Err(MediaError::Overconstrained("facingMode".into()));
                }
            }
        }
        if constraints.audio && !self.microphone {
            return Err(MediaError::NotFound);
        }
        let id = crate::utils::random_id();
        Ok(Arc::new(SampleMedia::new(
            id,
            constraints.video.enabled,
            constraints.audio,
        )))
    }
}
