use std::sync::Arc;
use std::time::Duration;

use camera_feed_common::config::StreamConfig;
use camera_feed_common::frame::{encode_jpeg, EncodeError, EncodedFrame};
use camera_feed_common::slot::FrameSlot;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::source::{CameraSource, SourceError};

/// Capture parameters, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub fps: u32,
    pub quality: u8,
    /// Delay before the first grab, for cameras that need time after opening.
    pub warmup: Duration,
}

impl CaptureSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

impl From<&StreamConfig> for CaptureSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            fps: config.fps,
            quality: config.quality,
            warmup: config.warmup(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera returned no frame")]
    NoFrame,
    #[error("camera source error: {0}")]
    Source(#[from] SourceError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("encode task failed: {0}")]
    Join(String),
}

/// The producer side of a session: polls the camera, encodes, publishes.
///
/// Every per-iteration failure is logged and retried on the next tick, and
/// the slot keeps the last good frame. Pacing sleeps `interval - elapsed`,
/// so slow iterations lower the frame rate instead of queueing work.
pub struct CaptureLoop<S> {
    source: S,
    slot: Arc<FrameSlot>,
    settings: CaptureSettings,
    cancel: CancellationToken,
}

impl<S: CameraSource> CaptureLoop<S> {
    pub fn new(
        source: S,
        slot: Arc<FrameSlot>,
        settings: CaptureSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            slot,
            settings,
            cancel,
        }
    }

    /// Run until the cancellation token fires. The slot is left untouched on exit.
    pub async fn run(mut self) {
        let interval = self.settings.frame_interval();
        info!(
            source = self.source.name(),
            fps = self.settings.fps,
            quality = self.settings.quality,
            "starting capture loop"
        );

        if !self.settings.warmup.is_zero() {
            debug!(
                warmup_ms = self.settings.warmup.as_millis() as u64,
                "waiting for camera to initialize"
            );
            if !sleep_unless_cancelled(&self.cancel, self.settings.warmup).await {
                info!("capture loop cancelled during warm-up");
                return;
            }
        }

        let mut seq: u64 = 0;
        let mut published: u64 = 0;
        let mut failures: u64 = 0;

        while !self.cancel.is_cancelled() {
            let started = Instant::now();

            match self.capture_once(seq).await {
                Ok(frame) => {
                    debug!(
                        seq,
                        bytes = frame.len(),
                        captured_at_ms = frame.captured_at_ms,
                        "publishing frame"
                    );
                    self.slot.publish(frame);
                    published += 1;
                    if published % 100 == 0 {
                        debug!(published, failures, "frames published");
                    }
                }
                Err(CaptureError::NoFrame) => {
                    failures += 1;
                    debug!(seq, "no frame available from camera");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, seq, "error capturing frame");
                }
            }
            seq += 1;

            if let Some(remaining) = interval.checked_sub(started.elapsed()) {
                if !sleep_unless_cancelled(&self.cancel, remaining).await {
                    break;
                }
            }
        }

        info!(published, failures, "capture loop stopped");
    }

    async fn capture_once(&mut self, seq: u64) -> Result<EncodedFrame, CaptureError> {
        let raw = self.source.grab().await?.ok_or(CaptureError::NoFrame)?;
        let quality = self.settings.quality;
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&raw, quality))
            .await
            .map_err(|e| CaptureError::Join(e.to_string()))??;
        Ok(EncodedFrame::new(jpeg, seq, Utc::now().timestamp_millis()))
    }
}

/// Returns `false` if the token fired before `duration` elapsed.
async fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
