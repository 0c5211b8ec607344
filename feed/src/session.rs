use std::sync::Arc;

use camera_feed_common::slot::FrameSlot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureLoop, CaptureSettings};
use crate::source::CameraSource;

/// Everything one live feed shares between its capture task and HTTP handlers.
///
/// Cloning is cheap and every clone refers to the same slot and stop token,
/// so the session doubles as the axum router state.
#[derive(Clone)]
pub struct FeedSession {
    slot: Arc<FrameSlot>,
    settings: CaptureSettings,
    cancel: CancellationToken,
}

impl FeedSession {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            slot: Arc::new(FrameSlot::new()),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the capture loop on the runtime. It runs until [`stop`](Self::stop).
    pub fn spawn_capture<S>(&self, source: S) -> JoinHandle<()>
    where
        S: CameraSource + 'static,
    {
        let capture = CaptureLoop::new(
            source,
            Arc::clone(&self.slot),
            self.settings,
            self.cancel.clone(),
        );
        tokio::spawn(capture.run())
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the capture loop and every stream subscription to finish.
    /// Calling it again has no effect.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
