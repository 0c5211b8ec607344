pub mod http;
pub mod mjpeg;
pub mod pattern;

use std::future::Future;
use std::io::Cursor;

use bytes::Bytes;
use camera_feed_common::config::{CameraConfig, SourceKind};
use camera_feed_common::frame::RawFrame;
use image::ImageReader;
use tokio_util::sync::CancellationToken;

use self::http::HttpSource;
use self::mjpeg::MjpegSource;
use self::pattern::TestPattern;

/// Something the capture loop can poll for the newest camera image.
///
/// `Ok(None)` means no frame is available this tick, which the capture loop
/// treats as a transient condition. Implementations must bound how long a
/// single `grab` can block.
pub trait CameraSource: Send {
    fn grab(&mut self) -> impl Future<Output = Result<Option<RawFrame>, SourceError>> + Send;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("failed to decode JPEG: {0}")]
    Decode(String),
    #[error("decode task failed: {0}")]
    Join(String),
    #[error("upstream sent nothing for {0:?}")]
    Stalled(std::time::Duration),
    #[error("multipart part exceeds {0} bytes without a boundary")]
    PartTooLarge(usize),
}

/// The source selected by `[camera] source`.
pub enum ConfiguredSource {
    TestPattern(TestPattern),
    Http(HttpSource),
    Mjpeg(MjpegSource),
}

impl ConfiguredSource {
    /// Build the configured source. Background work owned by the source (the
    /// MJPEG reader) stops when `cancel` fires.
    pub fn from_config(
        config: &CameraConfig,
        cancel: CancellationToken,
    ) -> Result<Self, SourceError> {
        let source = match config.source {
            SourceKind::TestPattern => {
                Self::TestPattern(TestPattern::new(config.width, config.height))
            }
            SourceKind::Http => Self::Http(HttpSource::new(&config.url, config.timeout())?),
            SourceKind::Mjpeg => {
                Self::Mjpeg(MjpegSource::connect(&config.url, config.timeout(), cancel)?)
            }
        };
        Ok(source)
    }
}

impl CameraSource for ConfiguredSource {
    async fn grab(&mut self) -> Result<Option<RawFrame>, SourceError> {
        match self {
            Self::TestPattern(s) => s.grab().await,
            Self::Http(s) => s.grab().await,
            Self::Mjpeg(s) => s.grab().await,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::TestPattern(s) => s.name(),
            Self::Http(s) => s.name(),
            Self::Mjpeg(s) => s.name(),
        }
    }
}

/// Decode a JPEG into a raw RGB frame on the blocking pool.
pub(crate) async fn decode_jpeg(jpeg: Bytes) -> Result<RawFrame, SourceError> {
    tokio::task::spawn_blocking(move || {
        let img = ImageReader::new(Cursor::new(&jpeg[..]))
            .with_guessed_format()
            .map_err(|e| SourceError::Decode(e.to_string()))?
            .decode()
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(RawFrame::from(img.to_rgb8()))
    })
    .await
    .map_err(|e| SourceError::Join(e.to_string()))?
}
