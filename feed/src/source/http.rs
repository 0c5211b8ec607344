use std::time::Duration;

use camera_feed_common::frame::RawFrame;
use reqwest::StatusCode;
use tracing::debug;

use super::{decode_jpeg, CameraSource, SourceError};

/// Polls a remote still-image endpoint (e.g. a robot's `/snapshot`) once per grab.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    /// `timeout` bounds each whole request, so a stalled camera costs at most
    /// one timeout per capture tick.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(SourceError::Http)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl CameraSource for HttpSource {
    async fn grab(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(SourceError::Http)?;

        // The upstream has no frame yet either.
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            debug!(url = self.url, "remote camera has no frame yet");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::HttpStatus(response.status().as_u16()));
        }

        let jpeg = response.bytes().await.map_err(SourceError::Http)?;
        if jpeg.is_empty() {
            return Ok(None);
        }
        decode_jpeg(jpeg).await.map(Some)
    }

    fn name(&self) -> &str {
        "http"
    }
}
