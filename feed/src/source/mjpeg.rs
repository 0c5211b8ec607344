use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use camera_feed_common::frame::RawFrame;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{decode_jpeg, CameraSource, SourceError};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Largest amount of unterminated part data buffered before giving up on the
/// connection.
pub const MAX_PART_LEN: usize = 8 * 1024 * 1024;

/// Parse state for a `multipart/x-mixed-replace` body.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting part bytes until the next boundary.
    CollectingPart,
}

/// Incremental parser that splits an MJPEG multipart body into JPEG payloads.
///
/// A part is only complete once the following boundary has been seen, so the
/// newest part is emitted when the next one starts.
pub struct MultipartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    scan_from: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            boundary: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
        }
    }

    /// Feed the next chunk of the body, returning every part it completed.
    ///
    /// Fails once more than [`MAX_PART_LEN`] bytes are buffered without the
    /// next boundary, which usually means the body is not multipart at all.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, SourceError> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + self.boundary.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks.
                        if self.buffer.len() > self.boundary.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - self.boundary.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingPart;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingPart => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], &self.boundary)
                    else {
                        // Don't re-scan what was already searched.
                        self.scan_from = self.buffer.len().saturating_sub(self.boundary.len());
                        break;
                    };
                    let boundary_at = self.scan_from + pos;
                    // Strip the CRLF that precedes the boundary.
                    let end = if self.buffer[..boundary_at].ends_with(b"\r\n") {
                        boundary_at - 2
                    } else {
                        boundary_at
                    };

                    let part = self.buffer.split_to(end).freeze();
                    let _ = self.buffer.split_to(boundary_at - end + self.boundary.len());
                    if !part.is_empty() {
                        parts.push(part);
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        if self.buffer.len() > MAX_PART_LEN {
            self.buffer.clear();
            self.scan_from = 0;
            self.state = ParseState::SeekingBoundary;
            return Err(SourceError::PartTooLarge(MAX_PART_LEN));
        }
        Ok(parts)
    }

    /// End of body. A stream that closes without a final boundary still
    /// carries one whole part, which is returned here.
    pub fn finish(mut self) -> Option<Bytes> {
        if !matches!(self.state, ParseState::CollectingPart) {
            return None;
        }
        if self.buffer.ends_with(b"\r\n") {
            self.buffer.truncate(self.buffer.len() - 2);
        }
        Some(self.buffer.freeze()).filter(|part| !part.is_empty())
    }
}

/// Extract the `boundary` parameter of a multipart content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .map(|value| value.strip_prefix("--").unwrap_or(value))
        .filter(|value| !value.is_empty())
}

/// Follows a remote MJPEG stream in the background and hands the newest
/// JPEG to the capture loop.
pub struct MjpegSource {
    latest: Arc<Mutex<Option<Bytes>>>,
    reader: JoinHandle<()>,
}

impl MjpegSource {
    /// Start reading `url`. The reader reconnects with exponential backoff
    /// until `cancel` fires or the source is dropped.
    ///
    /// `timeout` bounds connecting, waiting for the response headers, and
    /// every gap between body chunks. A stalled upstream counts as an error.
    pub fn connect(
        url: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(SourceError::Http)?;
        let latest = Arc::new(Mutex::new(None));
        let reader = tokio::spawn(run_reader(
            client,
            url.to_string(),
            timeout,
            Arc::clone(&latest),
            cancel,
        ));
        Ok(Self { latest, reader })
    }
}

impl Drop for MjpegSource {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl CameraSource for MjpegSource {
    /// Takes the newest JPEG received since the previous grab, if any.
    async fn grab(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let jpeg = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match jpeg {
            Some(jpeg) => decode_jpeg(jpeg).await.map(Some),
            None => Ok(None),
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

async fn run_reader(
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    latest: Arc<Mutex<Option<Bytes>>>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        info!(url, "connecting to upstream MJPEG stream");
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = consume_stream(&client, &url, timeout, &latest) => result,
        };
        match result {
            Ok(()) => {
                info!("upstream stream ended cleanly, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(error = %e, "upstream stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    debug!(url, "upstream reader stopped");
}

async fn consume_stream(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    latest: &Mutex<Option<Bytes>>,
) -> Result<(), SourceError> {
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| SourceError::Stalled(timeout))?
        .map_err(SourceError::Http)?;
    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    let boundary = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(boundary_from_content_type)
        .unwrap_or(DEFAULT_BOUNDARY)
        .to_string();
    info!(status = %response.status(), boundary, "connected to upstream MJPEG stream");

    let mut parser = MultipartParser::new(&boundary);
    let mut received: u64 = 0;
    let mut body = response.bytes_stream();

    loop {
        let next = tokio::time::timeout(timeout, body.next())
            .await
            .map_err(|_| SourceError::Stalled(timeout))?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(SourceError::Http)?;
        if let Some(jpeg) = parser.push(&chunk)?.pop() {
            received += 1;
            if received % 100 == 0 {
                debug!(received, bytes = jpeg.len(), "upstream frames received");
            }
            *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(jpeg);
        }
    }

    if let Some(jpeg) = parser.finish() {
        debug!(bytes = jpeg.len(), "keeping final part of ended upstream stream");
        *latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(jpeg);
    }
    Ok(())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use axum::routing::get;
    use axum::Router;
    use camera_feed_common::frame::encode_jpeg;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STREAM_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

    async fn spawn_upstream(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn sample_jpeg() -> Vec<u8> {
        encode_jpeg(&RawFrame::new(10, 4, vec![90; 10 * 4 * 3]), 80).unwrap()
    }

    async fn wait_for_frame(source: &mut MjpegSource) -> RawFrame {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(raw) = source.grab().await.unwrap() {
                    return raw;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no frame arrived from upstream")
    }

    fn part(boundary: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!("--{boundary}\r\nContent-Type: image/jpeg\r\n\r\n").into_bytes();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn part_completes_when_next_boundary_arrives() {
        let mut parser = MultipartParser::new("frame");
        assert!(parser.push(&part("frame", b"first")).unwrap().is_empty());
        let parts = parser.push(&part("frame", b"second")).unwrap();
        assert_eq!(parts, vec![Bytes::from_static(b"first")]);
    }

    #[test]
    fn survives_arbitrary_chunking() {
        let bodies: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 50 + i as usize * 13]).collect();
        let mut stream = Vec::new();
        for body in &bodies {
            stream.extend(part("frame", body));
        }
        // Trailing boundary flushes the last part.
        stream.extend_from_slice(b"--frame\r\n");

        for chunk_size in [1, 3, 7, 64, stream.len()] {
            let mut parser = MultipartParser::new("frame");
            let parts: Vec<Bytes> = stream
                .chunks(chunk_size)
                .flat_map(|chunk| parser.push(chunk).unwrap())
                .collect();
            let expected: Vec<Bytes> = bodies.iter().cloned().map(Bytes::from).collect();
            assert_eq!(parts, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn skips_preamble_before_first_boundary() {
        let mut parser = MultipartParser::new("frame");
        let mut stream = b"garbage before the first part".to_vec();
        stream.extend(part("frame", b"payload"));
        stream.extend_from_slice(b"--frame\r\n");
        assert_eq!(parser.push(&stream).unwrap(), vec![Bytes::from_static(b"payload")]);
    }

    #[test]
    fn custom_boundary() {
        let mut parser = MultipartParser::new("myboundary");
        let mut stream = part("myboundary", b"abc");
        stream.extend_from_slice(b"--myboundary\r\n");
        assert_eq!(parser.push(&stream).unwrap(), vec![Bytes::from_static(b"abc")]);
    }

    #[test]
    fn boundary_parameter_parsing() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame"),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=\"--abc\""),
            Some("abc")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary="),
            None
        );
    }

    #[test]
    fn finish_returns_unterminated_last_part() {
        let mut parser = MultipartParser::new("frame");
        let mut stream = part("frame", b"first");
        stream.extend(part("frame", b"last"));
        assert_eq!(parser.push(&stream).unwrap(), vec![Bytes::from_static(b"first")]);
        assert_eq!(parser.finish(), Some(Bytes::from_static(b"last")));
    }

    #[test]
    fn finish_without_open_part_is_empty() {
        let mut parser = MultipartParser::new("frame");
        parser.push(b"--frame\r\nContent-Type: image/jpeg\r\n").unwrap();
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn oversized_part_is_rejected() {
        let mut parser = MultipartParser::new("frame");
        parser
            .push(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n")
            .unwrap();
        let filler = vec![0xAB; 1024 * 1024];
        let mut result = Ok(Vec::new());
        for _ in 0..=MAX_PART_LEN / filler.len() {
            result = parser.push(&filler);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(SourceError::PartTooLarge(MAX_PART_LEN))));

        // The parser starts over and still recognises the next part.
        let mut stream = part("frame", b"after");
        stream.extend_from_slice(b"--frame\r\n");
        assert_eq!(parser.push(&stream).unwrap(), vec![Bytes::from_static(b"after")]);
    }

    #[test]
    fn non_multipart_body_stays_bounded() {
        let mut parser = MultipartParser::new("frame");
        for _ in 0..64 {
            assert!(parser.push(&[b'x'; 4096]).unwrap().is_empty());
        }
        assert!(parser.buffer.len() <= parser.boundary.len());
    }

    #[tokio::test]
    async fn reconnects_after_upstream_stalls() {
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connects);
        let app = Router::new().route(
            "/stream",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let mut first = part("frame", &sample_jpeg());
                    first.extend_from_slice(b"--frame\r\n");
                    let body = stream::once(async move { Ok::<_, Infallible>(Bytes::from(first)) })
                        .chain(stream::pending());
                    ([(header::CONTENT_TYPE, STREAM_TYPE)], Body::from_stream(body))
                }
            }),
        );
        let addr = spawn_upstream(app).await;

        let cancel = CancellationToken::new();
        let mut source = MjpegSource::connect(
            &format!("http://{addr}/stream"),
            Duration::from_millis(200),
            cancel.clone(),
        )
        .unwrap();

        let raw = wait_for_frame(&mut source).await;
        assert_eq!((raw.width, raw.height), (10, 4));

        // Stall detection after 200ms plus the initial 2s backoff.
        tokio::time::timeout(Duration::from_secs(10), async {
            while connects.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("reader never reconnected to the stalled upstream");

        cancel.cancel();
    }

    #[tokio::test]
    async fn keeps_last_part_when_upstream_ends() {
        let app = Router::new().route(
            "/stream",
            get(|| async {
                // One part and no closing boundary, like a feed that shut down.
                let body = part("frame", &sample_jpeg());
                ([(header::CONTENT_TYPE, STREAM_TYPE)], body)
            }),
        );
        let addr = spawn_upstream(app).await;

        let cancel = CancellationToken::new();
        let mut source = MjpegSource::connect(
            &format!("http://{addr}/stream"),
            Duration::from_secs(2),
            cancel.clone(),
        )
        .unwrap();

        let raw = wait_for_frame(&mut source).await;
        assert_eq!((raw.width, raw.height), (10, 4));

        cancel.cancel();
    }
}
