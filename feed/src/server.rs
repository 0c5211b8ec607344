use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use camera_feed_common::frame::EncodedFrame;
use camera_feed_common::slot::FrameSlot;
use futures_util::{stream, Stream};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::session::FeedSession;

pub const BOUNDARY: &str = "frame";
const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const NO_CACHE: &str = "no-cache, no-store, must-revalidate";
const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub streaming: bool,
    pub fps: u32,
    pub quality: u8,
}

pub fn router(session: FeedSession) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(video_stream))
        .route("/snapshot", get(snapshot))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(session)
}

/// Serve until the session is stopped. Open streams end on their own once
/// the stop token fires, which lets the graceful shutdown complete.
pub async fn serve(listener: TcpListener, session: FeedSession) -> std::io::Result<()> {
    let shutdown = session.cancel_token().cancelled_owned();
    axum::serve(listener, router(session))
        .with_graceful_shutdown(shutdown)
        .await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /, dashboard page embedding the live stream
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /stream, MJPEG over multipart/x-mixed-replace
async fn video_stream(State(session): State<FeedSession>) -> impl IntoResponse {
    debug!("stream subscriber connected");
    let parts = frame_stream(
        Arc::clone(session.slot()),
        session.cancel_token(),
        session.settings().frame_interval(),
    );
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, NO_CACHE),
        ],
        Body::from_stream(parts),
    )
}

/// GET /snapshot, the current frame as a single JPEG, 503 before the first one
pub async fn snapshot(State(session): State<FeedSession>) -> impl IntoResponse {
    match session.slot().read() {
        Some(frame) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, NO_CACHE),
            ],
            frame.jpeg_data,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response(),
    }
}

/// GET /status
async fn status(State(session): State<FeedSession>) -> Json<StatusReport> {
    Json(status_report(&session))
}

pub fn status_report(session: &FeedSession) -> StatusReport {
    let settings = session.settings();
    StatusReport {
        streaming: session.slot().has_frame(),
        fps: settings.fps,
        quality: settings.quality,
    }
}

// ---------------------------------------------------------------------------
// Continuous stream
// ---------------------------------------------------------------------------

/// Per-connection pacing state. Nothing here is shared with other subscribers.
struct Subscription {
    slot: Arc<FrameSlot>,
    cancel: CancellationToken,
    interval: Duration,
    started: bool,
}

/// Infinite stream of multipart parts, one per `interval`, each carrying
/// whatever frame is current at that moment.
///
/// Nothing is emitted until a first frame exists. The same frame is resent
/// if the producer has not published since the previous part. The stream
/// ends when `cancel` fires; a client disconnect drops it.
pub fn frame_stream(
    slot: Arc<FrameSlot>,
    cancel: CancellationToken,
    interval: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let subscription = Subscription {
        slot,
        cancel,
        interval,
        started: false,
    };

    stream::unfold(subscription, |mut sub| async move {
        loop {
            if sub.started {
                tokio::select! {
                    _ = sub.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(sub.interval) => {}
                }
            }
            sub.started = true;

            if sub.cancel.is_cancelled() {
                return None;
            }
            // The slot lock is held only inside read(), never across the sleep.
            if let Some(frame) = sub.slot.read() {
                return Some((Ok(multipart_part(&frame)), sub));
            }
        }
    })
}

/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn multipart_part(frame: &EncodedFrame) -> Bytes {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.jpeg_data);
    part.put_slice(b"\r\n");
    part.freeze()
}
