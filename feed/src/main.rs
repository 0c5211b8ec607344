mod capture;
mod server;
mod session;
mod source;

use camera_feed_common::config::Config;
use capture::CaptureSettings;
use session::FeedSession;
use source::ConfiguredSource;
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        source = ?config.camera.source,
        fps = config.stream.fps,
        quality = config.stream.quality,
        "starting camera feed"
    );

    let session = FeedSession::new(CaptureSettings::from(&config.stream));

    let source = match ConfiguredSource::from_config(&config.camera, session.cancel_token()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open camera source");
            std::process::exit(1);
        }
    };
    let capture = session.spawn_capture(source);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    info!(addr, "camera feed server listening");

    let signal_session = session.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown requested");
        signal_session.stop();
    });

    if let Err(e) = server::serve(listener, session.clone()).await {
        error!(error = %e, "HTTP server failed");
    }
    session.stop();

    if let Err(e) = capture.await {
        error!(error = %e, "capture task failed");
    }
    info!("camera feed stopped");
}
