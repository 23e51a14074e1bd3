mod config;
mod download;
mod error;
mod extractor;
mod ranker;
mod routes;

use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::{AppConfig, build_cors_layer},
    download::cleanup_stale_files,
    error::ApiError,
    extractor::YtDlp,
    ranker::RankerConfig,
    routes::{AppState, router},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_fetch=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create transfer directory {:?}: {error}",
                config.transfer_dir
            ))
        })?;
    cleanup_stale_files(&config.transfer_dir, config.stale_download_age).await;

    match config.yt_dlp_timeout {
        Some(limit) => info!("yt-dlp calls time out after {} seconds", limit.as_secs()),
        None => warn!("YT_DLP_TIMEOUT_SECONDS not set: yt-dlp calls run until they finish."),
    }

    let state = AppState {
        extractor: Arc::new(YtDlp::new(config.yt_dlp_bin.clone(), config.yt_dlp_timeout)),
        ranker: Arc::new(RankerConfig::default()),
        transfer_dir: config.transfer_dir.clone(),
    };

    let mut app = router(state).layer(TraceLayer::new_for_http());
    if let Some(cors) = build_cors_layer(&config.allowed_origins)? {
        app = app.layer(cors);
    }

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!("Server ready at http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
