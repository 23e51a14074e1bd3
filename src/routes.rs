use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{
    config::is_fetchable_url,
    download::{Attachment, DownloadJob, GuardedStream, TempFile},
    error::ApiError,
    extractor::ExtractionClient,
    ranker::{AudioOption, RankerConfig, VideoOption, rank},
};

const INDEX_HTML: &str = include_str!("../static/index.html");
const STYLE_CSS: &str = include_str!("../static/style.css");
const UNTITLED: &str = "Untitled";

#[derive(Clone)]
pub struct AppState {
    pub extractor: Arc<dyn ExtractionClient>,
    pub ranker: Arc<RankerConfig>,
    pub transfer_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct FormatsRequest {
    url: String,
}

#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    title: String,
    video: Vec<VideoOption>,
    audio: Vec<AudioOption>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: String,
    format_id: String,
    #[serde(default)]
    is_audio: bool,
    #[serde(default)]
    title: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/style.css", get(style))
        .route("/health", get(health))
        .route("/get_formats", post(get_formats))
        .route("/download", post(download))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn style() -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/css; charset=utf-8")], STYLE_CSS)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn validated_url(raw: &str) -> Result<&str, ApiError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("Enter a URL first."));
    }
    if !is_fetchable_url(url) {
        return Err(ApiError::bad_request(
            "Only absolute http(s) URLs can be fetched.",
        ));
    }
    Ok(url)
}

async fn get_formats(
    State(state): State<AppState>,
    payload: Result<Json<FormatsRequest>, JsonRejection>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let Json(payload) = payload?;
    let url = validated_url(&payload.url)?;

    let probe = state.extractor.probe(url).await.map_err(|error| {
        warn!("Error in get_formats for {:?}: {error}", url);
        ApiError::from(error)
    })?;

    let ranked = rank(&probe.formats, &state.ranker);
    info!(
        "Ranked {} formats for {:?} into {} video and {} audio options",
        probe.formats.len(),
        url,
        ranked.video.len(),
        ranked.audio.len()
    );

    Ok(Json(FormatsResponse {
        title: probe
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| UNTITLED.to_string()),
        video: ranked.video,
        audio: ranked.audio,
    }))
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    let url = validated_url(&payload.url)?;
    let job = DownloadJob::new(
        &state.transfer_dir,
        url,
        payload.format_id.trim(),
        payload.is_audio,
    );
    info!(
        "Starting download job {} for {:?} (format {:?}, audio {})",
        job.prefix, job.url, job.format_id, job.is_audio
    );

    let reported_path = match state.extractor.fetch(url, &job.fetch_options()).await {
        Ok(path) => path,
        Err(error) => {
            warn!("Error in download job {}: {error}", job.prefix);
            job.discard_partials().await;
            return Err(error.into());
        }
    };

    let Some(produced) = job.resolve_output(&reported_path).await else {
        warn!(
            "Download job {} has no file of its own at {:?}",
            job.prefix, reported_path
        );
        job.discard_partials().await;
        return Err(ApiError::file_not_found());
    };

    let file = TempFile::new(produced);
    stream_attachment(file, payload.title.as_deref()).await
}

/// Streams `file` as an attachment. The file is deleted when the body is
/// finished or dropped, and on every early return here.
async fn stream_attachment(file: TempFile, title: Option<&str>) -> Result<Response, ApiError> {
    let attachment = Attachment::for_file(file.path(), title);

    let handle = tokio::fs::File::open(file.path()).await.map_err(|error| {
        ApiError::internal(format!("Could not open the downloaded file: {error}"))
    })?;
    let length = handle
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("Could not read file metadata: {error}")))?
        .len();

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(attachment.content_type),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&attachment.content_disposition())
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    if let Ok(value) = HeaderValue::from_str(&urlencoding::encode(&attachment.filename)) {
        headers.insert(HeaderName::from_static("x-download-filename"), value);
    }

    let body = Body::from_stream(GuardedStream::new(ReaderStream::new(handle), file));
    Ok((headers, body).into_response())
}
