//! Per-request download jobs and the temporary files they produce.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use futures::Stream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::extractor::{AudioCodec, FetchOptions, Transcode};

pub const AUDIO_CODEC: AudioCodec = AudioCodec::Mp3;
pub const AUDIO_QUALITY_KBPS: u32 = 192;

/// One download request. The prefix keeps concurrent jobs apart inside the
/// shared transfer directory.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub format_id: String,
    pub is_audio: bool,
    pub prefix: Uuid,
    transfer_dir: PathBuf,
}

impl DownloadJob {
    pub fn new(
        transfer_dir: &Path,
        url: impl Into<String>,
        format_id: impl Into<String>,
        is_audio: bool,
    ) -> Self {
        Self {
            url: url.into(),
            format_id: format_id.into(),
            is_audio,
            prefix: Uuid::new_v4(),
            transfer_dir: transfer_dir.to_path_buf(),
        }
    }

    /// Audio jobs always land on the codec's extension; video keeps whatever
    /// container the toolchain picks.
    pub fn output_template(&self) -> String {
        let ext = if self.is_audio {
            AUDIO_CODEC.extension()
        } else {
            "%(ext)s"
        };
        self.transfer_dir
            .join(format!("{}.{ext}", self.prefix))
            .to_string_lossy()
            .into_owned()
    }

    pub fn fetch_options(&self) -> FetchOptions {
        let postprocessing = if self.is_audio {
            vec![Transcode {
                codec: AUDIO_CODEC,
                quality_kbps: AUDIO_QUALITY_KBPS,
            }]
        } else {
            Vec::new()
        };

        FetchOptions {
            format_selector: Some(self.format_id.clone()).filter(|id| !id.trim().is_empty()),
            output_template: self.output_template(),
            postprocessing,
        }
    }

    /// Removes leftovers of a failed fetch (`.part` files, intermediates).
    pub async fn discard_partials(&self) {
        let prefix = self.prefix.to_string();
        let mut entries = match tokio::fs::read_dir(&self.transfer_dir).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("Could not open transfer directory for cleanup: {error}");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let matches_job = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix));
            if matches_job {
                remove_quietly(&entry.path()).await;
            }
        }
    }

    /// Accepts the path the toolchain reported only if it is a regular file
    /// directly inside the transfer directory and named with this job's
    /// prefix. Returns the canonical path.
    pub async fn resolve_output(&self, reported: &Path) -> Option<PathBuf> {
        let canonical_dir = tokio::fs::canonicalize(&self.transfer_dir).await.ok()?;
        let canonical = match tokio::fs::canonicalize(reported).await {
            Ok(path) => path,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!("Could not resolve reported path {:?}: {error}", reported);
                }
                return None;
            }
        };

        let owned_by_job = canonical.parent() == Some(canonical_dir.as_path())
            && canonical
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&self.prefix.to_string()));
        if !owned_by_job {
            warn!(
                "Job {} reported a file outside its own namespace: {:?}",
                self.prefix, canonical
            );
            return None;
        }

        let metadata = tokio::fs::metadata(&canonical).await.ok()?;
        metadata.is_file().then_some(canonical)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not delete temporary file {:?}: {error}", path);
    }
}

/// Owns a downloaded file and deletes it exactly once when dropped.
#[derive(Debug)]
pub struct TempFile {
    path: Option<PathBuf>,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };

        match std::fs::remove_file(&path) {
            Ok(()) => info!("Deleted downloaded file: {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not delete downloaded file {:?}: {error}", path),
        }
    }
}

/// Body stream that keeps its [`TempFile`] alive until the response is
/// finished or abandoned.
pub struct GuardedStream<S> {
    inner: S,
    _file: TempFile,
}

impl<S> GuardedStream<S> {
    pub fn new(inner: S, file: TempFile) -> Self {
        Self { inner, _file: file }
    }
}

impl<S> Stream for GuardedStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Deletes leftovers older than `older_than` from a previous run.
pub async fn cleanup_stale_files(transfer_dir: &Path, older_than: Duration) {
    if older_than.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(transfer_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open transfer directory for cleanup: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate transfer directory: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than || !metadata.is_file() {
            continue;
        }

        remove_quietly(&path).await;
    }
}

/// How a produced file is offered to the browser.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: &'static str,
}

impl Attachment {
    /// Names the attachment after the media title when one is given; the
    /// extension always follows the file actually produced.
    pub fn for_file(path: &Path, title: Option<&str>) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let title = title.map(str::trim).filter(|value| !value.is_empty());

        let filename = match (title, extension.as_deref()) {
            (Some(title), Some(ext)) => format!("{}.{ext}", title.replace(['/', '\\'], "_")),
            _ => path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("download.bin")
                .to_string(),
        };

        let content_type = match extension.as_deref().unwrap_or_default() {
            "mp4" => "video/mp4",
            "webm" => "video/webm",
            "mkv" => "video/x-matroska",
            "mov" => "video/quicktime",
            "3gp" => "video/3gpp",
            "mp3" => "audio/mpeg",
            "m4a" => "audio/mp4",
            "aac" => "audio/aac",
            "ogg" | "opus" => "audio/ogg",
            _ => "application/octet-stream",
        };

        Self {
            filename,
            content_type,
        }
    }

    /// RFC 6266 value: a quoted ASCII-only name for old clients plus the
    /// exact UTF-8 name in `filename*`.
    pub fn content_disposition(&self) -> String {
        let fallback: String = self
            .filename
            .chars()
            .map(|character| match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' | ' ' | '(' | ')' => character,
                _ => '_',
            })
            .collect();
        let fallback = match fallback.trim() {
            "" => "download.bin",
            trimmed => trimmed,
        };

        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(&self.filename)
        )
    }
}
