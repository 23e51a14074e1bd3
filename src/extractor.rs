//! Boundary to the external extraction/transcoding toolchain.

use std::{io::ErrorKind, path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::{error::ExtractionError, ranker::RawFormat};

const UNKNOWN_FAILURE: &str = "yt-dlp could not complete the operation";

/// Lossy codec the toolchain can transcode audio into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Mp3,
}

impl AudioCodec {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
        }
    }

    /// Conventional file extension for the codec.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcode {
    pub codec: AudioCodec,
    /// Target bitrate in kbps.
    pub quality_kbps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub format_selector: Option<String>,
    pub output_template: String,
    pub postprocessing: Vec<Transcode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeOutput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Reads the title and the full format list without downloading.
    async fn probe(&self, url: &str) -> Result<ProbeOutput, ExtractionError>;

    /// Downloads (and post-processes) the media, returning the final path.
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<PathBuf, ExtractionError>;
}

/// Runs the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    timeout: Option<Duration>,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, ExtractionError> {
        debug!("running {} {:?}", self.binary, args);

        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let result = match self.timeout {
            Some(limit) => timeout(limit, command_future)
                .await
                .map_err(|_| ExtractionError::TimedOut(limit))?,
            None => command_future.await,
        };

        let output = result.map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ExtractionError::NotInstalled
            } else {
                ExtractionError::Spawn(error)
            }
        })?;

        if !output.status.success() {
            let message = last_line(&output.stderr).unwrap_or_else(|| UNKNOWN_FAILURE.to_string());
            return Err(ExtractionError::Failed(message));
        }

        Ok(output)
    }
}

#[async_trait]
impl ExtractionClient for YtDlp {
    async fn probe(&self, url: &str) -> Result<ProbeOutput, ExtractionError> {
        let output = self.run(probe_args(url)).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<PathBuf, ExtractionError> {
        let output = self.run(fetch_args(url, options)).await?;
        last_line(&output.stdout)
            .map(PathBuf::from)
            .ok_or(ExtractionError::MissingOutputPath)
    }
}

fn probe_args(url: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--ignore-config".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        url.to_string(),
    ]
}

fn fetch_args(url: &str, options: &FetchOptions) -> Vec<String> {
    let mut args = vec![
        "--ignore-config".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        options.output_template.clone(),
    ];

    if let Some(selector) = &options.format_selector {
        args.push("-f".to_string());
        args.push(selector.clone());
    }

    for transcode in &options.postprocessing {
        args.push("-x".to_string());
        args.push("--audio-format".to_string());
        args.push(transcode.codec.name().to_string());
        args.push("--audio-quality".to_string());
        args.push(format!("{}K", transcode.quality_kbps));
    }

    args.push(url.to_string());
    args
}

/// Last non-blank line of a captured stream. yt-dlp ends stderr with the
/// `ERROR:` line and stdout with whatever `--print` asked for.
fn last_line(captured: &[u8]) -> Option<String> {
    captured
        .split(|byte| *byte == b'\n')
        .rev()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .find(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_args_include_transcode_when_requested() {
        let options = FetchOptions {
            format_selector: Some("251".to_string()),
            output_template: "/tmp/jobs/abc.mp3".to_string(),
            postprocessing: vec![Transcode {
                codec: AudioCodec::Mp3,
                quality_kbps: 192,
            }],
        };

        let args = fetch_args("https://youtu.be/xyz", &options);
        assert_eq!(
            args,
            vec![
                "--ignore-config",
                "--no-playlist",
                "--no-warnings",
                "--newline",
                "--print",
                "after_move:filepath",
                "-o",
                "/tmp/jobs/abc.mp3",
                "-f",
                "251",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
                "https://youtu.be/xyz",
            ]
        );
    }

    #[test]
    fn fetch_args_without_selector_or_transcode() {
        let options = FetchOptions {
            format_selector: None,
            output_template: "/tmp/jobs/abc.%(ext)s".to_string(),
            postprocessing: Vec::new(),
        };

        let args = fetch_args("https://youtu.be/xyz", &options);
        assert!(!args.contains(&"-f".to_string()));
        assert!(!args.contains(&"-x".to_string()));
        assert_eq!(args.first().map(String::as_str), Some("--ignore-config"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/xyz"));
    }

    #[test]
    fn probe_requests_single_json_dump() {
        assert_eq!(
            probe_args("https://youtu.be/xyz"),
            vec![
                "-J",
                "--ignore-config",
                "--no-playlist",
                "--no-warnings",
                "https://youtu.be/xyz"
            ]
        );
    }

    #[test]
    fn error_message_is_last_stderr_line() {
        let stderr = b"[youtube] xyz: Downloading webpage\r\nERROR: [youtube] xyz: Video unavailable\r\n\n";
        assert_eq!(
            last_line(stderr).as_deref(),
            Some("ERROR: [youtube] xyz: Video unavailable")
        );
        assert_eq!(last_line(b""), None);
    }

    #[test]
    fn printed_path_is_last_stdout_line() {
        let stdout = b"/srv/tmp/a.webm\n/srv/tmp/a.mp3\n";
        assert_eq!(last_line(stdout).as_deref(), Some("/srv/tmp/a.mp3"));
        assert_eq!(last_line(b"  \n\t\n"), None);
    }

    #[test]
    fn probe_output_tolerates_missing_formats() {
        let output: ProbeOutput = serde_json::from_str(r#"{ "title": "Clip" }"#).unwrap();
        assert_eq!(output.title.as_deref(), Some("Clip"));
        assert!(output.formats.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_not_installed() {
        let client = YtDlp::new("media-fetch-test-missing-yt-dlp", None);
        let error = client.probe("https://youtu.be/xyz").await.unwrap_err();
        assert!(matches!(error, ExtractionError::NotInstalled));
    }
}
