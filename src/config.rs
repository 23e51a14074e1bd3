use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use axum::http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info};
use url::Url;

use crate::error::ApiError;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_STALE_DOWNLOAD_SECONDS: u64 = 2 * 60 * 60;

/// Settings read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub transfer_dir: PathBuf,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout: Option<Duration>,
    pub stale_download_age: Duration,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let transfer_dir = read_string_env("TRANSFER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("temp_downloads"));

        Self {
            bind_addr: resolve_bind_addr(),
            transfer_dir,
            yt_dlp_bin: read_string_env("YT_DLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            yt_dlp_timeout: read_u64_env("YT_DLP_TIMEOUT_SECONDS")
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
            stale_download_age: Duration::from_secs(
                read_u64_env("STALE_DOWNLOAD_SECONDS").unwrap_or(DEFAULT_STALE_DOWNLOAD_SECONDS),
            ),
            allowed_origins: read_string_env("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str) -> Option<u64> {
    read_string_env(name).and_then(|value| value.parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = read_string_env("PORT").and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Cross-origin access is only needed when the page is hosted elsewhere;
/// with no configured origins the layer is left off entirely.
pub fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, ApiError> {
    if origins.is_empty() {
        return Ok(None);
    }

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!("CORS origin check raw={:?} allowed={}", origin, allowed);
        allowed
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION, HeaderName::from_static("x-download-filename")]),
    ))
}

pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

/// Accepts only absolute http(s) URLs with a host.
pub fn is_fetchable_url(input: &str) -> bool {
    Url::parse(input)
        .ok()
        .is_some_and(|parsed| {
            matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_normalized() {
        assert_eq!(
            normalize_origin("HTTPS://Example.com:443").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_origin("http://localhost:5173").as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(normalize_origin("https://example.com/app"), None);
        assert_eq!(normalize_origin("ftp://example.com"), None);
    }

    #[test]
    fn cors_layer_is_optional() {
        assert!(build_cors_layer(&[]).unwrap().is_none());
        assert!(
            build_cors_layer(&["https://example.com".to_string()])
                .unwrap()
                .is_some()
        );
        assert!(build_cors_layer(&["not an origin".to_string()]).is_err());
    }

    #[test]
    fn only_http_urls_are_fetchable() {
        assert!(is_fetchable_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_fetchable_url("http://example.com/video"));
        assert!(!is_fetchable_url("file:///etc/passwd"));
        assert!(!is_fetchable_url("youtube.com/watch?v=abc"));
        assert!(!is_fetchable_url(""));
    }

    #[test]
    fn lists_are_split_and_trimmed() {
        assert_eq!(
            split_list(" https://a.com, ,https://b.com "),
            vec!["https://a.com", "https://b.com"]
        );
    }
}
