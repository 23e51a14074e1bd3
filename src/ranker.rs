//! Collapses the raw yt-dlp format list into a short menu of named video
//! resolutions and audio bitrate tiers.

use std::collections::{HashMap, hash_map::Entry};

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};

/// Width of the window around each audio tier target, in kbps.
pub const AUDIO_TIER_TOLERANCE_KBPS: f64 = 5.0;

const NO_CODEC: &str = "none";

/// One entry of the `formats` array reported by yt-dlp.
///
/// Every field is read leniently: a value of the wrong JSON type is treated
/// as absent so one odd format never fails the whole probe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    #[serde(default, deserialize_with = "lenient_string")]
    pub format_id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub ext: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub vcodec: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub acodec: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub height: Option<u32>,
    #[serde(default, deserialize_with = "lenient")]
    pub tbr: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub abr: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub filesize: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub filesize_approx: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub format_note: Option<String>,
}

impl RawFormat {
    pub fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    pub fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && self.vcodec.as_deref() == Some(NO_CODEC)
    }

    /// Exact size when known, otherwise yt-dlp's estimate.
    pub fn effective_filesize(&self) -> Option<u64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|bytes| bytes.is_finite() && *bytes >= 0.0)
            .map(|bytes| bytes as u64)
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if !value.is_empty() && value != NO_CODEC)
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Number(number) => number.to_string(),
        _ => String::new(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioTier {
    pub label: String,
    pub target_kbps: f64,
}

impl AudioTier {
    pub fn new(label: impl Into<String>, target_kbps: f64) -> Self {
        Self {
            label: label.into(),
            target_kbps,
        }
    }

    fn contains(&self, kbps: f64) -> bool {
        (self.target_kbps - AUDIO_TIER_TOLERANCE_KBPS) <= kbps
            && kbps <= (self.target_kbps + AUDIO_TIER_TOLERANCE_KBPS)
    }
}

/// Label sets the menus are built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RankerConfig {
    pub video_heights: Vec<u32>,
    /// Scanned in order; the first tier whose window matches claims the format.
    pub audio_tiers: Vec<AudioTier>,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            video_heights: vec![360, 480, 720, 1080],
            audio_tiers: vec![
                AudioTier::new("fast(128k)", 128.0),
                AudioTier::new("classic mp3(320k)", 320.0),
                AudioTier::new("classic mp3(160k)", 160.0),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VideoOption {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: String,
    pub filesize: Option<u64>,
    pub vcodec_status: Option<String>,
    pub acodec_status: Option<String>,
    pub note: Option<String>,
    #[serde(skip)]
    pub height: u32,
    #[serde(skip)]
    pub has_audio: bool,
    #[serde(skip)]
    pub tbr: Option<f64>,
}

impl VideoOption {
    fn from_raw(format: &RawFormat, height: u32) -> Self {
        Self {
            format_id: format.format_id.clone(),
            ext: format.ext.clone(),
            resolution: resolution_label(height),
            filesize: format.effective_filesize(),
            vcodec_status: format.vcodec.clone(),
            acodec_status: format.acodec.clone(),
            note: format.format_note.clone(),
            height,
            has_audio: format.has_audio(),
            tbr: format.tbr,
        }
    }

    fn is_beaten_by(&self, candidate: &VideoOption) -> bool {
        if candidate.has_audio != self.has_audio {
            return candidate.has_audio;
        }

        matches!(
            (candidate.tbr, self.tbr),
            (Some(candidate_tbr), Some(current_tbr)) if candidate_tbr > current_tbr
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AudioOption {
    pub format_id: String,
    pub ext: Option<String>,
    /// Bitrate truncated to whole kbps, e.g. `"129k"`.
    pub abr: String,
    pub label: String,
    pub filesize: Option<u64>,
    #[serde(skip)]
    pub abr_kbps: f64,
}

impl AudioOption {
    fn from_raw(format: &RawFormat, abr_kbps: f64, label: &str) -> Self {
        Self {
            format_id: format.format_id.clone(),
            ext: format.ext.clone(),
            abr: format!("{}k", abr_kbps as i64),
            label: label.to_string(),
            filesize: format.effective_filesize(),
            abr_kbps,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedFormats {
    pub video: Vec<VideoOption>,
    pub audio: Vec<AudioOption>,
}

pub fn resolution_label(height: u32) -> String {
    format!("{height}p")
}

/// Picks one format per accepted resolution and one per audio tier.
///
/// Video: combined audio+video beats video-only; with equal audio presence
/// the strictly higher total bitrate wins, and a missing bitrate never
/// displaces anything. Audio: audio-only formats are bucketed into the first
/// tier whose ±5 kbps window holds their average bitrate, keeping the highest.
pub fn rank(formats: &[RawFormat], config: &RankerConfig) -> RankedFormats {
    let mut video_by_label: HashMap<u32, VideoOption> = HashMap::new();
    let mut audio_by_label: HashMap<&str, AudioOption> = HashMap::new();

    for format in formats.iter().filter(|format| !format.format_id.is_empty()) {
        if format.has_video()
            && let Some(height) = format.height.filter(|height| *height > 0)
            && config.video_heights.contains(&height)
        {
            let candidate = VideoOption::from_raw(format, height);
            match video_by_label.entry(height) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().is_beaten_by(&candidate) {
                        slot.insert(candidate);
                    }
                }
            }
        }

        if format.is_audio_only()
            && let Some(abr) = format.abr.filter(|abr| *abr > 0.0)
            && let Some(tier) = config.audio_tiers.iter().find(|tier| tier.contains(abr))
        {
            let current_abr = audio_by_label
                .get(tier.label.as_str())
                .map(|current| current.abr_kbps);
            if current_abr.is_none_or(|current| abr > current) {
                audio_by_label.insert(
                    tier.label.as_str(),
                    AudioOption::from_raw(format, abr, &tier.label),
                );
            }
        }
    }

    let mut video: Vec<VideoOption> = video_by_label.into_values().collect();
    video.sort_by(|a, b| b.height.cmp(&a.height));

    let mut audio: Vec<AudioOption> = audio_by_label.into_values().collect();
    audio.sort_by(|a, b| b.abr_kbps.total_cmp(&a.abr_kbps));

    RankedFormats { video, audio }
}
