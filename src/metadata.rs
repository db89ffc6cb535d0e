#![forbid(unsafe_code)]

//! Projection of yt-dlp's `--dump-json` document.
//!
//! yt-dlp emits a few hundred keys per video. The API only forwards the handful
//! below; anything missing upstream is simply left out of the response.
//! Numbers stay as `serde_json::Number` so integers are not rewritten as floats.

use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::error::JobResult;

/// One entry of the `formats` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<Number>,
}

/// Body of the `data` field returned by `POST /api/video-info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formats: Option<Vec<FormatInfo>>,
}

/// Parses the whole of stdout as a single JSON document.
pub fn parse_video_info(stdout: &[u8]) -> JobResult<VideoInfo> {
    Ok(serde_json::from_slice(stdout)?)
}
