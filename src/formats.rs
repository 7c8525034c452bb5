//! Builds the list of selectable formats shown to clients.
//!
//! yt-dlp frequently reports formats that are incomplete or that the backend
//! later refuses to fetch, so the list always opens with composite selectors
//! that work for nearly every source.

use serde::{Deserialize, Serialize};

/// Selector used when a client does not pick anything specific.
pub const BEST_SELECTOR: &str = "bestvideo+bestaudio/best";
/// Selector substituted whenever audio extraction is requested.
pub const BEST_AUDIO_SELECTOR: &str = "bestaudio/best";

/// Subset of a yt-dlp format entry. Every field is optional because extractors
/// differ wildly in what they fill in.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub format_note: Option<String>,
    pub resolution: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<i64>,
    pub filesize_approx: Option<i64>,
}

/// One entry of the `formats` array returned by `/api/info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatOption {
    pub format_id: String,
    pub ext: String,
    pub resolution: String,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    pub vcodec: String,
    pub acodec: String,
}

impl FormatOption {
    fn generic(format_id: &str, ext: &str, resolution: &str, note: &str, vcodec: &str) -> Self {
        Self {
            format_id: format_id.to_owned(),
            ext: ext.to_owned(),
            resolution: resolution.to_owned(),
            note: note.to_owned(),
            filesize: None,
            fps: None,
            vcodec: vcodec.to_owned(),
            acodec: "aac".to_owned(),
        }
    }
}

/// Composite selectors offered for every item, in display order.
pub fn generic_formats() -> Vec<FormatOption> {
    vec![
        FormatOption::generic(BEST_SELECTOR, "mp4", "Best available", "Recommended", "h264"),
        FormatOption::generic(
            "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
            "mp4",
            "1080p max",
            "Full HD",
            "h264",
        ),
        FormatOption::generic(
            "bestvideo[height<=720]+bestaudio/best[height<=720]",
            "mp4",
            "720p max",
            "HD",
            "h264",
        ),
        FormatOption::generic(BEST_AUDIO_SELECTOR, "m4a", "audio only", "Best audio", "none"),
    ]
}

/// Returns the generic selectors followed by every raw format that carries
/// enough detail to present. Overlapping upstream entries are kept as-is.
pub fn normalize_formats(raw: &[RawFormat]) -> Vec<FormatOption> {
    let mut options = generic_formats();
    options.extend(raw.iter().filter_map(to_option));
    options
}

fn to_option(format: &RawFormat) -> Option<FormatOption> {
    let format_id = format.format_id.as_deref().map(str::trim)?;
    if format_id.is_empty() {
        return None;
    }

    let note = format
        .format_note
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    let filesize = format.filesize.or(format.filesize_approx);
    if filesize.is_none() && note.is_empty() {
        return None;
    }

    let vcodec = format.vcodec.clone().unwrap_or_else(|| "none".to_owned());
    let acodec = format.acodec.clone().unwrap_or_else(|| "none".to_owned());

    Some(FormatOption {
        format_id: format_id.to_owned(),
        ext: format.ext.clone().unwrap_or_else(|| "unknown".to_owned()),
        resolution: resolution_label(format, &vcodec),
        note: note.to_owned(),
        filesize,
        fps: format.fps,
        vcodec,
        acodec,
    })
}

/// Prefers yt-dlp's own label, then `WIDTHxHEIGHT`, then `HEIGHTp`.
fn resolution_label(format: &RawFormat, vcodec: &str) -> String {
    if vcodec.eq_ignore_ascii_case("none") {
        return "audio only".to_owned();
    }
    if let Some(label) = format.resolution.as_deref()
        && !label.trim().is_empty()
    {
        return label.trim().to_owned();
    }
    match (format.width, format.height) {
        (Some(width), Some(height)) => format!("{width}x{height}"),
        (None, Some(height)) => format!("{height}p"),
        _ => "unknown".to_owned(),
    }
}
