//! Shapes yt-dlp's `--dump-single-json` payload into the `/api/info` response.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServiceError;
use crate::formats::{FormatOption, RawFormat, normalize_formats};
use crate::ytdlp::MediaTool;

/// Playlists are cut to this many entries to keep responses small.
pub const MAX_PLAYLIST_ENTRIES: usize = 50;

/// Full probe payload. Only a subset of fields are read and everything is
/// optional because extractors disagree on what they report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub duration: Option<f64>,
    pub view_count: Option<i64>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub playlist_title: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    pub entries: Option<Vec<Option<RawEntry>>>,
}

/// A playlist item. yt-dlp emits `null` for entries it failed to resolve,
/// hence the `Option` wrapper in [`RawInfo::entries`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub id: Option<String>,
    pub title: String,
    pub uploader: String,
    pub duration: f64,
    pub view_count: i64,
    pub thumbnail: Option<String>,
    pub description: String,
    pub formats: Vec<FormatOption>,
    pub is_playlist: bool,
    pub playlist_title: Option<String>,
    pub playlist_count: Option<usize>,
    pub entries: Vec<PlaylistEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistEntry {
    pub id: Option<String>,
    pub title: String,
    pub duration: f64,
    pub thumbnail: Option<String>,
    pub url: String,
}

/// Resolves `url` through the tool without downloading anything.
pub async fn probe(tool: &dyn MediaTool, url: &str) -> Result<MediaInfo, ServiceError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ServiceError::validation("URL is required"));
    }

    let raw = tool
        .probe(url)
        .await
        .map_err(|err| ServiceError::Extraction(err.translate_extraction()))?;
    let info = shape_info(raw);
    debug!(
        url,
        is_playlist = info.is_playlist,
        formats = info.formats.len(),
        "probe finished"
    );
    Ok(info)
}

pub fn shape_info(raw: RawInfo) -> MediaInfo {
    let formats = normalize_formats(&raw.formats);

    let entries: Vec<RawEntry> = raw.entries.unwrap_or_default().into_iter().flatten().collect();
    let is_playlist = !entries.is_empty();

    let duration = if is_playlist {
        entries.iter().map(|entry| entry.duration.unwrap_or(0.0)).sum()
    } else {
        raw.duration.unwrap_or(0.0)
    };

    let shaped_entries = entries
        .iter()
        .take(MAX_PLAYLIST_ENTRIES)
        .enumerate()
        .map(|(index, entry)| shape_entry(index, entry))
        .collect();

    MediaInfo {
        id: raw.id,
        title: raw.title.unwrap_or_else(|| "Untitled".to_owned()),
        uploader: raw.uploader.unwrap_or_else(|| "Unknown".to_owned()),
        duration,
        view_count: raw.view_count.unwrap_or(0),
        thumbnail: raw.thumbnail,
        description: raw.description.unwrap_or_default(),
        formats,
        is_playlist,
        playlist_title: if is_playlist {
            raw.playlist_title
        } else {
            None
        },
        playlist_count: is_playlist.then_some(entries.len()),
        entries: shaped_entries,
    }
}

fn shape_entry(index: usize, entry: &RawEntry) -> PlaylistEntry {
    let url = entry
        .webpage_url
        .clone()
        .or_else(|| entry.url.clone().filter(|url| url.contains("://")))
        .or_else(|| {
            entry
                .id
                .as_ref()
                .map(|id| format!("https://www.youtube.com/watch?v={id}"))
        })
        .unwrap_or_default();

    PlaylistEntry {
        id: entry.id.clone(),
        title: entry
            .title
            .clone()
            .unwrap_or_else(|| format!("Video {}", index + 1)),
        duration: entry.duration.unwrap_or(0.0),
        thumbnail: entry.thumbnail.clone(),
        url,
    }
}
