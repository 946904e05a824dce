#![forbid(unsafe_code)]

//! Read path over the media tree: walks a scope directory, joins filesystem
//! facts with sidecar metadata, and produces a sorted listing.

use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::MediaConfig;
use crate::sidecar::read_sidecar;

/// Identifier substituted when an audio item has no thumbnail of its own.
pub const DEFAULT_AUDIO_THUMBNAIL: &str = "default_audio_thumbnail.jpg";
/// Identifier substituted when a video item has no thumbnail of its own.
pub const DEFAULT_VIDEO_THUMBNAIL: &str = "default_video_thumbnail.jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Catalog view of one media file. Derived on every listing, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct MediaItem {
    pub id: String,
    pub name: String,
    pub path: String,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub modified_at: f64,
    pub downloaded_at: f64,
    pub thumbnail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Date,
    DateDownloaded,
    Size,
}

impl SortKey {
    /// Lenient query-string parsing; anything unknown falls back to the
    /// default ordering.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("name") => Self::Name,
            Some("date") => Self::Date,
            Some("size") => Self::Size,
            _ => Self::DateDownloaded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("asc") | Some("ascending") => Self::Ascending,
            _ => Self::Descending,
        }
    }
}

/// Walks `scope_dir` recursively and returns every allowed media file as a
/// sorted [`MediaItem`] sequence. Unreadable entries are skipped, not fatal.
pub fn list_media(
    scope_dir: &Path,
    config: &MediaConfig,
    sort: SortKey,
    order: SortOrder,
) -> Result<Vec<MediaItem>> {
    let mut items = Vec::new();

    for entry in WalkDir::new(scope_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };

        let kind = if config.is_audio(ext) {
            MediaKind::Audio
        } else if config.is_video(ext) {
            MediaKind::Video
        } else {
            continue;
        };

        let rel_path = path
            .strip_prefix(scope_dir)
            .context("walked entry outside scope directory")?
            .to_string_lossy()
            .into_owned();
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let size_bytes = metadata.len();
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs_f64())
            .unwrap_or(0.0);

        let parent = path.parent().unwrap_or(scope_dir);
        let downloaded_at = read_sidecar(parent, stem)
            .map(|sidecar| sidecar.download_date)
            .unwrap_or(modified_at);

        let thumbnail = resolve_thumbnail(scope_dir, parent, stem, kind, config);

        items.push(MediaItem {
            id: rel_path.clone(),
            name,
            path: rel_path,
            kind,
            size_bytes,
            modified_at,
            downloaded_at,
            thumbnail,
        });
    }

    sort_items(&mut items, sort, order);
    Ok(items)
}

/// First same-base-name image in the item's own directory wins; otherwise
/// one of the two fixed defaults based on media kind.
fn resolve_thumbnail(
    scope_dir: &Path,
    parent: &Path,
    stem: &str,
    kind: MediaKind,
    config: &MediaConfig,
) -> String {
    for img_ext in &config.image_extensions {
        let candidate = parent.join(format!("{stem}.{img_ext}"));
        if candidate.exists() {
            if let Ok(rel) = candidate.strip_prefix(scope_dir) {
                return rel.to_string_lossy().into_owned();
            }
        }
    }
    match kind {
        MediaKind::Audio => DEFAULT_AUDIO_THUMBNAIL.to_string(),
        MediaKind::Video => DEFAULT_VIDEO_THUMBNAIL.to_string(),
    }
}

fn sort_items(items: &mut [MediaItem], sort: SortKey, order: SortOrder) {
    match sort {
        SortKey::Name => items.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase())),
        SortKey::Date => items.sort_by(|a, b| a.modified_at.total_cmp(&b.modified_at)),
        SortKey::DateDownloaded => {
            items.sort_by(|a, b| a.downloaded_at.total_cmp(&b.downloaded_at))
        }
        SortKey::Size => items.sort_by(|a, b| a.size_bytes.cmp(&b.size_bytes)),
    }
    if order == SortOrder::Descending {
        items.reverse();
    }
}

/// Presentation-boundary formatting; sorting always uses the numeric value.
pub fn format_size_mb(size_bytes: u64) -> String {
    format!("{:.2} MB", size_bytes as f64 / (1024.0 * 1024.0))
}
