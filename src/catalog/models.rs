//! In-memory catalog tree: a course made of chapters containing lectures.
//!
//! The tree is built once per run (from the catalog API or a saved snapshot)
//! and is read-only afterwards. Ordinals are 1-based and assigned in traversal
//! order, so they are stable across runs for the same catalog snapshot.

use serde::{Deserialize, Serialize};

/// Composite (chapter, lecture) ordinal. Derived `Ord` gives the
/// lexicographic ordering the range filter relies on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub chapter: u32,
    pub lecture: u32,
}

impl Position {
    pub fn new(chapter: u32, lecture: u32) -> Self {
        Self { chapter, lecture }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.chapter, self.lecture)
    }
}

/// Declared content kind of a lecture. Closed set; anything the catalog
/// reports that we do not understand lands in `Unknown` and is surfaced as an
/// unsupported-format failure at dispatch time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Video,
    Article,
    #[default]
    Unknown,
}

impl ContentKind {
    pub fn from_asset_type(asset_type: &str) -> Self {
        match asset_type {
            "Video" => Self::Video,
            "Article" => Self::Article,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Video => "video",
            Self::Article => "article",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Media representation of a video asset, in dispatch-priority order:
/// DASH manifest first (required for DRM streams), then HLS, then a plain
/// progressive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    DashManifest,
    HlsPlaylist,
    ProgressiveMp4,
}

impl MediaKind {
    /// Map a media-type string from the catalog API onto the closed set.
    /// Unrecognized types are dropped by the caller.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            "application/dash+xml" => Some(Self::DashManifest),
            "application/x-mpegURL" => Some(Self::HlsPlaylist),
            "video/mp4" => Some(Self::ProgressiveMp4),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSource {
    pub kind: MediaKind,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionTrack {
    pub locale: String,
    pub url: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplementaryAsset {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Everything needed to actually fetch one lecture, produced by
/// `CatalogSource::resolve_lecture` just before dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub kind: ContentKind,
    #[serde(default)]
    pub media_sources: Vec<MediaSource>,
    #[serde(default)]
    pub captions: Vec<CaptionTrack>,
    #[serde(default)]
    pub article_body: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl AssetDescriptor {
    pub fn source_of(&self, kind: MediaKind) -> Option<&MediaSource> {
        self.media_sources.iter().find(|s| s.kind == kind)
    }

    /// Best available video representation, by dispatch priority.
    pub fn best_video_source(&self) -> Option<&MediaSource> {
        self.source_of(MediaKind::DashManifest)
            .or_else(|| self.source_of(MediaKind::HlsPlaylist))
            .or_else(|| self.source_of(MediaKind::ProgressiveMp4))
    }

    /// A DASH manifest representation implies the stream may be
    /// Widevine-protected.
    pub fn is_drm_protected(&self) -> bool {
        self.source_of(MediaKind::DashManifest).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedLecture {
    pub id: u64,
    pub title: String,
    pub asset: AssetDescriptor,
}

/// One lecture as listed in the curriculum. The full asset descriptor is
/// resolved lazily per lecture; the curriculum listing only carries the
/// declared kind, duration and supplementary assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lecture {
    pub id: u64,
    pub title: String,
    pub kind: ContentKind,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub supplementary_assets: Vec<SupplementaryAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub lectures: Vec<Lecture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl Course {
    pub fn new(id: u64, title: impl Into<String>, chapters: Vec<Chapter>) -> Self {
        Self {
            id,
            title: title.into(),
            chapters,
        }
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    pub fn lecture_count(&self) -> usize {
        self.chapters.iter().map(|c| c.lectures.len()).sum()
    }

    /// Walk the tree in chapter-then-lecture order with 1-based ordinals.
    pub fn walk(&self) -> impl Iterator<Item = (Position, &Chapter, &Lecture)> {
        self.chapters.iter().enumerate().flat_map(|(ci, chapter)| {
            chapter.lectures.iter().enumerate().map(move |(li, lecture)| {
                (
                    Position::new(ci as u32 + 1, li as u32 + 1),
                    chapter,
                    lecture,
                )
            })
        })
    }
}
