//! Catalog API access: course lookup, paginated curriculum fetch, per-lecture
//! asset resolution.
//!
//! "Not found" and "forbidden" conditions are fatal and abort the run before
//! any scheduling starts; everything the scheduler needs afterwards goes
//! through the `CatalogSource` trait so it can be mocked in tests.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::base_system::context::Config;
use crate::base_system::course_id;

use super::models::{
    AssetDescriptor, CaptionTrack, Chapter, ContentKind, Course, Lecture, MediaKind, MediaSource,
    ResolvedLecture, SupplementaryAsset,
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("course not found; verify the course id/url and your access")]
    NotFound,
    #[error("the course exists but the curriculum could not be retrieved (permission denied)")]
    Forbidden,
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected catalog payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct CourseInfo {
    pub id: u64,
    pub title: String,
}

/// Boundary between the download engine and the catalog backend.
pub trait CatalogSource: Send + Sync {
    fn fetch_course(&self, course_id: u64) -> Result<CourseInfo, CatalogError>;

    /// Fetch the full (paginated) curriculum and organize it into chapters.
    fn fetch_curriculum(&self, course_id: u64) -> Result<Vec<Chapter>, CatalogError>;

    /// Resolve one lecture's asset descriptor (media sources, captions,
    /// article body). Called per lecture just before its fetch is dispatched.
    fn resolve_lecture(&self, course_id: u64, lecture_id: u64)
    -> Result<ResolvedLecture, CatalogError>;
}

// ── wire structs ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireCourse {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    title: String,
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    count: u64,
    next: Option<String>,
    #[serde(default)]
    results: Vec<WireEntry>,
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEntry {
    #[serde(rename = "_class")]
    class: String,
    id: u64,
    #[serde(default)]
    title: String,
    asset: Option<WireAsset>,
    #[serde(default)]
    supplementary_assets: Vec<WireAsset>,
}

#[derive(Debug, Default, Deserialize)]
struct WireAsset {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    asset_type: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    time_estimation: Option<u64>,
    #[serde(default)]
    media_sources: Vec<WireMediaSource>,
    #[serde(default)]
    captions: Vec<WireCaption>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    download_urls: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMediaSource {
    #[serde(rename = "type", default)]
    media_type: String,
    #[serde(default)]
    src: String,
}

#[derive(Debug, Deserialize)]
struct WireCaption {
    #[serde(default)]
    locale_id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    video_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireLecture {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    title: String,
    asset: Option<WireAsset>,
    detail: Option<String>,
}

// ── HTTP implementation ──────────────────────────────────────────

pub struct HttpCatalog {
    client: reqwest::blocking::Client,
    base_url: String,
    cookie_header: Option<String>,
}

impl HttpCatalog {
    pub fn new(config: &Config) -> Result<Self, CatalogError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout.max(1)))
            .timeout(Duration::from_secs(config.request_timeout.max(1) * 4))
            .build()?;
        let cookie_header = if config.cookie_header.trim().is_empty() {
            None
        } else {
            Some(config.cookie_header.trim().to_string())
        };
        Ok(Self {
            client,
            base_url: config.catalog_base_url.trim_end_matches('/').to_string(),
            cookie_header,
        })
    }

    fn get_text(&self, url: &str) -> Result<String, CatalogError> {
        Ok(self.get(url)?.text()?)
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, CatalogError> {
        debug!(target: "catalog", url, "GET");
        let mut req = self.client.get(url);
        if let Some(cookie) = &self.cookie_header {
            req = req.header(reqwest::header::COOKIE, cookie.as_str());
        }
        let resp = req.send()?;
        match resp.status().as_u16() {
            403 => Err(CatalogError::Forbidden),
            404 => Err(CatalogError::NotFound),
            _ => Ok(resp.error_for_status()?),
        }
    }

    /// Pull the course id out of a course page URL (og:image and friends).
    pub fn extract_course_id(&self, course_url: &str) -> Result<u64, CatalogError> {
        let url = course_id::clean_course_url(course_url);
        info!(target: "catalog", url = %url, "extracting course id from page");
        let body = self.get_text(&url)?;
        course_id::extract_from_page(&body).ok_or_else(|| {
            CatalogError::Malformed(
                "could not find a course id in the page; try passing --id directly".into(),
            )
        })
    }

    fn course_url(&self, course_id: u64) -> String {
        format!(
            "{}/api-2.0/courses/{}/?fields[course]=id,title",
            self.base_url, course_id
        )
    }

    fn curriculum_url(&self, course_id: u64) -> String {
        format!(
            "{}/api-2.0/courses/{}/subscriber-curriculum-items/?page_size=200\
             &fields[lecture]=title,asset,supplementary_assets\
             &fields[chapter]=title\
             &fields[asset]=asset_type,title,time_estimation,download_urls",
            self.base_url, course_id
        )
    }

    fn lecture_url(&self, course_id: u64, lecture_id: u64) -> String {
        format!(
            "{}/api-2.0/users/me/subscribed-courses/{}/lectures/{}/?\
             fields[lecture]=title,asset\
             &fields[asset]=asset_type,media_sources,captions,body,time_estimation",
            self.base_url, course_id, lecture_id
        )
    }
}

fn check_detail(detail: Option<&str>) -> Result<(), CatalogError> {
    let Some(detail) = detail else {
        return Ok(());
    };
    if detail.contains("permission") {
        return Err(CatalogError::Forbidden);
    }
    if detail.contains("Not found") {
        return Err(CatalogError::NotFound);
    }
    Ok(())
}

impl CatalogSource for HttpCatalog {
    fn fetch_course(&self, course_id: u64) -> Result<CourseInfo, CatalogError> {
        let wire: WireCourse = self
            .get(&self.course_url(course_id))?
            .json()
            .map_err(CatalogError::Http)?;
        check_detail(wire.detail.as_deref())?;
        if wire.title.is_empty() {
            return Err(CatalogError::Malformed("course payload has no title".into()));
        }
        Ok(CourseInfo {
            id: if wire.id != 0 { wire.id } else { course_id },
            title: wire.title,
        })
    }

    fn fetch_curriculum(&self, course_id: u64) -> Result<Vec<Chapter>, CatalogError> {
        info!(target: "catalog", course_id, "fetching course curriculum, this may take a while");
        let mut entries = Vec::new();
        let mut url = Some(self.curriculum_url(course_id));
        let mut expected = 0u64;
        while let Some(next) = url.take() {
            let page: WirePage = self.get(&next)?.json().map_err(CatalogError::Http)?;
            check_detail(page.detail.as_deref())?;
            if expected == 0 {
                expected = page.count;
            }
            entries.extend(page.results);
            debug!(target: "catalog", fetched = entries.len(), expected, "curriculum page fetched");
            url = page.next;
        }
        Ok(organize_curriculum(entries))
    }

    fn resolve_lecture(
        &self,
        course_id: u64,
        lecture_id: u64,
    ) -> Result<ResolvedLecture, CatalogError> {
        let wire: WireLecture = self
            .get(&self.lecture_url(course_id, lecture_id))?
            .json()
            .map_err(CatalogError::Http)?;
        check_detail(wire.detail.as_deref())?;
        let asset = wire.asset.map(asset_descriptor).unwrap_or_default();
        Ok(ResolvedLecture {
            id: wire.id,
            title: wire.title,
            asset,
        })
    }
}

// ── curriculum organization ──────────────────────────────────────

/// Fold the flat chapter/lecture listing into a chapter tree. Lectures that
/// appear before any chapter have no stable position and are dropped with a
/// warning.
fn organize_curriculum(entries: Vec<WireEntry>) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut lecture_total = 0usize;

    for entry in entries {
        match entry.class.as_str() {
            "chapter" => chapters.push(Chapter {
                id: entry.id,
                title: entry.title,
                lectures: Vec::new(),
            }),
            "lecture" => {
                let Some(current) = chapters.last_mut() else {
                    warn!(target: "catalog", lecture = %entry.title, "found lecture without a parent chapter, skipping");
                    continue;
                };
                let kind = entry
                    .asset
                    .as_ref()
                    .map(|a| ContentKind::from_asset_type(&a.asset_type))
                    .unwrap_or_default();
                let duration_secs = entry.asset.as_ref().and_then(|a| a.time_estimation);
                current.lectures.push(Lecture {
                    id: entry.id,
                    title: entry.title,
                    kind,
                    duration_secs,
                    supplementary_assets: entry
                        .supplementary_assets
                        .into_iter()
                        .map(supplementary_asset)
                        .collect(),
                });
                lecture_total += 1;
            }
            other => debug!(target: "catalog", class = other, "ignoring curriculum entry"),
        }
    }

    info!(target: "catalog", chapters = chapters.len(), lectures = lecture_total, "curriculum organized");
    chapters
}

fn asset_descriptor(asset: WireAsset) -> AssetDescriptor {
    let media_sources = asset
        .media_sources
        .iter()
        .filter_map(|s| {
            MediaKind::from_media_type(&s.media_type).map(|kind| MediaSource {
                kind,
                url: s.src.clone(),
            })
        })
        .collect();
    let captions = asset
        .captions
        .into_iter()
        .filter(|c| !c.url.is_empty())
        .map(|c| CaptionTrack {
            locale: c.locale_id,
            url: c.url,
            label: c.video_label,
        })
        .collect();
    AssetDescriptor {
        kind: ContentKind::from_asset_type(&asset.asset_type),
        media_sources,
        captions,
        article_body: asset.body,
        duration_secs: asset.time_estimation,
    }
}

fn supplementary_asset(asset: WireAsset) -> SupplementaryAsset {
    let url = asset.download_urls.as_ref().and_then(first_file_url);
    SupplementaryAsset {
        id: asset.id,
        title: asset
            .title
            .unwrap_or_else(|| format!("asset_{}", asset.id)),
        url,
    }
}

/// `download_urls` is a map of asset-class name to a list of `{file, label}`
/// objects; take the first file link found anywhere in it.
fn first_file_url(value: &Value) -> Option<String> {
    let map = value.as_object()?;
    for entries in map.values() {
        if let Some(arr) = entries.as_array() {
            for item in arr {
                if let Some(file) = item.get("file").and_then(|v| v.as_str())
                    && !file.is_empty()
                {
                    return Some(file.to_string());
                }
            }
        }
    }
    None
}
