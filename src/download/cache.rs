//! Durable per-course download progress store.
//!
//! One JSON document per course, rewritten in full after every mutation so a
//! kill at any point leaves the file consistent with the last completed state
//! transition. A corrupt or unreadable document degrades to a fresh store; a
//! failed write degrades to in-memory-only for that update. Neither is fatal.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::catalog::models::{ContentKind, Course, Position};

/// Record state machine: `Pending` (after a failed-reset) → `Started` →
/// `Completed` | `Failed`. A fresh `mark_started` is the retry path and bumps
/// the attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub chapter_index: u32,
    pub lecture_index: u32,
    pub title: String,
    pub lecture_id: u64,
    pub content_kind: ContentKind,
    pub status: DownloadStatus,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub failed_at: Option<String>,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheData {
    course_id: String,
    created_at: String,
    last_updated: String,
    total_downloads: u64,
    completed_downloads: u64,
    failed_downloads: u64,
    downloads: HashMap<String, DownloadRecord>,
    /// Audit copy of the catalog tree, so a resume can be inspected without
    /// re-fetching the curriculum.
    curriculum: Option<serde_json::Value>,
}

impl CacheData {
    fn new(course_id: &str) -> Self {
        let now = now_rfc3339();
        Self {
            course_id: course_id.to_string(),
            created_at: now.clone(),
            last_updated: now,
            total_downloads: 0,
            completed_downloads: 0,
            failed_downloads: 0,
            downloads: HashMap::new(),
            curriculum: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheSummary {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_progress: u64,
    pub completion_rate: f64,
}

pub struct DownloadCache {
    course_id: String,
    cache_file: PathBuf,
    data: CacheData,
    /// Absolute byte tolerance when comparing an artifact against the
    /// recorded size, and the floor under which a file is treated as a
    /// truncated placeholder. Both come from configuration.
    size_tolerance: u64,
    min_plausible_size: u64,
}

impl DownloadCache {
    pub fn open(
        cache_dir: &Path,
        course_id: &str,
        size_tolerance: u64,
        min_plausible_size: u64,
    ) -> Self {
        if let Err(err) = fs::create_dir_all(cache_dir) {
            warn!(target: "cache", error = %err, "could not create cache directory");
        }
        let cache_file = cache_dir.join(format!("course_{course_id}.json"));
        let data = match load_cache_file(&cache_file) {
            Some(data) => {
                info!(target: "cache", course_id, "loaded download cache");
                data
            }
            None => CacheData::new(course_id),
        };
        Self {
            course_id: course_id.to_string(),
            cache_file,
            data,
            size_tolerance,
            min_plausible_size,
        }
    }

    /// Content-derived fingerprint for one lecture. Stable across catalog
    /// re-fetches as long as ordering and titles are, which is what lets
    /// cache entries survive a fresh curriculum fetch.
    pub fn download_key(position: Position, title: &str) -> String {
        let input = format!("{}_{}_{}", position.chapter, position.lecture, title);
        let digest = Sha256::digest(input.as_bytes());
        hex::encode(digest)[..12].to_string()
    }

    /// Dual record + filesystem check. The record alone is not trusted: the
    /// artifact must exist at the expected path, be larger than the
    /// plausibility floor, and match the recorded size within tolerance
    /// (an unrecorded size matches trivially).
    pub fn is_download_completed(
        &self,
        position: Position,
        title: &str,
        expected_path: &Path,
    ) -> (bool, Option<&DownloadRecord>) {
        let key = Self::download_key(position, title);
        let Some(record) = self.data.downloads.get(&key) else {
            return (false, None);
        };
        if record.status != DownloadStatus::Completed {
            return (false, Some(record));
        }
        let Ok(meta) = fs::metadata(expected_path) else {
            return (false, Some(record));
        };
        let size = meta.len();
        if size < self.min_plausible_size {
            return (false, Some(record));
        }
        let matches = record.file_size == 0 || size.abs_diff(record.file_size) < self.size_tolerance;
        (matches, Some(record))
    }

    /// Create or overwrite the record in `started` state. Counters tracking
    /// a prior terminal state are rolled back so they stay consistent with
    /// the record set on the retry path. Persists immediately.
    pub fn mark_started(
        &mut self,
        position: Position,
        title: &str,
        lecture_id: u64,
        content_kind: ContentKind,
    ) -> String {
        let key = Self::download_key(position, title);
        let now = now_rfc3339();
        match self.data.downloads.get_mut(&key) {
            Some(record) => {
                match record.status {
                    DownloadStatus::Completed => {
                        self.data.completed_downloads =
                            self.data.completed_downloads.saturating_sub(1);
                    }
                    DownloadStatus::Failed => {
                        self.data.failed_downloads = self.data.failed_downloads.saturating_sub(1);
                    }
                    _ => {}
                }
                record.status = DownloadStatus::Started;
                record.started_at = Some(now);
                record.completed_at = None;
                record.failed_at = None;
                record.error = None;
                record.file_path.clear();
                record.file_size = 0;
                record.lecture_id = lecture_id;
                record.content_kind = content_kind;
                record.attempts += 1;
            }
            None => {
                self.data.downloads.insert(
                    key.clone(),
                    DownloadRecord {
                        chapter_index: position.chapter,
                        lecture_index: position.lecture,
                        title: title.to_string(),
                        lecture_id,
                        content_kind,
                        status: DownloadStatus::Started,
                        started_at: Some(now),
                        completed_at: None,
                        failed_at: None,
                        file_path: String::new(),
                        file_size: 0,
                        error: None,
                        attempts: 1,
                    },
                );
                self.data.total_downloads += 1;
            }
        }
        self.persist();
        key
    }

    /// Transition a record to `completed`, resolving the artifact size from
    /// the filesystem when the caller does not supply one. An unknown
    /// fingerprint is a silently dropped update, not a crash.
    pub fn mark_completed(&mut self, key: &str, file_path: &Path, file_size: Option<u64>) {
        let Some(record) = self.data.downloads.get_mut(key) else {
            debug!(target: "cache", key, "mark_completed for unknown fingerprint, dropping");
            return;
        };
        let size = file_size
            .or_else(|| fs::metadata(file_path).ok().map(|m| m.len()))
            .unwrap_or(0);
        record.status = DownloadStatus::Completed;
        record.completed_at = Some(now_rfc3339());
        record.file_path = file_path.to_string_lossy().into_owned();
        record.file_size = size;
        self.data.completed_downloads += 1;
        self.persist();
    }

    pub fn mark_failed(&mut self, key: &str, error: &str) {
        let Some(record) = self.data.downloads.get_mut(key) else {
            debug!(target: "cache", key, "mark_failed for unknown fingerprint, dropping");
            return;
        };
        record.status = DownloadStatus::Failed;
        record.failed_at = Some(now_rfc3339());
        record.error = Some(error.to_string());
        self.data.failed_downloads += 1;
        self.persist();
    }

    /// Make every failed record eligible for a fresh `started` transition.
    /// Idempotent; the failed counter is zero afterwards.
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for record in self.data.downloads.values_mut() {
            if record.status == DownloadStatus::Failed {
                record.status = DownloadStatus::Pending;
                record.failed_at = None;
                record.error = None;
                reset += 1;
            }
        }
        self.data.failed_downloads = 0;
        self.persist();
        reset
    }

    /// Discard the persisted document and reinitialize to an empty store.
    pub fn clear(&mut self) {
        if self.cache_file.exists() {
            match fs::remove_file(&self.cache_file) {
                Ok(()) => info!(target: "cache", course_id = %self.course_id, "download cache cleared"),
                Err(err) => warn!(target: "cache", error = %err, "failed to remove cache file"),
            }
        }
        self.data = CacheData::new(&self.course_id);
    }

    pub fn summary(&self) -> CacheSummary {
        let total = self.data.total_downloads;
        let completed = self.data.completed_downloads;
        let failed = self.data.failed_downloads;
        let completion_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheSummary {
            total,
            completed,
            failed,
            in_progress: total.saturating_sub(completed + failed),
            completion_rate,
        }
    }

    pub fn record(&self, key: &str) -> Option<&DownloadRecord> {
        self.data.downloads.get(key)
    }

    pub fn record_count(&self) -> usize {
        self.data.downloads.len()
    }

    pub fn failed_records(&self) -> Vec<&DownloadRecord> {
        let mut records: Vec<&DownloadRecord> = self
            .data
            .downloads
            .values()
            .filter(|r| r.status == DownloadStatus::Failed)
            .collect();
        records.sort_by_key(|r| (r.chapter_index, r.lecture_index));
        records
    }

    /// Embed the catalog tree for audit/resume and persist.
    pub fn save_curriculum(&mut self, course: &Course) {
        match serde_json::to_value(course) {
            Ok(value) => {
                self.data.curriculum = Some(value);
                self.persist();
            }
            Err(err) => warn!(target: "cache", error = %err, "failed to serialize curriculum"),
        }
    }

    /// Write-through persistence. Failure only costs durability for this one
    /// update; the in-memory state stays authoritative for the run.
    fn persist(&mut self) {
        self.data.last_updated = now_rfc3339();
        let json = match serde_json::to_string_pretty(&self.data) {
            Ok(json) => json,
            Err(err) => {
                warn!(target: "cache", error = %err, "failed to serialize cache");
                return;
            }
        };
        if let Err(err) = fs::write(&self.cache_file, json) {
            warn!(target: "cache", error = %err, path = %self.cache_file.display(), "failed to persist cache, update is in-memory only");
        }
    }
}

fn load_cache_file(path: &Path) -> Option<CacheData> {
    if !path.exists() {
        return None;
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(target: "cache", error = %err, "cache file unreadable, starting fresh");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(data) => Some(data),
        Err(err) => {
            warn!(target: "cache", error = %err, "cache file corrupted, starting fresh");
            None
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
