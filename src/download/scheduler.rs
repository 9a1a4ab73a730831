//! Bounded-concurrency worker pool over the filtered catalog traversal.
//!
//! The eligible items are enumerated once in traversal order and pushed into
//! a crossbeam channel; the sender is dropped before workers start, so each
//! `recv` hands out exactly one item and a finished worker immediately claims
//! the next one. Fetches are blocking, one OS thread per slot.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::base_system::context::safe_fs_name;
use crate::catalog::client::CatalogSource;
use crate::catalog::models::{ContentKind, Course, Lecture, Position};
use crate::download::cache::DownloadCache;
use crate::download::dispatch::{FetchDispatcher, FetchJob, NullSink, ProgressSink};
use crate::download::selection::Selection;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 25;

pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

struct WorkItem {
    position: Position,
    chapter_title: String,
    lecture: Lecture,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Mutex poisoning only means another worker panicked mid-update; the store
/// is self-consistent after every mutation, so the data is still usable.
fn lock_cache(cache: &Mutex<DownloadCache>) -> MutexGuard<'_, DownloadCache> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct BarSink {
    bar: ProgressBar,
}

impl ProgressSink for BarSink {
    fn update(&self, downloaded: u64, total: Option<u64>) {
        if let Some(total) = total {
            self.bar.set_length(total);
        }
        self.bar.set_position(downloaded);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

pub struct Scheduler<'a> {
    course: &'a Course,
    source: &'a dyn CatalogSource,
    dispatcher: &'a FetchDispatcher,
    cache: Arc<Mutex<DownloadCache>>,
    cancel: Arc<AtomicBool>,
    course_dir: PathBuf,
    temp_dir: PathBuf,
    progress: Option<MultiProgress>,
}

impl<'a> Scheduler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        course: &'a Course,
        source: &'a dyn CatalogSource,
        dispatcher: &'a FetchDispatcher,
        cache: Arc<Mutex<DownloadCache>>,
        cancel: Arc<AtomicBool>,
        course_dir: PathBuf,
        temp_dir: PathBuf,
        progress: Option<MultiProgress>,
    ) -> Self {
        Self {
            course,
            source,
            dispatcher,
            cache,
            cancel,
            course_dir,
            temp_dir,
            progress,
        }
    }

    pub fn run(&self, selection: &Selection, concurrency: usize) -> RunReport {
        let items: Vec<WorkItem> = self
            .course
            .walk()
            .filter(|(position, _, _)| selection.is_eligible(*position))
            .map(|(position, chapter, lecture)| WorkItem {
                position,
                chapter_title: chapter.title.clone(),
                lecture: lecture.clone(),
            })
            .collect();
        if items.is_empty() {
            info!(target: "scheduler", "selection matched no items, nothing to do");
            return RunReport::default();
        }

        if let Err(err) = fs::create_dir_all(&self.temp_dir) {
            warn!(target: "scheduler", error = %err, "could not create temp directory");
        }

        let concurrency = clamp_concurrency(concurrency);
        let workers = concurrency.min(items.len());
        info!(
            target: "scheduler",
            items = items.len(),
            workers,
            "starting download run"
        );

        let overall = self.progress.as_ref().map(|mp| {
            let bar = mp.add(ProgressBar::new(items.len() as u64));
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} items {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        });

        let (tx, rx) = crossbeam_channel::unbounded::<WorkItem>();
        for item in items {
            // unbounded channel, send cannot block or fail while rx is alive
            let _ = tx.send(item);
        }
        drop(tx);

        let counters = Counters::default();
        thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let counters = &counters;
                let overall = overall.as_ref();
                scope.spawn(move || {
                    loop {
                        if self.cancel.load(Ordering::Relaxed) {
                            debug!(target: "scheduler", "cancel flag set, worker stops claiming");
                            break;
                        }
                        let Ok(item) = rx.recv() else { break };
                        self.process_item(&item, counters);
                        if let Some(bar) = overall {
                            bar.inc(1);
                        }
                    }
                });
            }
        });

        if let Some(bar) = overall {
            bar.finish_and_clear();
        }

        let report = RunReport {
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
        };
        if self.cancel.load(Ordering::Relaxed) {
            warn!(target: "scheduler", "run cancelled, unfinished items stay resumable");
        }
        info!(
            target: "scheduler",
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "download run finished"
        );
        report
    }

    fn process_item(&self, item: &WorkItem, counters: &Counters) {
        let chapter_dir = self.course_dir.join(format!(
            "{:02}. {}",
            item.position.chapter,
            safe_fs_name(&item.chapter_title)
        ));
        let stem = format!(
            "{:03}. {}",
            item.position.lecture,
            safe_fs_name(&item.lecture.title)
        );
        let ext = match item.lecture.kind {
            ContentKind::Article => "html",
            _ => "mp4",
        };
        let expected = chapter_dir.join(format!("{stem}.{ext}"));

        {
            let cache = lock_cache(&self.cache);
            let (done, _) =
                cache.is_download_completed(item.position, &item.lecture.title, &expected);
            if done {
                debug!(target: "scheduler", position = %item.position, title = %item.lecture.title, "already downloaded, skipping");
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let key = lock_cache(&self.cache).mark_started(
            item.position,
            &item.lecture.title,
            item.lecture.id,
            item.lecture.kind,
        );

        if let Err(err) = fs::create_dir_all(&chapter_dir) {
            warn!(target: "scheduler", position = %item.position, error = %err, "could not create destination directory");
            lock_cache(&self.cache).mark_failed(&key, &format!("destination directory: {err}"));
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let resolved = match self
            .source
            .resolve_lecture(self.course.id, item.lecture.id)
        {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(target: "scheduler", position = %item.position, title = %item.lecture.title, error = %err, "lecture resolution failed");
                lock_cache(&self.cache).mark_failed(&key, &format!("resolve: {err}"));
                counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let job = FetchJob {
            lecture: &resolved,
            assets: &item.lecture.supplementary_assets,
            output_stem: stem,
            dest_dir: &chapter_dir,
            temp_dir: &self.temp_dir,
        };

        let bar_sink = self.progress.as_ref().map(|mp| {
            let bar = mp.add(ProgressBar::new(0));
            bar.set_style(
                ProgressStyle::with_template(
                    "  {spinner:.dim} {bytes}/{total_bytes} {wide_msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_message(item.lecture.title.clone());
            BarSink { bar }
        });
        let sink: &dyn ProgressSink = match &bar_sink {
            Some(sink) => sink,
            None => &NullSink,
        };

        let outcome = self.dispatcher.dispatch(&job, sink);
        sink.finish();

        match outcome {
            Ok(artifact) => {
                // A flag-skipped primary still completes, against the path it
                // would have produced.
                let path = artifact.unwrap_or(expected);
                info!(target: "scheduler", position = %item.position, title = %item.lecture.title, "completed");
                lock_cache(&self.cache).mark_completed(&key, &path, None);
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(target: "scheduler", position = %item.position, title = %item.lecture.title, error = %err, "failed");
                lock_cache(&self.cache).mark_failed(&key, &err.to_string());
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::client::{CatalogError, CourseInfo};
    use crate::catalog::models::{
        AssetDescriptor, CaptionTrack, Chapter, MediaKind, MediaSource, ResolvedLecture,
        SupplementaryAsset,
    };
    use crate::download::dispatch::{
        ArticleFetcher, AssetFetcher, CaptionFetcher, FetcherSet, SkipFlags, VideoFetcher,
    };
    use anyhow::bail;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    struct StubCatalog;

    impl CatalogSource for StubCatalog {
        fn fetch_course(&self, course_id: u64) -> Result<CourseInfo, CatalogError> {
            Ok(CourseInfo {
                id: course_id,
                title: "stub".into(),
            })
        }

        fn fetch_curriculum(&self, _course_id: u64) -> Result<Vec<Chapter>, CatalogError> {
            Ok(Vec::new())
        }

        fn resolve_lecture(
            &self,
            _course_id: u64,
            lecture_id: u64,
        ) -> Result<ResolvedLecture, CatalogError> {
            Ok(ResolvedLecture {
                id: lecture_id,
                title: format!("lecture {lecture_id}"),
                asset: AssetDescriptor {
                    kind: ContentKind::Video,
                    media_sources: vec![MediaSource {
                        kind: MediaKind::ProgressiveMp4,
                        url: format!("https://example.com/{lecture_id}.mp4"),
                    }],
                    ..AssetDescriptor::default()
                },
            })
        }
    }

    /// Writes a small real artifact so the store's filesystem check passes,
    /// and instruments concurrency.
    struct InstrumentedVideo {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: Mutex<Vec<u64>>,
        fail_lecture_ids: HashSet<u64>,
    }

    impl InstrumentedVideo {
        fn new(fail_lecture_ids: impl IntoIterator<Item = u64>) -> Self {
            Self {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                fail_lecture_ids: fail_lecture_ids.into_iter().collect(),
            }
        }
    }

    impl VideoFetcher for Arc<InstrumentedVideo> {
        fn fetch_video(
            &self,
            job: &FetchJob<'_>,
            _source: &MediaSource,
            _sink: &dyn ProgressSink,
        ) -> anyhow::Result<PathBuf> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);

            self.calls.lock().unwrap().push(job.lecture.id);
            if self.fail_lecture_ids.contains(&job.lecture.id) {
                bail!("simulated fetch failure");
            }
            let path = job.dest_dir.join(format!("{}.mp4", job.output_stem));
            let mut file = fs::File::create(&path)?;
            file.write_all(&[0u8; 2048])?;
            Ok(path)
        }
    }

    struct NoopArticle;
    impl ArticleFetcher for NoopArticle {
        fn fetch_article(&self, job: &FetchJob<'_>, _body: &str) -> anyhow::Result<PathBuf> {
            Ok(job.dest_dir.join(format!("{}.html", job.output_stem)))
        }
    }
    struct NoopCaptions;
    impl CaptionFetcher for NoopCaptions {
        fn fetch_captions(
            &self,
            _job: &FetchJob<'_>,
            _tracks: &[CaptionTrack],
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }
    struct NoopAssets;
    impl AssetFetcher for NoopAssets {
        fn fetch_asset(
            &self,
            _job: &FetchJob<'_>,
            _asset: &SupplementaryAsset,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fetcher_set(video: Arc<InstrumentedVideo>) -> FetcherSet {
        FetcherSet {
            video: Box::new(video),
            article: Box::new(NoopArticle),
            captions: Box::new(NoopCaptions),
            assets: Box::new(NoopAssets),
        }
    }

    fn course_with(chapters: u32, lectures_per_chapter: u32) -> Course {
        let chapters = (1..=chapters)
            .map(|c| Chapter {
                id: c as u64,
                title: format!("Chapter {c}"),
                lectures: (1..=lectures_per_chapter)
                    .map(|l| Lecture {
                        id: (c * 100 + l) as u64,
                        title: format!("Lecture {c}.{l}"),
                        kind: ContentKind::Video,
                        duration_secs: None,
                        supplementary_assets: Vec::new(),
                    })
                    .collect(),
            })
            .collect();
        Course::new(7, "Test Course", chapters)
    }

    fn open_cache(dir: &TempDir) -> Arc<Mutex<DownloadCache>> {
        Arc::new(Mutex::new(DownloadCache::open(
            &dir.path().join("cache"),
            "7",
            1024,
            1,
        )))
    }

    fn run_once(
        course: &Course,
        video: Arc<InstrumentedVideo>,
        cache: Arc<Mutex<DownloadCache>>,
        dir: &TempDir,
        concurrency: usize,
    ) -> RunReport {
        let dispatcher = FetchDispatcher::new(fetcher_set(video), SkipFlags::default(), true);
        let scheduler = Scheduler::new(
            course,
            &StubCatalog,
            &dispatcher,
            cache,
            Arc::new(AtomicBool::new(false)),
            dir.path().join("out"),
            dir.path().join("tmp"),
            None,
        );
        scheduler.run(&Selection::everything(), concurrency)
    }

    #[test]
    fn concurrency_never_exceeds_requested_bound() {
        let dir = TempDir::new().unwrap();
        let course = course_with(10, 10);
        let video = Arc::new(InstrumentedVideo::new([]));
        let report = run_once(&course, video.clone(), open_cache(&dir), &dir, 8);

        assert_eq!(report.completed, 100);
        let max = video.max_active.load(Ordering::SeqCst);
        assert!(max <= 8, "observed {max} concurrent fetches");
        assert!(max > 1, "pool should actually run in parallel");
    }

    #[test]
    fn requested_concurrency_is_clamped() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(1), 1);
        assert_eq!(clamp_concurrency(25), 25);
        assert_eq!(clamp_concurrency(100), 25);

        let dir = TempDir::new().unwrap();
        let course = course_with(3, 4);
        let video = Arc::new(InstrumentedVideo::new([]));
        let report = run_once(&course, video.clone(), open_cache(&dir), &dir, 1000);
        assert_eq!(report.completed, 12);
        assert!(video.max_active.load(Ordering::SeqCst) <= MAX_CONCURRENCY);
    }

    #[test]
    fn each_item_is_claimed_exactly_once() {
        let dir = TempDir::new().unwrap();
        let course = course_with(4, 5);
        let video = Arc::new(InstrumentedVideo::new([]));
        run_once(&course, video.clone(), open_cache(&dir), &dir, 6);

        let mut calls = video.calls.lock().unwrap().clone();
        calls.sort_unstable();
        let expected: Vec<u64> = course.walk().map(|(_, _, l)| l.id).collect();
        let mut expected = expected;
        expected.sort_unstable();
        assert_eq!(calls, expected);
    }

    #[test]
    fn one_failure_does_not_stop_the_run() {
        let dir = TempDir::new().unwrap();
        let course = course_with(2, 3);
        let video = Arc::new(InstrumentedVideo::new([202]));
        let cache = open_cache(&dir);
        let report = run_once(&course, video, cache.clone(), &dir, 2);

        assert_eq!(report.completed, 5);
        assert_eq!(report.failed, 1);
        let summary = lock_cache(&cache).summary();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn selection_limits_the_claim_sequence() {
        let dir = TempDir::new().unwrap();
        let course = course_with(3, 2);
        let video = Arc::new(InstrumentedVideo::new([]));
        let dispatcher =
            FetchDispatcher::new(fetcher_set(video.clone()), SkipFlags::default(), true);
        let cache = open_cache(&dir);
        let scheduler = Scheduler::new(
            &course,
            &StubCatalog,
            &dispatcher,
            cache,
            Arc::new(AtomicBool::new(false)),
            dir.path().join("out"),
            dir.path().join("tmp"),
            None,
        );
        let selection = crate::download::selection::SelectionBuilder::default()
            .chapters(Some("2".into()))
            .build(3)
            .unwrap();
        let report = scheduler.run(&selection, 4);
        assert_eq!(report.completed, 2);
        let calls = video.calls.lock().unwrap();
        assert!(calls.iter().all(|id| (201..=299).contains(id)));
    }

    #[test]
    fn cancelled_run_stops_claiming() {
        let dir = TempDir::new().unwrap();
        let course = course_with(5, 5);
        let video = Arc::new(InstrumentedVideo::new([]));
        let dispatcher =
            FetchDispatcher::new(fetcher_set(video.clone()), SkipFlags::default(), true);
        let cache = open_cache(&dir);
        let cancel = Arc::new(AtomicBool::new(true)); // cancelled before start
        let scheduler = Scheduler::new(
            &course,
            &StubCatalog,
            &dispatcher,
            cache,
            cancel,
            dir.path().join("out"),
            dir.path().join("tmp"),
            None,
        );
        let report = scheduler.run(&Selection::everything(), 4);
        assert_eq!(report, RunReport::default());
        assert!(video.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn resume_retries_only_failed_items() {
        let dir = TempDir::new().unwrap();
        let course = course_with(2, 3);
        let cache = open_cache(&dir);

        // First run: lecture (2,2) fails.
        let video = Arc::new(InstrumentedVideo::new([202]));
        let report = run_once(&course, video, cache.clone(), &dir, 2);
        assert_eq!(report.completed, 5);
        assert_eq!(report.failed, 1);
        {
            let summary = lock_cache(&cache).summary();
            assert_eq!(summary.total, 6);
            assert_eq!(summary.completed, 5);
            assert_eq!(summary.failed, 1);
            assert!((summary.completion_rate - 83.333).abs() < 0.01);
        }

        lock_cache(&cache).reset_failed();

        // Second run: everything succeeds; completed artifacts are skipped.
        let video = Arc::new(InstrumentedVideo::new([]));
        let report = run_once(&course, video.clone(), cache.clone(), &dir, 2);
        assert_eq!(report.skipped, 5);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(video.calls.lock().unwrap().as_slice(), &[202]);

        let summary = lock_cache(&cache).summary();
        assert_eq!(summary.total, 6);
        assert_eq!(summary.completed, 6);
        assert_eq!(summary.failed, 0);
        assert!((summary.completion_rate - 100.0).abs() < f64::EPSILON);
    }
}
