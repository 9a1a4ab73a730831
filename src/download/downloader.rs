//! Run orchestration: open the progress store, set up the dispatcher and
//! scheduler for one course, run, and report.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use indicatif::MultiProgress;
use tracing::info;

use crate::base_system::context::{Config, safe_fs_name};
use crate::catalog::client::CatalogSource;
use crate::catalog::models::Course;
use crate::download::cache::DownloadCache;
use crate::download::dispatch::{FetchDispatcher, FetcherSet, SkipFlags};
use crate::download::scheduler::{RunReport, Scheduler};
use crate::download::selection::Selection;

pub struct RunOptions {
    pub concurrency: usize,
    pub selection: Selection,
    pub skip: SkipFlags,
    pub decryption_key: Option<String>,
    pub show_progress: bool,
}

pub fn course_directory(config: &Config, course: &Course) -> PathBuf {
    config.output_dir_path().join(safe_fs_name(&course.title))
}

/// Download (or resume) one course. Fatal setup errors propagate; per-item
/// failures end up in the report and the store.
pub fn download_course(
    config: &Config,
    source: &dyn CatalogSource,
    fetchers: FetcherSet,
    course: &Course,
    options: &RunOptions,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<RunReport> {
    let course_dir = course_directory(config, course);
    fs::create_dir_all(&course_dir)
        .with_context(|| format!("creating course directory {}", course_dir.display()))?;

    let mut cache = DownloadCache::open(
        &config.cache_dir_path(),
        &course.id.to_string(),
        config.completed_size_tolerance,
        config.min_completed_size,
    );
    cache.save_curriculum(course);
    let prior = cache.summary();
    if prior.total > 0 {
        info!(
            target: "downloader",
            completed = prior.completed,
            failed = prior.failed,
            total = prior.total,
            "resuming with prior progress ({:.1}%)",
            prior.completion_rate
        );
    }
    let cache = Arc::new(Mutex::new(cache));

    let dispatcher = FetchDispatcher::new(fetchers, options.skip, options.decryption_key.is_some());
    let temp_dir = course_dir.join(".parts");
    let progress = options.show_progress.then(MultiProgress::new);

    let started = Instant::now();
    let scheduler = Scheduler::new(
        course,
        source,
        &dispatcher,
        cache.clone(),
        cancel,
        course_dir,
        temp_dir,
        progress,
    );
    let report = scheduler.run(&options.selection, options.concurrency);

    let summary = cache
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .summary();
    info!(
        target: "downloader",
        elapsed_secs = started.elapsed().as_secs(),
        completed = summary.completed,
        failed = summary.failed,
        total = summary.total,
        "course '{}' done ({:.1}%)",
        course.title,
        summary.completion_rate
    );
    Ok(report)
}
