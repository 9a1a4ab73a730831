//! Bulk, resumable downloader for chaptered course catalogs.
//!
//! Code layout:
//! - `base_system`: config, logging, course-id parsing
//! - `catalog`: catalog tree model and API client
//! - `download`: progress store, selection, dispatch, scheduler
//! - `fetchers`: the concrete fetch operations

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{info, warn};

mod base_system;
mod catalog;
mod download;
mod fetchers;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::course_id;
use base_system::logging::{LogOptions, LogSystem};
use catalog::client::{CatalogSource, HttpCatalog};
use catalog::models::Course;
use download::cache::DownloadCache;
use download::dispatch::SkipFlags;
use download::downloader::{RunOptions, download_course};
use download::scheduler::{MAX_CONCURRENCY, MIN_CONCURRENCY, clamp_concurrency};
use download::selection::SelectionBuilder;
use fetchers::default_fetchers;

#[derive(Debug, Parser)]
#[command(name = "course-downloader", version)]
#[command(about = "Bulk, resumable downloader for chaptered course catalogs")]
struct Cli {
    /// Numeric course id
    #[arg(short, long)]
    id: Option<u64>,

    /// Course landing page URL (the id is extracted from the page)
    #[arg(short, long)]
    url: Option<String>,

    /// Widevine decryption key as kid:key
    #[arg(short, long)]
    key: Option<String>,

    /// Parallel download slots (1-25)
    #[arg(short = 'n', long)]
    concurrent: Option<usize>,

    /// First chapter to download (1-based)
    #[arg(long)]
    start_chapter: Option<u32>,

    /// First lecture within the start chapter (requires --start-chapter)
    #[arg(long)]
    start_lecture: Option<u32>,

    /// Last chapter to download (inclusive)
    #[arg(long)]
    end_chapter: Option<u32>,

    /// Last lecture within the end chapter (requires --end-chapter)
    #[arg(long)]
    end_lecture: Option<u32>,

    /// Explicit chapter set, e.g. "1,3-5,7"
    #[arg(long)]
    chapter: Option<String>,

    /// Caption locales to download, e.g. "en_US,de"; overrides the config
    #[arg(long)]
    captions: Option<String>,

    /// Convert downloaded WebVTT captions to SubRip (.srt)
    #[arg(long, default_value_t = false)]
    srt: bool,

    /// Skip lecture videos (captions and assets still run)
    #[arg(long, default_value_t = false)]
    skip_lectures: bool,

    /// Skip caption tracks
    #[arg(long, default_value_t = false)]
    skip_captions: bool,

    /// Skip supplementary assets
    #[arg(long, default_value_t = false)]
    skip_assets: bool,

    /// Skip article lectures
    #[arg(long, default_value_t = false)]
    skip_articles: bool,

    /// Save the fetched curriculum to a JSON snapshot and continue
    #[arg(long)]
    save: Option<PathBuf>,

    /// Load the curriculum from a JSON snapshot instead of the API
    #[arg(long)]
    load: Option<PathBuf>,

    /// Print the curriculum tree and exit
    #[arg(long, default_value_t = false)]
    tree: bool,

    /// Delete the course's progress file and exit
    #[arg(long, default_value_t = false)]
    clear_cache: bool,

    /// Print the course's progress summary and exit
    #[arg(long, default_value_t = false)]
    show_cache: bool,

    /// Reset failed records to pending before downloading
    #[arg(long, default_value_t = false)]
    reset_failed: bool,

    /// Enable debug log output
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Config file path (defaults to ./config.yml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = LogSystem::init(LogOptions {
        debug: cli.debug,
        ..LogOptions::default()
    })?;

    let result = run(&cli);
    log.safe_exit();
    result
}

fn run(cli: &Cli) -> Result<()> {
    let mut config: Config =
        load_or_create(cli.config.as_deref()).map_err(|e| anyhow!(e.to_string()))?;
    apply_cli_overrides(&mut config, cli);

    let decryption_key = resolve_key(cli, &config)?;
    let cancel = install_cancel_handler()?;

    let catalog = HttpCatalog::new(&config)?;
    let course_id = resolve_course_id(cli, &catalog)?;

    if cli.clear_cache || cli.show_cache {
        return cache_maintenance(&config, course_id, cli.clear_cache);
    }

    let course = obtain_course(cli, &catalog, course_id)?;
    info!(
        target: "main",
        chapters = course.chapter_count(),
        lectures = course.lecture_count(),
        "course '{}'",
        course.title
    );

    if let Some(path) = &cli.save {
        let json = serde_json::to_string_pretty(&course)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        info!(target: "main", path = %path.display(), "curriculum snapshot saved");
    }
    if cli.tree {
        print_tree(&course);
        return Ok(());
    }

    if cli.reset_failed {
        let mut cache = open_cache(&config, course_id);
        let reset = cache.reset_failed();
        info!(target: "main", reset, "failed records reset to pending");
    }

    let requested = cli.concurrent.unwrap_or(config.concurrent_downloads);
    let concurrency = clamp_concurrency(requested);
    if concurrency != requested {
        warn!(
            target: "main",
            requested,
            "concurrency outside {MIN_CONCURRENCY}-{MAX_CONCURRENCY}, using {concurrency}"
        );
    }

    let selection = SelectionBuilder::default()
        .start(cli.start_chapter, cli.start_lecture)
        .end(cli.end_chapter, cli.end_lecture)
        .chapters(cli.chapter.clone())
        .build(course.chapter_count() as u32)?;

    let options = RunOptions {
        concurrency,
        selection,
        skip: SkipFlags {
            lectures: cli.skip_lectures || config.skip_lectures,
            captions: cli.skip_captions || config.skip_captions,
            assets: cli.skip_assets || config.skip_assets,
            articles: cli.skip_articles || config.skip_articles,
        },
        decryption_key: decryption_key.clone(),
        show_progress: !cli.debug,
    };
    let fetchers = default_fetchers(&config, decryption_key.as_deref())?;

    let report = download_course(&config, &catalog, fetchers, &course, &options, cancel)?;
    if report.failed > 0 {
        warn!(
            target: "main",
            failed = report.failed,
            "some items failed; rerun with --reset-failed to retry them"
        );
    }
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(locales) = &cli.captions {
        config.caption_locales = locales
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if cli.srt {
        config.convert_captions_to_srt = true;
    }
}

fn resolve_key(cli: &Cli, config: &Config) -> Result<Option<String>> {
    let key = cli
        .key
        .clone()
        .or_else(|| (!config.decryption_key.trim().is_empty()).then(|| config.decryption_key.trim().to_string()));
    if let Some(key) = &key
        && !key.contains(':')
    {
        bail!("decryption key must be in kid:key form");
    }
    Ok(key)
}

/// First Ctrl-C requests a graceful stop; a second one exits immediately.
fn install_cancel_handler() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let presses = AtomicU32::new(0);
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("stopping after in-flight downloads finish (Ctrl-C again to abort)");
            flag.store(true, Ordering::Relaxed);
        } else {
            std::process::exit(130);
        }
    })
    .context("installing Ctrl-C handler")?;
    Ok(cancel)
}

fn resolve_course_id(cli: &Cli, catalog: &HttpCatalog) -> Result<u64> {
    if let Some(id) = cli.id {
        return Ok(id);
    }
    let Some(url) = &cli.url else {
        bail!("pass a course with --id or --url");
    };
    if let Some(id) = course_id::parse_numeric(url) {
        return Ok(id);
    }
    Ok(catalog.extract_course_id(url)?)
}

fn obtain_course(cli: &Cli, catalog: &HttpCatalog, course_id: u64) -> Result<Course> {
    if let Some(path) = &cli.load {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let course: Course = serde_json::from_str(&raw)
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        info!(target: "main", path = %path.display(), "curriculum loaded from snapshot");
        return Ok(course);
    }
    let info = catalog.fetch_course(course_id)?;
    let chapters = catalog.fetch_curriculum(course_id)?;
    Ok(Course::new(info.id, info.title, chapters))
}

fn open_cache(config: &Config, course_id: u64) -> DownloadCache {
    DownloadCache::open(
        &config.cache_dir_path(),
        &course_id.to_string(),
        config.completed_size_tolerance,
        config.min_completed_size,
    )
}

fn cache_maintenance(config: &Config, course_id: u64, clear: bool) -> Result<()> {
    let mut cache = open_cache(config, course_id);
    if clear {
        cache.clear();
        return Ok(());
    }
    let summary = cache.summary();
    println!("course {course_id}");
    println!(
        "  total: {}  completed: {}  failed: {}  in progress: {}  ({:.1}%)",
        summary.total,
        summary.completed,
        summary.failed,
        summary.in_progress,
        summary.completion_rate
    );
    for record in cache.failed_records() {
        println!(
            "  failed {:>2}.{:<3} {} ({})",
            record.chapter_index,
            record.lecture_index,
            record.title,
            record.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_tree(course: &Course) {
    println!("{} (id {})", course.title, course.id);
    let mut last_chapter = 0;
    for (position, chapter, lecture) in course.walk() {
        if position.chapter != last_chapter {
            println!("  {:>2}. {}", position.chapter, chapter.title);
            last_chapter = position.chapter;
        }
        let duration = lecture
            .duration_secs
            .map(|s| format!(" [{}:{:02}]", s / 60, s % 60))
            .unwrap_or_default();
        println!(
            "      {:>3}. {} ({}{})",
            position.lecture, lecture.title, lecture.kind, duration
        );
    }
}
