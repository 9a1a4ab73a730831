//! Routes a resolved lecture to the fetch operation matching its content
//! kind and best media representation.
//!
//! Captions and supplementary assets are side-operations: they run before the
//! primary fetch and their failures are logged, never fatal to the item.
//! Only the primary fetch decides the item's outcome.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::models::{
    CaptionTrack, ContentKind, MediaSource, ResolvedLecture, SupplementaryAsset,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no supported media representation for '{title}'")]
    UnsupportedFormat { title: String },
    #[error(transparent)]
    Fetch(#[from] anyhow::Error),
}

/// Byte-level progress reporting for a single fetch. `total` is unknown for
/// chunked responses and segment downloads.
pub trait ProgressSink: Send + Sync {
    fn update(&self, downloaded: u64, total: Option<u64>);
    fn finish(&self) {}
}

/// Sink that discards everything. Used by workers running without a UI and by
/// tests.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn update(&self, _downloaded: u64, _total: Option<u64>) {}
}

/// One item's worth of fetch context, borrowed from the scheduler for the
/// duration of the dispatch.
pub struct FetchJob<'a> {
    pub lecture: &'a ResolvedLecture,
    pub assets: &'a [SupplementaryAsset],
    /// Filesystem-safe filename stem, extension decided by the fetcher.
    pub output_stem: String,
    pub dest_dir: &'a Path,
    pub temp_dir: &'a Path,
}

pub trait VideoFetcher: Send + Sync {
    /// Returns the path of the produced artifact.
    fn fetch_video(
        &self,
        job: &FetchJob<'_>,
        source: &MediaSource,
        sink: &dyn ProgressSink,
    ) -> anyhow::Result<PathBuf>;
}

pub trait ArticleFetcher: Send + Sync {
    fn fetch_article(&self, job: &FetchJob<'_>, body: &str) -> anyhow::Result<PathBuf>;
}

pub trait CaptionFetcher: Send + Sync {
    fn fetch_captions(&self, job: &FetchJob<'_>, tracks: &[CaptionTrack]) -> anyhow::Result<()>;
}

pub trait AssetFetcher: Send + Sync {
    fn fetch_asset(&self, job: &FetchJob<'_>, asset: &SupplementaryAsset) -> anyhow::Result<()>;
}

pub struct FetcherSet {
    pub video: Box<dyn VideoFetcher>,
    pub article: Box<dyn ArticleFetcher>,
    pub captions: Box<dyn CaptionFetcher>,
    pub assets: Box<dyn AssetFetcher>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SkipFlags {
    pub lectures: bool,
    pub captions: bool,
    pub assets: bool,
    pub articles: bool,
}

pub struct FetchDispatcher {
    fetchers: FetcherSet,
    skip: SkipFlags,
    has_decryption_key: bool,
}

impl FetchDispatcher {
    pub fn new(fetchers: FetcherSet, skip: SkipFlags, has_decryption_key: bool) -> Self {
        Self {
            fetchers,
            skip,
            has_decryption_key,
        }
    }

    /// Run the side-operations, then the primary fetch. Returns the primary
    /// artifact path, or `None` when the primary fetch was skipped by flag.
    pub fn dispatch(
        &self,
        job: &FetchJob<'_>,
        sink: &dyn ProgressSink,
    ) -> Result<Option<PathBuf>, DispatchError> {
        self.run_side_operations(job);

        match job.lecture.asset.kind {
            ContentKind::Video => {
                if self.skip.lectures {
                    return Ok(None);
                }
                let Some(source) = job.lecture.asset.best_video_source() else {
                    return Err(DispatchError::UnsupportedFormat {
                        title: job.lecture.title.clone(),
                    });
                };
                if job.lecture.asset.is_drm_protected() && !self.has_decryption_key {
                    warn!(
                        target: "dispatch",
                        title = %job.lecture.title,
                        "stream looks DRM-protected and no decryption key is configured, attempting anyway"
                    );
                }
                let path = self.fetchers.video.fetch_video(job, source, sink)?;
                Ok(Some(path))
            }
            ContentKind::Article => {
                if self.skip.articles {
                    return Ok(None);
                }
                let body = job.lecture.asset.article_body.as_deref().unwrap_or("");
                let path = self.fetchers.article.fetch_article(job, body)?;
                Ok(Some(path))
            }
            ContentKind::Unknown => Err(DispatchError::UnsupportedFormat {
                title: job.lecture.title.clone(),
            }),
        }
    }

    fn run_side_operations(&self, job: &FetchJob<'_>) {
        if !self.skip.captions && !job.lecture.asset.captions.is_empty() {
            if let Err(err) = self
                .fetchers
                .captions
                .fetch_captions(job, &job.lecture.asset.captions)
            {
                warn!(target: "dispatch", title = %job.lecture.title, error = %err, "caption download failed");
            }
        }
        if !self.skip.assets {
            for asset in job.assets {
                match self.fetchers.assets.fetch_asset(job, asset) {
                    Ok(()) => info!(target: "dispatch", asset = %asset.title, "supplementary asset saved"),
                    Err(err) => {
                        warn!(target: "dispatch", asset = %asset.title, error = %err, "supplementary asset failed")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{AssetDescriptor, MediaKind};
    use anyhow::bail;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_video: bool,
        fail_captions: bool,
        fail_assets: bool,
    }

    impl Recorder {
        fn log(&self, entry: impl Into<String>) {
            self.calls.lock().unwrap().push(entry.into());
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct RecVideo(std::sync::Arc<Recorder>);
    impl VideoFetcher for RecVideo {
        fn fetch_video(
            &self,
            job: &FetchJob<'_>,
            source: &MediaSource,
            _sink: &dyn ProgressSink,
        ) -> anyhow::Result<PathBuf> {
            self.0.log(format!("video:{:?}", source.kind));
            if self.0.fail_video {
                bail!("video fetch failed");
            }
            Ok(job.dest_dir.join(format!("{}.mp4", job.output_stem)))
        }
    }

    struct RecArticle(std::sync::Arc<Recorder>);
    impl ArticleFetcher for RecArticle {
        fn fetch_article(&self, job: &FetchJob<'_>, body: &str) -> anyhow::Result<PathBuf> {
            self.0.log(format!("article:{}", body.len()));
            Ok(job.dest_dir.join(format!("{}.html", job.output_stem)))
        }
    }

    struct RecCaptions(std::sync::Arc<Recorder>);
    impl CaptionFetcher for RecCaptions {
        fn fetch_captions(
            &self,
            _job: &FetchJob<'_>,
            tracks: &[CaptionTrack],
        ) -> anyhow::Result<()> {
            self.0.log(format!("captions:{}", tracks.len()));
            if self.0.fail_captions {
                bail!("caption fetch failed");
            }
            Ok(())
        }
    }

    struct RecAssets(std::sync::Arc<Recorder>);
    impl AssetFetcher for RecAssets {
        fn fetch_asset(
            &self,
            _job: &FetchJob<'_>,
            asset: &SupplementaryAsset,
        ) -> anyhow::Result<()> {
            self.0.log(format!("asset:{}", asset.id));
            if self.0.fail_assets {
                bail!("asset fetch failed");
            }
            Ok(())
        }
    }

    fn dispatcher_with(
        recorder: std::sync::Arc<Recorder>,
        skip: SkipFlags,
        has_key: bool,
    ) -> FetchDispatcher {
        FetchDispatcher::new(
            FetcherSet {
                video: Box::new(RecVideo(recorder.clone())),
                article: Box::new(RecArticle(recorder.clone())),
                captions: Box::new(RecCaptions(recorder.clone())),
                assets: Box::new(RecAssets(recorder)),
            },
            skip,
            has_key,
        )
    }

    fn video_lecture(kinds: &[MediaKind]) -> ResolvedLecture {
        ResolvedLecture {
            id: 1,
            title: "Intro".into(),
            asset: AssetDescriptor {
                kind: ContentKind::Video,
                media_sources: kinds
                    .iter()
                    .map(|&kind| MediaSource {
                        kind,
                        url: "u".into(),
                    })
                    .collect(),
                ..AssetDescriptor::default()
            },
        }
    }

    fn job<'a>(lecture: &'a ResolvedLecture, assets: &'a [SupplementaryAsset]) -> FetchJob<'a> {
        FetchJob {
            lecture,
            assets,
            output_stem: "01. Intro".into(),
            dest_dir: Path::new("/tmp/out"),
            temp_dir: Path::new("/tmp/tmp"),
        }
    }

    #[test]
    fn video_priority_is_dash_then_hls_then_mp4() {
        let rec = std::sync::Arc::new(Recorder::default());
        let d = dispatcher_with(rec.clone(), SkipFlags::default(), true);

        let all = video_lecture(&[
            MediaKind::ProgressiveMp4,
            MediaKind::HlsPlaylist,
            MediaKind::DashManifest,
        ]);
        d.dispatch(&job(&all, &[]), &NullSink).unwrap();
        let hls = video_lecture(&[MediaKind::ProgressiveMp4, MediaKind::HlsPlaylist]);
        d.dispatch(&job(&hls, &[]), &NullSink).unwrap();
        let mp4 = video_lecture(&[MediaKind::ProgressiveMp4]);
        d.dispatch(&job(&mp4, &[]), &NullSink).unwrap();

        assert_eq!(
            rec.calls(),
            vec![
                "video:DashManifest",
                "video:HlsPlaylist",
                "video:ProgressiveMp4"
            ]
        );
    }

    #[test]
    fn article_routes_to_article_fetcher() {
        let rec = std::sync::Arc::new(Recorder::default());
        let d = dispatcher_with(rec.clone(), SkipFlags::default(), false);
        let lecture = ResolvedLecture {
            id: 2,
            title: "Notes".into(),
            asset: AssetDescriptor {
                kind: ContentKind::Article,
                article_body: Some("<p>hello</p>".into()),
                ..AssetDescriptor::default()
            },
        };
        let path = d.dispatch(&job(&lecture, &[]), &NullSink).unwrap().unwrap();
        assert!(path.to_string_lossy().ends_with(".html"));
        assert_eq!(rec.calls(), vec!["article:12"]);
    }

    #[test]
    fn unknown_kind_is_unsupported_without_fetch() {
        let rec = std::sync::Arc::new(Recorder::default());
        let d = dispatcher_with(rec.clone(), SkipFlags::default(), false);
        let lecture = ResolvedLecture {
            id: 3,
            title: "Quiz".into(),
            asset: AssetDescriptor::default(),
        };
        let err = d.dispatch(&job(&lecture, &[]), &NullSink).unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedFormat { .. }));
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn video_with_no_sources_is_unsupported() {
        let rec = std::sync::Arc::new(Recorder::default());
        let d = dispatcher_with(rec.clone(), SkipFlags::default(), false);
        let lecture = video_lecture(&[]);
        let err = d.dispatch(&job(&lecture, &[]), &NullSink).unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedFormat { .. }));
    }

    #[test]
    fn side_operation_failures_do_not_fail_the_item() {
        let rec = std::sync::Arc::new(Recorder {
            fail_captions: true,
            fail_assets: true,
            ..Recorder::default()
        });
        let d = dispatcher_with(rec.clone(), SkipFlags::default(), true);
        let mut lecture = video_lecture(&[MediaKind::ProgressiveMp4]);
        lecture.asset.captions.push(CaptionTrack {
            locale: "en_US".into(),
            url: "c".into(),
            label: None,
        });
        let assets = vec![SupplementaryAsset {
            id: 9,
            title: "slides.pdf".into(),
            url: Some("a".into()),
        }];
        let result = d.dispatch(&job(&lecture, &assets), &NullSink).unwrap();
        assert!(result.is_some());
        // side ops attempted before the primary fetch
        assert_eq!(
            rec.calls(),
            vec!["captions:1", "asset:9", "video:ProgressiveMp4"]
        );
    }

    #[test]
    fn primary_failure_still_runs_side_operations() {
        let rec = std::sync::Arc::new(Recorder {
            fail_video: true,
            ..Recorder::default()
        });
        let d = dispatcher_with(rec.clone(), SkipFlags::default(), true);
        let mut lecture = video_lecture(&[MediaKind::ProgressiveMp4]);
        lecture.asset.captions.push(CaptionTrack {
            locale: "en_US".into(),
            url: "c".into(),
            label: None,
        });
        let err = d.dispatch(&job(&lecture, &[]), &NullSink).unwrap_err();
        assert!(matches!(err, DispatchError::Fetch(_)));
        assert_eq!(rec.calls(), vec!["captions:1", "video:ProgressiveMp4"]);
    }

    #[test]
    fn skip_flags_are_independent() {
        let rec = std::sync::Arc::new(Recorder::default());
        let d = dispatcher_with(
            rec.clone(),
            SkipFlags {
                lectures: true,
                captions: true,
                ..SkipFlags::default()
            },
            true,
        );
        let mut lecture = video_lecture(&[MediaKind::ProgressiveMp4]);
        lecture.asset.captions.push(CaptionTrack {
            locale: "en_US".into(),
            url: "c".into(),
            label: None,
        });
        let assets = vec![SupplementaryAsset {
            id: 9,
            title: "slides.pdf".into(),
            url: Some("a".into()),
        }];
        let result = d.dispatch(&job(&lecture, &assets), &NullSink).unwrap();
        assert!(result.is_none());
        assert_eq!(rec.calls(), vec!["asset:9"]);
    }
}
