//! Video fetch operations. Progressive MP4 is downloaded in-process; DASH and
//! HLS representations go through an external segment downloader subprocess
//! (segment merge and decryption stay inside that tool).

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, bail};
use tracing::{debug, info};

use crate::catalog::models::{MediaKind, MediaSource};
use crate::download::dispatch::{FetchJob, ProgressSink, VideoFetcher};

pub struct VideoDownloader {
    client: reqwest::blocking::Client,
    stream_tool: String,
    decryption_key: Option<String>,
}

impl VideoDownloader {
    pub fn new(
        client: reqwest::blocking::Client,
        stream_tool: String,
        decryption_key: Option<String>,
    ) -> Self {
        Self {
            client,
            stream_tool,
            decryption_key,
        }
    }

    fn fetch_progressive(
        &self,
        job: &FetchJob<'_>,
        source: &MediaSource,
        sink: &dyn ProgressSink,
    ) -> anyhow::Result<PathBuf> {
        let dest = job.dest_dir.join(format!("{}.mp4", job.output_stem));
        super::download_to_file(&self.client, &source.url, &dest, sink)?;
        Ok(dest)
    }

    /// Hand the manifest/playlist URL to the external tool, then move its
    /// output from the temp directory into place.
    fn fetch_stream(&self, job: &FetchJob<'_>, source: &MediaSource) -> anyhow::Result<PathBuf> {
        let mut cmd = Command::new(&self.stream_tool);
        cmd.arg(&source.url)
            .arg("--save-dir")
            .arg(job.temp_dir)
            .arg("--save-name")
            .arg(&job.output_stem)
            .arg("-M")
            .arg("format=mp4");
        if let Some(key) = &self.decryption_key {
            cmd.arg("--key").arg(key);
        }
        debug!(target: "fetch", tool = %self.stream_tool, url = %source.url, "spawning stream downloader");

        let status = cmd
            .status()
            .with_context(|| format!("launching '{}'; is it installed and on PATH?", self.stream_tool))?;
        if !status.success() {
            bail!(
                "stream downloader exited with {} for '{}'",
                status,
                job.lecture.title
            );
        }

        let produced = job.temp_dir.join(format!("{}.mp4", job.output_stem));
        if !produced.exists() {
            bail!(
                "stream downloader reported success but produced no file for '{}'",
                job.lecture.title
            );
        }
        let dest = job.dest_dir.join(format!("{}.mp4", job.output_stem));
        std::fs::rename(&produced, &dest)
            .with_context(|| format!("moving {} into place", produced.display()))?;
        Ok(dest)
    }
}

impl VideoFetcher for VideoDownloader {
    fn fetch_video(
        &self,
        job: &FetchJob<'_>,
        source: &MediaSource,
        sink: &dyn ProgressSink,
    ) -> anyhow::Result<PathBuf> {
        info!(target: "fetch", title = %job.lecture.title, kind = ?source.kind, "downloading video");
        match source.kind {
            MediaKind::ProgressiveMp4 => self.fetch_progressive(job, source, sink),
            MediaKind::DashManifest | MediaKind::HlsPlaylist => self.fetch_stream(job, source),
        }
    }
}
