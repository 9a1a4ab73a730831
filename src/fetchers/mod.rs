//! Concrete fetch operations behind the dispatcher's traits: progressive and
//! stream video, article bodies, captions, supplementary assets.

pub mod article;
pub mod sidecar;
pub mod video;

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::base_system::context::Config;
use crate::download::dispatch::{FetcherSet, ProgressSink};

const CHUNK_SIZE: usize = 64 * 1024;

/// Build the production fetcher set from configuration. One HTTP client is
/// shared across all of them (reqwest clients are cheaply cloneable).
pub fn default_fetchers(config: &Config, decryption_key: Option<&str>) -> anyhow::Result<FetcherSet> {
    let mut headers = reqwest::header::HeaderMap::new();
    let cookie = config.cookie_header.trim();
    if !cookie.is_empty() {
        headers.insert(
            reqwest::header::COOKIE,
            reqwest::header::HeaderValue::from_str(cookie)
                .context("cookie header contains invalid characters")?,
        );
    }
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(config.request_timeout.max(1)))
        .default_headers(headers)
        .build()
        .context("building HTTP client")?;

    Ok(FetcherSet {
        video: Box::new(video::VideoDownloader::new(
            client.clone(),
            config.stream_downloader_path.clone(),
            decryption_key.map(str::to_string),
        )),
        article: Box::new(article::ArticleWriter),
        captions: Box::new(sidecar::CaptionDownloader::new(
            client.clone(),
            config.caption_locales.clone(),
            config.convert_captions_to_srt,
        )),
        assets: Box::new(sidecar::AssetDownloader::new(client)),
    })
}

/// Streamed download into a `.part` sibling, renamed into place on success.
/// A killed process leaves only the partial file behind, never a truncated
/// final artifact.
pub(crate) fn download_to_file(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    sink: &dyn ProgressSink,
) -> anyhow::Result<()> {
    let mut resp = client
        .get(url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .with_context(|| format!("requesting {url}"))?;
    let total = resp.content_length();

    let part = dest.with_extension(match dest.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.part"),
        None => "part".to_string(),
    });
    let mut file = fs::File::create(&part)
        .with_context(|| format!("creating {}", part.display()))?;

    let mut buf = [0u8; CHUNK_SIZE];
    let mut downloaded = 0u64;
    loop {
        let n = resp.read(&mut buf).context("reading response body")?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("writing {}", part.display()))?;
        downloaded += n as u64;
        sink.update(downloaded, total);
    }
    file.flush().ok();
    drop(file);

    fs::rename(&part, dest).with_context(|| format!("moving {} into place", part.display()))?;
    Ok(())
}
