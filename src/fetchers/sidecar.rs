//! Side-operation fetchers: caption tracks and supplementary assets.

use std::fmt::Write as _;
use std::sync::OnceLock;

use anyhow::bail;
use regex::Regex;
use tracing::{debug, info};

use crate::base_system::context::safe_fs_name;
use crate::catalog::models::{CaptionTrack, SupplementaryAsset};
use crate::download::dispatch::{AssetFetcher, CaptionFetcher, FetchJob, NullSink};

// ── captions ─────────────────────────────────────────────────────

pub struct CaptionDownloader {
    client: reqwest::blocking::Client,
    locales: Vec<String>,
    convert_to_srt: bool,
}

impl CaptionDownloader {
    pub fn new(
        client: reqwest::blocking::Client,
        locales: Vec<String>,
        convert_to_srt: bool,
    ) -> Self {
        Self {
            client,
            locales,
            convert_to_srt,
        }
    }

    fn wanted(&self, track: &CaptionTrack) -> bool {
        self.locales
            .iter()
            .any(|wanted| locale_matches(wanted, &track.locale))
    }
}

impl CaptionFetcher for CaptionDownloader {
    fn fetch_captions(&self, job: &FetchJob<'_>, tracks: &[CaptionTrack]) -> anyhow::Result<()> {
        for track in tracks.iter().filter(|t| self.wanted(t)) {
            let resp = self
                .client
                .get(&track.url)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status)?;
            let vtt = resp.text()?;
            let (ext, content) = if self.convert_to_srt {
                ("srt", vtt_to_srt(&vtt))
            } else {
                ("vtt", vtt)
            };
            let dest = job
                .dest_dir
                .join(format!("{}.{}.{}", job.output_stem, track.locale, ext));
            std::fs::write(&dest, content)?;
            info!(target: "fetch", locale = %track.locale, path = %dest.display(), "caption saved");
        }
        Ok(())
    }
}

/// `wanted` may be a full locale (`en_US`) or a bare language (`en`), and
/// `all` matches everything. Dashes and case are normalized away.
fn locale_matches(wanted: &str, actual: &str) -> bool {
    let wanted = wanted.trim().to_ascii_lowercase().replace('-', "_");
    if wanted == "all" {
        return true;
    }
    let actual = actual.trim().to_ascii_lowercase().replace('-', "_");
    actual == wanted || actual.starts_with(&format!("{wanted}_"))
}

fn cue_timing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            (?:(\d{2,}):)?(\d{2}):(\d{2})\.(\d{3})
            \s*-->\s*
            (?:(\d{2,}):)?(\d{2}):(\d{2})\.(\d{3})",
        )
        .unwrap_or_else(|e| panic!("invalid cue timing pattern: {e}"))
    })
}

/// Minimal WebVTT to SubRip conversion: numbered cues, comma millisecond
/// separators, cue settings and non-cue blocks (headers, NOTE, STYLE)
/// dropped.
pub fn vtt_to_srt(vtt: &str) -> String {
    let re = cue_timing_re();
    let mut out = String::new();
    let mut counter = 0u32;
    let mut lines = vtt.lines();
    while let Some(line) = lines.next() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        counter += 1;
        let ts = |h: Option<regex::Match<'_>>, m: usize, s: usize, ms: usize| {
            format!(
                "{}:{}:{},{}",
                h.map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| "00".into()),
                &caps[m],
                &caps[s],
                &caps[ms]
            )
        };
        let start = ts(caps.get(1), 2, 3, 4);
        let end = ts(caps.get(5), 6, 7, 8);
        let _ = writeln!(out, "{counter}\n{start} --> {end}");
        for text in lines.by_ref() {
            if text.trim().is_empty() {
                break;
            }
            out.push_str(text);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

// ── supplementary assets ─────────────────────────────────────────

pub struct AssetDownloader {
    client: reqwest::blocking::Client,
}

impl AssetDownloader {
    pub fn new(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

impl AssetFetcher for AssetDownloader {
    fn fetch_asset(&self, job: &FetchJob<'_>, asset: &SupplementaryAsset) -> anyhow::Result<()> {
        let Some(url) = &asset.url else {
            bail!("'{}' has no download url", asset.title);
        };
        let dest = job.dest_dir.join(safe_fs_name(&asset.title));
        if dest.exists() {
            debug!(target: "fetch", path = %dest.display(), "asset already present, skipping");
            return Ok(());
        }
        super::download_to_file(&self.client, url, &dest, &NullSink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_matching() {
        assert!(locale_matches("en_US", "en_US"));
        assert!(locale_matches("en", "en_US"));
        assert!(locale_matches("en-us", "en_US"));
        assert!(locale_matches("all", "fr_FR"));
        assert!(!locale_matches("en_US", "en_GB"));
        assert!(!locale_matches("de", "en_US"));
    }

    #[test]
    fn vtt_converts_to_numbered_srt_cues() {
        let vtt = "WEBVTT\n\
                   Kind: captions\n\
                   \n\
                   NOTE this block is dropped\n\
                   \n\
                   cue-1\n\
                   00:00:01.500 --> 00:00:04.250 align:start\n\
                   Hello there.\n\
                   \n\
                   01:02:03.000 --> 01:02:05.750\n\
                   Two lines\n\
                   of text.\n";
        let srt = vtt_to_srt(vtt);
        assert_eq!(
            srt,
            "1\n00:00:01,500 --> 00:00:04,250\nHello there.\n\n\
             2\n01:02:03,000 --> 01:02:05,750\nTwo lines\nof text.\n\n"
        );
    }

    #[test]
    fn vtt_without_hours_gets_padded() {
        let vtt = "WEBVTT\n\n00:01.000 --> 00:03.000\nhi\n";
        let srt = vtt_to_srt(vtt);
        assert!(srt.contains("00:00:01,000 --> 00:00:03,000"));
    }
}
