//! Runtime configuration and filesystem naming helpers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // paths
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    // network
    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_catalog_base_url")]
    pub catalog_base_url: String,
    #[serde(default = "default_string")]
    pub cookie_header: String,

    // captions
    #[serde(default = "default_caption_locales")]
    pub caption_locales: Vec<String>,
    #[serde(default = "default_false")]
    pub convert_captions_to_srt: bool,

    // content toggles
    #[serde(default = "default_false")]
    pub skip_lectures: bool,
    #[serde(default = "default_false")]
    pub skip_captions: bool,
    #[serde(default = "default_false")]
    pub skip_assets: bool,
    #[serde(default = "default_false")]
    pub skip_articles: bool,

    // stream downloads
    #[serde(default = "default_stream_downloader_path")]
    pub stream_downloader_path: String,
    #[serde(default = "default_string")]
    pub decryption_key: String,

    // resume checks
    #[serde(default = "default_size_threshold")]
    pub completed_size_tolerance: u64,
    #[serde(default = "default_size_threshold")]
    pub min_completed_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            cache_dir: default_cache_dir(),
            concurrent_downloads: default_concurrent_downloads(),
            request_timeout: default_request_timeout(),
            catalog_base_url: default_catalog_base_url(),
            cookie_header: default_string(),
            caption_locales: default_caption_locales(),
            convert_captions_to_srt: default_false(),
            skip_lectures: default_false(),
            skip_captions: default_false(),
            skip_assets: default_false(),
            skip_articles: default_false(),
            stream_downloader_path: default_stream_downloader_path(),
            decryption_key: default_string(),
            completed_size_tolerance: default_size_threshold(),
            min_completed_size: default_size_threshold(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 16] = [
            FieldMeta {
                name: "output_dir",
                description: "Directory course folders are created under",
            },
            FieldMeta {
                name: "cache_dir",
                description: "Directory for per-course progress files",
            },
            FieldMeta {
                name: "concurrent_downloads",
                description: "Parallel download slots (1-25)",
            },
            FieldMeta {
                name: "request_timeout",
                description: "HTTP connect timeout in seconds",
            },
            FieldMeta {
                name: "catalog_base_url",
                description: "Base URL of the course platform",
            },
            FieldMeta {
                name: "cookie_header",
                description: "Raw Cookie header copied from a logged-in browser session",
            },
            FieldMeta {
                name: "caption_locales",
                description: "Caption locales to download, e.g. [en_US, de]; 'all' for every track",
            },
            FieldMeta {
                name: "convert_captions_to_srt",
                description: "Convert downloaded WebVTT captions to SubRip (.srt)",
            },
            FieldMeta {
                name: "skip_lectures",
                description: "Skip the lecture videos themselves (captions/assets still run)",
            },
            FieldMeta {
                name: "skip_captions",
                description: "Skip caption tracks",
            },
            FieldMeta {
                name: "skip_assets",
                description: "Skip supplementary assets (slides, exercise files)",
            },
            FieldMeta {
                name: "skip_articles",
                description: "Skip article lectures",
            },
            FieldMeta {
                name: "stream_downloader_path",
                description: "Path to the external DASH/HLS segment downloader executable",
            },
            FieldMeta {
                name: "decryption_key",
                description: "Widevine key as kid:key, passed through to the segment downloader",
            },
            FieldMeta {
                name: "completed_size_tolerance",
                description: "Allowed byte difference between a file on disk and its recorded size",
            },
            FieldMeta {
                name: "min_completed_size",
                description: "Files smaller than this many bytes are treated as truncated",
            },
        ];
        &FIELDS
    }
}

impl Config {
    pub fn output_dir_path(&self) -> PathBuf {
        if self.output_dir.trim().is_empty() {
            PathBuf::from("courses")
        } else {
            PathBuf::from(&self.output_dir)
        }
    }

    pub fn cache_dir_path(&self) -> PathBuf {
        if self.cache_dir.trim().is_empty() {
            PathBuf::from("cache")
        } else {
            PathBuf::from(&self.cache_dir)
        }
    }
}

const MAX_NAME_LEN: usize = 120;

/// Turn an arbitrary catalog title into a name usable on every filesystem we
/// care about: forbidden characters replaced, control characters stripped,
/// Windows reserved device names escaped, length capped at a char boundary.
pub fn safe_fs_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .filter_map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => Some('_'),
            c if (c as u32) < 32 => None,
            _ => Some(ch),
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        cleaned.push_str("untitled");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned.insert(0, '_');
    }

    if cleaned.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
        while cleaned.ends_with(' ') || cleaned.ends_with('.') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            cleaned.push_str("untitled");
        }
    }

    cleaned
}


fn default_false() -> bool {
    false
}

fn default_string() -> String {
    String::new()
}

fn default_output_dir() -> String {
    "courses".to_string()
}

fn default_cache_dir() -> String {
    "cache".to_string()
}

fn default_concurrent_downloads() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    15
}

fn default_catalog_base_url() -> String {
    "https://www.udemy.com".to_string()
}

fn default_caption_locales() -> Vec<String> {
    vec!["en_US".to_string()]
}

fn default_stream_downloader_path() -> String {
    "N_m3u8DL-RE".to_string()
}

fn default_size_threshold() -> u64 {
    1024
}
