//! YAML configuration loading with generated per-field comments.
//!
//! The file is created with defaults on first run. On load, user values are
//! merged over the defaults so a file written by an older build keeps working;
//! if keys are missing the file is rewritten in full so the user always sees
//! every available option with its comment.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;
    fn fields() -> &'static [FieldMeta];
}

/// Load `path` (or `FILE_NAME` in the working directory), creating it with
/// defaults when absent.
pub fn load_or_create<T: ConfigSpec>(path: Option<&Path>) -> Result<T, ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(T::FILE_NAME));
    ensure_parent(&path)?;

    if !path.exists() {
        let defaults = T::default();
        write_with_comments(&defaults, &path)?;
        return Ok(defaults);
    }

    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let user: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })?;

    let mut merged =
        serde_yaml::to_value(T::default()).map_err(|err| ConfigError::Invalid(err.to_string()))?;
    let user_is_partial = is_partial::<T>(&user);
    merge_over(&mut merged, user);
    let config: T =
        serde_yaml::from_value(merged).map_err(|err| ConfigError::Invalid(err.to_string()))?;

    if user_is_partial {
        write_with_comments(&config, &path)?;
    }
    Ok(config)
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    ensure_parent(path)?;
    let yaml = render_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Render the config as YAML with each field preceded by its comment line,
/// in declaration order.
fn render_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let Value::Mapping(mapping) =
        serde_yaml::to_value(config).map_err(|err| ConfigError::Invalid(err.to_string()))?
    else {
        return Err(ConfigError::Invalid(
            "config must serialize to a mapping".to_string(),
        ));
    };

    let mut lines = Vec::new();
    for field in T::fields() {
        if !field.description.is_empty() {
            lines.push(format!("# {}", field.description));
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let entry = serde_yaml::to_string(&serde_yaml::Mapping::from_iter([(key, val)]))
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        lines.push(entry.trim().to_string());
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}

fn is_partial<T: ConfigSpec>(user: &Value) -> bool {
    let Value::Mapping(map) = user else {
        return true;
    };
    T::fields()
        .iter()
        .any(|field| !map.contains_key(Value::String(field.name.to_string())))
}

fn merge_over(dest: &mut Value, user: Value) {
    match (dest, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                if let Some(dest_val) = dest.get_mut(&key) {
                    merge_over(dest_val, user_val);
                } else {
                    dest.insert(key, user_val);
                }
            }
        }
        // sequences replace wholesale, no element-wise merge
        (dest, other) => *dest = other,
    }
}

fn ensure_parent(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::context::Config;
    use tempfile::TempDir;

    #[test]
    fn first_run_creates_commented_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        let config: Config = load_or_create(Some(&path)).unwrap();
        assert_eq!(config.concurrent_downloads, 4);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("# Parallel download slots (1-25)"));
        assert!(raw.contains("concurrent_downloads: 4"));
    }

    #[test]
    fn user_values_survive_merge_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "concurrent_downloads: 9\ncookie_header: abc=1\n").unwrap();

        let config: Config = load_or_create(Some(&path)).unwrap();
        assert_eq!(config.concurrent_downloads, 9);
        assert_eq!(config.cookie_header, "abc=1");
        // untouched fields keep their defaults
        assert_eq!(config.request_timeout, 15);

        // the partial file was rewritten with the full field set
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("concurrent_downloads: 9"));
        assert!(raw.contains("request_timeout: 15"));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, ":{not yaml").unwrap();
        let err = load_or_create::<Config>(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
