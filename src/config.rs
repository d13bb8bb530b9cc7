#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_PATH: &str = "ytsearch.db";
pub const DEFAULT_THUMBNAILS_DIR: &str = "thumbnails";
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BATCH_SIZE: u64 = 10;
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_FEED_TITLE: &str = "Youtube Search";
pub const DEFAULT_FEED_LINK: &str = "http://localhost:8080/feed/youtube-search";
pub const DEFAULT_FEED_DESCRIPTION: &str = "Cool youtube video's";

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub thumbnails_dir: PathBuf,
    pub api_key: Option<String>,
    pub api_base: String,
    pub http_timeout: Duration,
    pub batch_size: u64,
    pub interval: Duration,
    pub host: String,
    pub port: u16,
    pub feed_title: String,
    pub feed_link: String,
    pub feed_description: String,
}

impl Settings {
    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("YOUTUBE_API_KEY not set"))
    }
}

/// Values supplied on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub db_path: Option<PathBuf>,
    pub thumbnails_dir: Option<PathBuf>,
    pub api_key: Option<String>,
    pub batch_size: Option<u64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn load_settings() -> Result<Settings> {
    resolve_settings(SettingsOverrides::default())
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings(&file_vars, env_var_string, overrides))
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let text = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let text_or = |key: &str, default: &str| text(key).unwrap_or_else(|| default.to_string());
    let secs = |key: &str, default: u64| {
        Duration::from_secs(parsed(text(key)).filter(|secs| *secs > 0).unwrap_or(default))
    };

    Settings {
        db_path: overrides
            .db_path
            .unwrap_or_else(|| PathBuf::from(text_or("YTSEARCH_DB", DEFAULT_DB_PATH))),
        thumbnails_dir: overrides.thumbnails_dir.unwrap_or_else(|| {
            PathBuf::from(text_or("YTSEARCH_THUMBNAILS", DEFAULT_THUMBNAILS_DIR))
        }),
        api_key: non_blank(overrides.api_key).or_else(|| text("YOUTUBE_API_KEY")),
        api_base: text_or("YOUTUBE_API_BASE", DEFAULT_API_BASE),
        http_timeout: secs("YTSEARCH_HTTP_TIMEOUT", DEFAULT_HTTP_TIMEOUT_SECS),
        batch_size: overrides
            .batch_size
            .or_else(|| parsed(text("YTSEARCH_BATCH_SIZE")))
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE),
        interval: secs("YTSEARCH_INTERVAL", DEFAULT_INTERVAL_SECS),
        host: non_blank(overrides.host)
            .or_else(|| text("YTSEARCH_HOST"))
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: overrides
            .port
            .or_else(|| parsed(text("YTSEARCH_PORT")))
            .unwrap_or(DEFAULT_PORT),
        feed_title: text_or("YTSEARCH_FEED_TITLE", DEFAULT_FEED_TITLE),
        feed_link: text_or("YTSEARCH_FEED_LINK", DEFAULT_FEED_LINK),
        feed_description: text_or("YTSEARCH_FEED_DESCRIPTION", DEFAULT_FEED_DESCRIPTION),
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|value| value.parse::<T>().ok())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

/// Parses `KEY=value` lines. `export` prefixes, single or double quotes and
/// `#` comments are accepted; a missing file yields no values.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|inner| inner.strip_suffix(*quote))
        })
        .unwrap_or(value)
}
