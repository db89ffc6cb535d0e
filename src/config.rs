#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_INFO_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const DEFAULT_MAX_AGE_MINUTES: u64 = 30;

/// How long finished artifacts may stay in the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Sweep period; zero or negative disables the periodic sweep.
    pub interval_minutes: i64,
    pub max_age_minutes: u64,
}

impl RetentionPolicy {
    pub fn periodic_interval(&self) -> Option<Duration> {
        u64::try_from(self.interval_minutes)
            .ok()
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes * 60))
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_minutes * 60)
    }
}

/// Everything the service reads from its environment, resolved once at
/// startup and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub output_dir: PathBuf,
    pub server_url: Option<String>,
    pub cors_origin: String,
    pub app_env: Option<String>,
    pub ytdlp_bin: PathBuf,
    pub cookies_from_browser: Option<String>,
    pub max_file_size: Option<String>,
    pub rate_limit: Option<String>,
    pub max_concurrent_downloads: Option<usize>,
    pub download_timeout: Option<Duration>,
    pub retention: RetentionPolicy,
}

impl AppConfig {
    /// Minimal configuration rooted at `output_dir`; used by tests and as the
    /// base that the loader fills in.
    pub fn new(output_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
            output_dir: output_dir.into(),
            server_url: None,
            cors_origin: DEFAULT_CORS_ORIGIN.to_string(),
            app_env: None,
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            cookies_from_browser: None,
            max_file_size: None,
            rate_limit: None,
            max_concurrent_downloads: None,
            download_timeout: None,
            retention: RetentionPolicy {
                interval_minutes: 0,
                max_age_minutes: DEFAULT_MAX_AGE_MINUTES,
            },
        }
    }

    pub fn info_timeout(&self) -> Duration {
        self.download_timeout.unwrap_or(DEFAULT_INFO_TIMEOUT)
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT)
    }

    /// Base used when handing out `/downloads/...` links.
    pub fn public_base_url(&self) -> String {
        match &self.server_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Snapshot served by `GET /api/config`.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            host: self.host.clone(),
            port: self.port,
            app_env: self.app_env.clone(),
            server_url: self.server_url.clone(),
            public_base_url: self.public_base_url(),
            cors_origin: self.cors_origin.clone(),
            ytdlp_bin: self.ytdlp_bin.to_string_lossy().into_owned(),
            ytdlp_cookies_from_browser: self.cookies_from_browser.clone(),
            ytdlp_output_path: self.output_dir.to_string_lossy().into_owned(),
            ytdlp_max_file_size: self.max_file_size.clone(),
            ytdlp_rate_limit: self.rate_limit.clone(),
            max_concurrent_downloads: self.max_concurrent_downloads,
            download_timeout: self
                .download_timeout
                .map(|timeout| timeout.as_millis() as u64),
            file_cleanup_interval: self.retention.interval_minutes,
            file_max_age: self.retention.max_age_minutes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub host: String,
    pub port: u16,
    /// Keeps the key existing `/api/config` clients already read.
    #[serde(rename = "nodeEnv")]
    pub app_env: Option<String>,
    pub server_url: Option<String>,
    pub public_base_url: String,
    pub cors_origin: String,
    pub ytdlp_bin: String,
    pub ytdlp_cookies_from_browser: Option<String>,
    pub ytdlp_output_path: String,
    pub ytdlp_max_file_size: Option<String>,
    pub ytdlp_rate_limit: Option<String>,
    pub max_concurrent_downloads: Option<usize>,
    pub download_timeout: Option<u64>,
    pub file_cleanup_interval: i64,
    pub file_max_age: u64,
}

/// Values passed on the command line; they win over env and `.env`.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn load_config(overrides: ConfigOverrides) -> Result<AppConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_config(&file_vars, env_var_string, overrides)
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<AppConfig> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let port = match overrides.port {
        Some(port) => port,
        None => {
            let raw = lookup("PORT").ok_or_else(|| anyhow!("PORT not set"))?;
            raw.parse::<u16>()
                .with_context(|| format!("PORT must be a port number, got {raw:?}"))?
        }
    };
    let output_dir = overrides
        .output_dir
        .or_else(|| lookup("YTDLP_OUTPUT_PATH").map(PathBuf::from))
        .ok_or_else(|| anyhow!("YTDLP_OUTPUT_PATH not set"))?;

    let mut config = AppConfig::new(output_dir, port);

    if let Some(host) = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("HOST"))
    {
        config.host = host;
    }
    config.server_url = lookup("SERVER_URL");
    if let Some(origin) = lookup("CORS_ORIGIN") {
        config.cors_origin = origin;
    }
    config.app_env = lookup("APP_ENV").or_else(|| lookup("NODE_ENV"));
    if let Some(bin) = lookup("YTDLP_BIN") {
        config.ytdlp_bin = PathBuf::from(bin);
    }
    config.cookies_from_browser = lookup("YTDLP_COOKIES_FROM_BROWSER");
    config.max_file_size = lookup("YTDLP_MAX_FILE_SIZE");
    config.rate_limit = lookup("YTDLP_RATE_LIMIT");
    config.max_concurrent_downloads = lookup("MAX_CONCURRENT_DOWNLOADS")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0);
    config.download_timeout = lookup("DOWNLOAD_TIMEOUT")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis);

    let interval_minutes = lookup("FILE_CLEANUP_INTERVAL")
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0);
    let max_age_minutes = lookup("FILE_MAX_AGE")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|minutes| *minutes > 0)
        .or_else(|| u64::try_from(interval_minutes).ok().filter(|m| *m > 0))
        .unwrap_or(DEFAULT_MAX_AGE_MINUTES);
    config.retention = RetentionPolicy {
        interval_minutes,
        max_age_minutes,
    };

    Ok(config)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
