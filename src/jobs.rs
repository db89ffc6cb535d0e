#![forbid(unsafe_code)]

//! Download job lifecycle: turn a request into one yt-dlp run, then find the
//! file it wrote.
//!
//! yt-dlp picks the final filename itself (title + extension), so every job
//! gets a correlation token that is baked into the output template as a
//! `{token}_` prefix. After the process exits the output directory is scanned
//! for that prefix. Tokens are unique per process (timestamp, sequence number
//! and a random suffix) and are reserved in the [`JobRegistry`] before the
//! process starts, so two concurrent jobs can never claim each other's file.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use tokio::{
    runtime::Handle,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{JobError, JobResult};
use crate::metadata::{VideoInfo, parse_video_info};
use crate::ytdlp::{DEFAULT_FORMAT, ExternalTool, Invocation, ToolFlags, ToolOutput, build_args};

/// Suffixes yt-dlp uses for files it has not finished writing.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl"];

/// The five things a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    VideoInfo,
    DownloadBinary,
    DownloadAudioBinary,
    DownloadUrlRef,
    DownloadAudioUrlRef,
}

impl JobMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VideoInfo => "video-info",
            Self::DownloadBinary => "download",
            Self::DownloadAudioBinary => "download-mp3",
            Self::DownloadUrlRef => "download-url",
            Self::DownloadAudioUrlRef => "download-mp3-url",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::DownloadAudioBinary | Self::DownloadAudioUrlRef)
    }

    /// Binary modes stream the artifact back and delete it afterwards.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::DownloadBinary | Self::DownloadAudioBinary)
    }

    pub fn content_type(self) -> &'static str {
        if self.is_audio() {
            "audio/mpeg"
        } else {
            "application/octet-stream"
        }
    }
}

/// Generates correlation tokens of the form `{unix_millis}-{seq}-{random}`.
/// Tokens never contain `_`, which separates them from the title on disk.
#[derive(Debug, Default)]
pub struct TokenSource {
    seq: AtomicU64,
}

impl TokenSource {
    pub fn next_token(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{:08x}",
            Utc::now().timestamp_millis(),
            seq,
            OsRng.next_u32()
        )
    }
}

/// What the registry knows about one in-flight job. Logged when the job is
/// released.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub mode: JobMode,
    pub url: String,
    pub artifact: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

/// In-memory map from correlation token to job. Entries live exactly as long
/// as the [`JobGuard`] handed out by [`JobRegistry::reserve`].
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
}

impl JobRegistry {
    /// Claims `token`; returns `None` if it is already taken.
    pub fn reserve(&self, token: &str, entry: JobEntry) -> Option<JobGuard> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(token) {
            return None;
        }
        jobs.insert(token.to_string(), entry);
        Some(JobGuard {
            registry: self.clone(),
            token: token.to_string(),
        })
    }

    fn resolve(&self, token: &str, artifact: &Path) {
        if let Some(entry) = self.jobs.lock().get_mut(token) {
            entry.artifact = Some(artifact.to_path_buf());
        }
    }

    /// Number of jobs currently holding a token.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, token: &str) -> Option<JobEntry> {
        self.jobs.lock().get(token).cloned()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the registry entry when dropped.
#[derive(Debug)]
pub struct JobGuard {
    registry: JobRegistry,
    token: String,
}

impl JobGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let Some(entry) = self.registry.jobs.lock().remove(&self.token) else {
            return;
        };
        let elapsed_ms = (Utc::now() - entry.started_at).num_milliseconds();
        debug!(
            token = %self.token,
            mode = entry.mode.as_str(),
            url = %entry.url,
            artifact = ?entry.artifact,
            elapsed_ms,
            "job released"
        );
    }
}

/// A finished download sitting in the output directory.
#[derive(Debug)]
pub struct Artifact {
    pub mode: JobMode,
    pub path: PathBuf,
    /// Name on disk, token prefix included.
    pub file_name: String,
    /// Name with the `{token}_` prefix removed.
    pub display_name: String,
    pub size: u64,
    job: JobGuard,
}

impl Artifact {
    pub fn token(&self) -> &str {
        self.job.token()
    }

    /// Hands the file over to a guard that removes it from disk on drop.
    pub fn delete_on_drop(self) -> ArtifactCleanup {
        ArtifactCleanup {
            path: self.path,
            job: Some(self.job),
        }
    }
}

/// Deletes the artifact when dropped, whether or not the response that owned
/// it finished. Failures are only logged; the response is already gone.
///
/// Inside a runtime the unlink runs on the blocking pool, and the job keeps
/// its token until the file is gone.
#[derive(Debug)]
pub struct ArtifactCleanup {
    path: PathBuf,
    job: Option<JobGuard>,
}

impl ArtifactCleanup {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactCleanup {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        let job = self.job.take();
        let remove = move || {
            remove_artifact(&path);
            drop(job);
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(file = %path.display(), "removed streamed artifact"),
        Err(err) => warn!(
            file = %path.display(),
            error = %err,
            "could not delete streamed artifact"
        ),
    }
}

/// Runs jobs against the external tool. Cheap to share behind an `Arc`.
pub struct JobRunner {
    config: Arc<AppConfig>,
    flags: ToolFlags,
    tool: Arc<dyn ExternalTool>,
    registry: JobRegistry,
    tokens: TokenSource,
    permits: Option<Arc<Semaphore>>,
}

impl JobRunner {
    pub fn new(config: Arc<AppConfig>, tool: Arc<dyn ExternalTool>) -> Self {
        let permits = config
            .max_concurrent_downloads
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            flags: ToolFlags::from_config(&config),
            config,
            tool,
            registry: JobRegistry::default(),
            tokens: TokenSource::default(),
            permits,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Fetches metadata only; nothing is written to disk.
    pub async fn video_info(&self, url: Option<&str>) -> JobResult<VideoInfo> {
        let url = require_url(url)?;
        let args = build_args(&self.flags, Invocation::DumpJson, url);

        let _permit = self.admit().await?;
        info!(url, "fetching video info");
        let output = self.tool.run(args, self.config.info_timeout()).await?;
        log_stderr(&output, JobMode::VideoInfo);
        parse_video_info(&output.stdout)
    }

    /// Downloads `url` into the output directory and returns the file it
    /// produced. `format` only applies to video modes and defaults to `best`.
    pub async fn download(
        &self,
        url: Option<&str>,
        mode: JobMode,
        format: Option<&str>,
    ) -> JobResult<Artifact> {
        if mode == JobMode::VideoInfo {
            return Err(JobError::validation("video-info does not download files"));
        }
        let url = require_url(url)?;
        let format = format
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_FORMAT);

        let job = self.reserve_job(mode, url);
        let token = job.token().to_string();
        let template = self.output_template(&token);
        let template_arg = template.to_string_lossy();
        let invocation = if mode.is_audio() {
            Invocation::Audio {
                template: &template_arg,
            }
        } else {
            Invocation::Video {
                format,
                template: &template_arg,
            }
        };
        let args = build_args(&self.flags, invocation, url);

        let _permit = self.admit().await?;
        info!(
            %token,
            mode = mode.as_str(),
            url,
            active = self.registry.len(),
            "starting download"
        );
        let output = self.tool.run(args, self.config.fetch_timeout()).await?;
        log_stderr(&output, mode);

        let file_name = find_artifact(self.output_dir(), &token).await?;
        let path = self.output_dir().join(&file_name);
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|err| JobError::filesystem(format!("reading {}", path.display()), err))?
            .len();
        self.registry.resolve(&token, &path);

        let display_name = file_name
            .strip_prefix(&format!("{token}_"))
            .unwrap_or(&file_name)
            .to_string();
        info!(%token, file = %file_name, size, "download completed");

        Ok(Artifact {
            mode,
            path,
            file_name,
            display_name,
            size,
            job,
        })
    }

    fn output_template(&self, token: &str) -> PathBuf {
        self.output_dir().join(format!("{token}_%(title)s.%(ext)s"))
    }

    fn reserve_job(&self, mode: JobMode, url: &str) -> JobGuard {
        loop {
            let token = self.tokens.next_token();
            let entry = JobEntry {
                mode,
                url: url.to_string(),
                artifact: None,
                started_at: Utc::now(),
            };
            if let Some(guard) = self.registry.reserve(&token, entry) {
                return guard;
            }
            warn!(%token, "correlation token collision, regenerating");
        }
    }

    /// Waits for a subprocess slot when a cap is configured.
    async fn admit(&self) -> JobResult<Option<OwnedSemaphorePermit>> {
        let Some(permits) = &self.permits else {
            return Ok(None);
        };
        if permits.available_permits() == 0 {
            info!("all download slots busy, waiting");
        }
        permits
            .clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| JobError::Subprocess("download queue closed".to_string()))
    }
}

fn require_url(url: Option<&str>) -> JobResult<&str> {
    url.map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| JobError::validation("URL is required"))
}

fn log_stderr(output: &ToolOutput, mode: JobMode) {
    if !output.stderr.is_empty() {
        warn!(mode = mode.as_str(), stderr = %output.stderr, "yt-dlp wrote to stderr");
    }
}

/// Lists `dir` and picks the artifact for `token`.
async fn find_artifact(dir: &Path, token: &str) -> JobResult<String> {
    let prefix = format!("{token}_");
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| JobError::filesystem(format!("listing {}", dir.display()), err))?;
    let mut matches = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| JobError::filesystem(format!("listing {}", dir.display()), err))?
    {
        let name = entry
            .file_name()
            .into_string()
            .unwrap_or_else(|os| os.to_string_lossy().into_owned());
        if name.starts_with(&prefix) {
            matches.push(name);
        }
    }
    choose_artifact(token, matches)
}

/// Several matches only happen when yt-dlp leaves side files behind; skip
/// partial downloads and take the first remaining name in sorted order.
fn choose_artifact(token: &str, mut names: Vec<String>) -> JobResult<String> {
    names.retain(|name| !PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)));
    names.sort();
    if names.len() > 1 {
        warn!(%token, candidates = ?names, "several files share the job prefix, using the first");
    }
    names.into_iter().next().ok_or(JobError::ArtifactNotFound)
}
