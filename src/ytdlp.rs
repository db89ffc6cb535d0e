#![forbid(unsafe_code)]

//! Everything that knows yt-dlp's command-line grammar.
//!
//! Argument lists are built as plain vectors (no shell involved) and handed to
//! an [`ExternalTool`]. Production uses [`YtDlpProcess`]; tests swap in a fake
//! that records the calls and writes the files yt-dlp would have written.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::AppConfig;
use crate::error::{JobError, JobResult};

/// Desktop browser UA sent for metadata and video fetches.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const AUDIO_EXTRACTOR_ARGS: &str = "youtube:player_client=android";
pub const DEFAULT_FORMAT: &str = "best";

/// Per-deployment flags appended to every invocation that accepts them.
#[derive(Debug, Clone, Default)]
pub struct ToolFlags {
    pub cookies_from_browser: Option<String>,
    pub max_file_size: Option<String>,
    pub rate_limit: Option<String>,
}

impl ToolFlags {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            cookies_from_browser: config.cookies_from_browser.clone(),
            max_file_size: config.max_file_size.clone(),
            rate_limit: config.rate_limit.clone(),
        }
    }
}

/// What a single yt-dlp call is asked to do.
#[derive(Debug, Clone, Copy)]
pub enum Invocation<'a> {
    /// `--dump-json`, nothing is written to disk.
    DumpJson,
    Video { format: &'a str, template: &'a str },
    /// Extract audio and convert it to mp3.
    Audio { template: &'a str },
}

/// Builds the argv (without the program name) for one invocation. The order
/// is fixed so that callers and tests can rely on it.
pub fn build_args(flags: &ToolFlags, invocation: Invocation<'_>, url: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |values: &[&str]| args.extend(values.iter().map(|value| value.to_string()));

    match invocation {
        Invocation::DumpJson => {
            push(&["--dump-json", "--user-agent", USER_AGENT]);
            if let Some(browser) = &flags.cookies_from_browser {
                push(&["--cookies-from-browser", browser.as_str()]);
            }
        }
        Invocation::Video { format, template } => {
            push(&["--user-agent", USER_AGENT]);
            if let Some(browser) = &flags.cookies_from_browser {
                push(&["--cookies-from-browser", browser.as_str()]);
            }
            push(&["-o", template]);
            push_limits(&mut push, flags);
            push(&["-f", format]);
        }
        Invocation::Audio { template } => {
            if let Some(browser) = &flags.cookies_from_browser {
                push(&["--cookies-from-browser", browser.as_str()]);
            }
            push(&["--extractor-args", AUDIO_EXTRACTOR_ARGS]);
            push(&["-o", template]);
            push(&["-x", "--audio-format", "mp3"]);
            push_limits(&mut push, flags);
        }
    }

    push(&["--", url]);
    args
}

fn push_limits(push: &mut impl FnMut(&[&str]), flags: &ToolFlags) {
    if let Some(size) = &flags.max_file_size {
        push(&["--max-filesize", size.as_str()]);
    }
    if let Some(rate) = &flags.rate_limit {
        push(&["--limit-rate", rate.as_str()]);
    }
}

/// Captured output of a finished, successful run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Seam around the external downloader process.
#[async_trait]
pub trait ExternalTool: Send + Sync {
    /// Runs the tool to completion. A run that outlives `timeout` must be
    /// terminated and reported as [`JobError::Timeout`]; a non-zero exit is a
    /// [`JobError::Subprocess`].
    async fn run(&self, args: Vec<String>, timeout: Duration) -> JobResult<ToolOutput>;
}

/// Spawns the real yt-dlp binary.
#[derive(Debug, Clone)]
pub struct YtDlpProcess {
    program: PathBuf,
}

impl YtDlpProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl ExternalTool for YtDlpProcess {
    async fn run(&self, args: Vec<String>, timeout: Duration) -> JobResult<ToolOutput> {
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                JobError::Subprocess(format!("launching {}: {err}", self.program.display()))
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| {
                JobError::Subprocess(format!("waiting for {}: {err}", self.program.display()))
            })?,
            Err(_) => return Err(JobError::Timeout { after: timeout }),
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let mut message = format!("{} exited with {}", self.program.display(), output.status);
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr);
            }
            return Err(JobError::Subprocess(message));
        }

        Ok(ToolOutput {
            stdout: output.stdout,
            stderr,
        })
    }
}
