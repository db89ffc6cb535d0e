#![forbid(unsafe_code)]

//! Failures a download job can end in.

use std::time::Duration;
use thiserror::Error;

pub type JobResult<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    /// Bad caller input; raised before anything is spawned.
    #[error("{0}")]
    Validation(String),

    #[error("yt-dlp timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// Spawn failure or non-zero exit of the external tool.
    #[error("{0}")]
    Subprocess(String),

    /// The tool reported success but no `{token}_*` file showed up.
    #[error("Downloaded file not found")]
    ArtifactNotFound,

    #[error("failed to parse yt-dlp output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    NotFound(String),
}

impl JobError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn filesystem(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Filesystem {
            context: context.into(),
            source,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_the_wire_format() {
        assert_eq!(
            JobError::ArtifactNotFound.to_string(),
            "Downloaded file not found"
        );
        assert_eq!(
            JobError::validation("URL is required").to_string(),
            "URL is required"
        );
        let timeout = JobError::Timeout {
            after: Duration::from_millis(1500),
        };
        assert_eq!(timeout.to_string(), "yt-dlp timed out after 1500ms");
    }

    #[test]
    fn filesystem_errors_keep_context() {
        let err = JobError::filesystem(
            "listing /out",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "listing /out: gone");
        assert!(!err.is_client_error());
    }

    #[test]
    fn parse_errors_convert_from_serde() {
        let err: JobError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, JobError::Parse(_)));
        assert!(err.to_string().starts_with("failed to parse yt-dlp output"));
    }
}
