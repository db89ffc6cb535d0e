#![forbid(unsafe_code)]

//! HTTP gateway in front of the `yt-dlp` command-line tool.
//!
//! Requests are turned into one subprocess run each; downloaded files are
//! either streamed back and deleted, or left in the output directory behind a
//! link until the retention sweeper reclaims them.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metadata;
pub mod retention;
pub mod sanitize;
pub mod security;
pub mod ytdlp;
