#![forbid(unsafe_code)]

//! Shared security helpers: startup guard and filename checks for the routes
//! that take a filename from the URL.

use std::path::{Component, Path};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. yt-dlp runs arbitrary
/// extractor code against remote sites; it should not do that with root's
/// privileges over the output directory.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or pass --allow-root inside a disposable container"
        );
    }
    Ok(())
}

/// True when `name` is a single plain path segment, so joining it onto the
/// output directory can never leave that directory.
pub fn is_safe_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
