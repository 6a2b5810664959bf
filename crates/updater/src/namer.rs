//! Destination names for downloaded artefacts.
//!
//! Collision handling is best-effort: another process may create a file with
//! the chosen name between the existence check here and the final rename.
//! Nothing here tries to make that window atomic.

use crate::checksum::verify_file;
use crate::filesystem::FileSystem;
use crate::metadata::Download;
use std::path::PathBuf;

/// Highest counter tried in `name (N).ext` before giving up.
pub const MAX_COLLISION_ATTEMPTS: u32 = 99;

const COMPOUND_EXTENSION: &str = ".tar.bz2";

/// Final path segment of `url`, cut at the first `?` or `#`.
///
/// Returns `None` when that leaves nothing usable as a filename.
pub fn download_filename(url: &str) -> Option<&str> {
    let tail = url.rsplit('/').next().unwrap_or(url);
    let name = tail.split(|c| c == '?' || c == '#').next().unwrap_or("");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    let lower = name.to_ascii_lowercase();
    if lower.len() > COMPOUND_EXTENSION.len() && lower.ends_with(COMPOUND_EXTENSION) {
        return name.split_at(name.len() - COMPOUND_EXTENSION.len());
    }
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

/// Picks where a verified download ends up inside the download directory.
#[derive(Debug, Clone)]
pub struct LocalFileNamer {
    dir: PathBuf,
}

impl LocalFileNamer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Resolve a destination for `download`.
    ///
    /// With `allow_existing`, an existing candidate whose size and checksum
    /// already match is returned as-is. Otherwise occupied names get a
    /// ` (N)` counter before the extension. Returns `None` once
    /// [`MAX_COLLISION_ATTEMPTS`] counters are exhausted.
    pub fn destination(
        &self,
        fs: &dyn FileSystem,
        download: &Download,
        allow_existing: bool,
    ) -> Option<PathBuf> {
        let filename = download_filename(&download.url)?;
        let (stem, ext) = split_extension(filename);

        let mut candidate = self.dir.join(filename);
        let mut attempt = 0;
        while fs.exists(&candidate) {
            if allow_existing && verify_file(fs, &candidate, download.size, &download.sha512) {
                tracing::debug!(path = ?candidate, "reusing verified artefact");
                return Some(candidate);
            }
            attempt += 1;
            if attempt > MAX_COLLISION_ATTEMPTS {
                tracing::warn!(filename, dir = ?self.dir, "no free destination name");
                return None;
            }
            candidate = self.dir.join(format!("{stem} ({attempt}){ext}"));
        }
        Some(candidate)
    }
}
