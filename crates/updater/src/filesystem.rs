use std::fs;
use std::io::{self, Read};
use std::path::Path;

/// Filesystem queries the updater needs around downloaded artefacts.
///
/// Abstracted so the naming and verification logic can be exercised against
/// an in-memory tree.
pub trait FileSystem {
    /// Size of the regular file at `path`, or `None` if it does not exist.
    fn file_size(&self, path: &Path) -> Option<u64>;

    /// Whether anything (file, directory, link) exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Open `path` for streaming reads.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>>;

    /// Remove the file at `path`.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Move `from` to `to`, replacing nothing that the caller did not check.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// [`FileSystem`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn file_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path)
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            // Staging and download directories may live on different volumes.
            Err(err) if crosses_devices(&err) => {
                tracing::debug!(?from, ?to, "rename across devices, copying: {err}");
                fs::copy(from, to)?;
                fs::remove_file(from)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(unix)]
const CROSS_DEVICE_LINK: i32 = 18; // EXDEV
#[cfg(windows)]
const CROSS_DEVICE_LINK: i32 = 17; // ERROR_NOT_SAME_DEVICE

fn crosses_devices(err: &io::Error) -> bool {
    #[cfg(any(unix, windows))]
    {
        err.raw_os_error() == Some(CROSS_DEVICE_LINK)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reports_size_only_for_regular_files() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.bin");
        fs::write(&file, b"12345").unwrap();

        assert_eq!(LocalFs.file_size(&file), Some(5));
        assert_eq!(LocalFs.file_size(dir.path()), None);
        assert!(LocalFs.exists(dir.path()));
        assert!(!LocalFs.exists(&dir.path().join("missing")));
    }

    #[test]
    fn rename_creates_missing_parent() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("staged.tmp");
        let to = dir.path().join("nested").join("final.bin");
        fs::write(&from, b"payload").unwrap();

        LocalFs.rename(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn failed_rename_reports_original_error() {
        let dir = tempdir().unwrap();
        let to = dir.path().join("final.bin");

        let err = LocalFs
            .rename(&dir.path().join("missing.tmp"), &to)
            .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!to.exists());
    }

    #[test]
    fn only_cross_device_errors_fall_back_to_copy() {
        assert!(crosses_devices(&io::Error::from_raw_os_error(CROSS_DEVICE_LINK)));
        assert!(!crosses_devices(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(!crosses_devices(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
