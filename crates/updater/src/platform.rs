//! Facts about the running build and host, and the URLs derived from them.

use chrono::NaiveDate;
use std::path::{Path, PathBuf};

/// Identity of the running build, compared against advertised builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    /// Own version string, e.g. `3.4.0`.
    pub version: String,
    /// Date the running build was produced. Nightlies are only offered when
    /// they are strictly newer than this.
    pub build_date: Option<NaiveDate>,
}

impl BuildInfo {
    /// Build info with a known version and build date.
    pub fn new(version: impl Into<String>, build_date: Option<NaiveDate>) -> Self {
        Self {
            version: version.into(),
            build_date,
        }
    }
}

/// Host description sent along with the version check.
pub trait PlatformInfo {
    /// Platform identifier understood by the update server.
    fn host_id(&self) -> String;

    /// Operating system `(major, minor)` version, when known.
    fn os_version(&self) -> Option<(u32, u32)> {
        None
    }

    /// Native word size of the operating system (32 or 64), when known.
    fn os_arch_bits(&self) -> Option<u32> {
        None
    }
}

/// [`PlatformInfo`] derived from the compile-time target.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPlatform;

impl PlatformInfo for HostPlatform {
    fn host_id(&self) -> String {
        format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
    }

    fn os_arch_bits(&self) -> Option<u32> {
        if cfg!(target_pointer_width = "64") {
            Some(64)
        } else if cfg!(target_pointer_width = "32") {
            Some(32)
        } else {
            None
        }
    }
}

/// Build the version-check URL for `host`.
///
/// `https://<host>/update.php?platform=<id>&version=<v>[&osversion=<maj>.<min>][&osarch=32|64]`
pub fn check_url(host: &str, build: &BuildInfo, platform: &dyn PlatformInfo) -> String {
    let mut url = format!(
        "https://{host}/update.php?platform={}&version={}",
        encode_spaces(&platform.host_id()),
        encode_spaces(&build.version)
    );
    if let Some((major, minor)) = platform.os_version() {
        url.push_str(&format!("&osversion={major}.{minor}"));
    }
    if let Some(bits @ (32 | 64)) = platform.os_arch_bits() {
        url.push_str(&format!("&osarch={bits}"));
    }
    url
}

fn encode_spaces(value: &str) -> String {
    value.replace(' ', "%20")
}

/// Staging location for a download: `<temp>/update_<16 hex chars>.tmp`.
pub fn staging_path(temp_dir: &Path, checksum: &str) -> PathBuf {
    let prefix = checksum.get(..16).unwrap_or(checksum);
    temp_dir.join(format!("update_{prefix}.tmp"))
}
