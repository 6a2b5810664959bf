//! Version metadata returned by the update server.
//!
//! The body is line oriented:
//!
//! ```text
//! <channel> <version-or-date> [<url> <size> <hash-algo> <hash-hex>]
//! ...
//! <blank line>
//! <changelog free text>
//! ```
//!
//! Unknown or malformed lines are skipped so that older clients keep working
//! when the server grows new fields.

use crate::namer::download_filename;
use crate::platform::BuildInfo;
use crate::settings::ChannelPreference;
use crate::version::Version;
use chrono::NaiveDate;

/// The only digest accepted for download verification.
pub const SUPPORTED_HASH: &str = "sha512";

const NIGHTLY_DATE_FORMAT: &str = "%Y-%m-%d";

/// Update track an entry was advertised on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Nightly,
    Beta,
    Stable,
}

impl Channel {
    /// Map a wire tag to its channel. `release` is the stable track.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "nightly" => Some(Channel::Nightly),
            "beta" => Some(Channel::Beta),
            "release" => Some(Channel::Stable),
            _ => None,
        }
    }
}

/// Where and how to fetch a build, and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub url: String,
    /// Exact size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-512 digest.
    pub sha512: String,
}

/// One advertised build.
///
/// A descriptor with a version but no [`Download`] is known but cannot be
/// fetched. An empty version means "nothing advertised".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildDescriptor {
    /// Version string, or the build date for nightlies.
    pub version: String,
    pub download: Option<Download>,
}

impl BuildDescriptor {
    pub fn is_empty(&self) -> bool {
        self.version.is_empty()
    }

    pub fn is_downloadable(&self) -> bool {
        self.download.is_some()
    }
}

/// Everything learned from one metadata response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMetadata {
    pub nightly: BuildDescriptor,
    pub beta: BuildDescriptor,
    pub stable: BuildDescriptor,
    /// The build to offer, chosen by [`VersionMetadata::select_available`].
    /// Empty when there is no update.
    pub available: BuildDescriptor,
    pub changelog: String,
}

impl VersionMetadata {
    /// Pick the build to offer under `preference`.
    ///
    /// Nightly wins when nightlies are wanted, then beta unless the user is
    /// on stable only, then stable. A preference for nightlies with no
    /// nightly advertised falls through to beta and stable.
    pub fn select_available(&mut self, preference: ChannelPreference) {
        self.available = if !self.nightly.is_empty() && preference == ChannelPreference::Nightly {
            self.nightly.clone()
        } else if !self.beta.is_empty() && preference != ChannelPreference::Stable {
            self.beta.clone()
        } else if !self.stable.is_empty() {
            self.stable.clone()
        } else {
            BuildDescriptor::default()
        };
    }

    /// Whether a newer build than the running one is advertised.
    pub fn has_update(&self) -> bool {
        !self.available.is_empty()
    }

    fn channel_mut(&mut self, channel: Channel) -> &mut BuildDescriptor {
        match channel {
            Channel::Nightly => &mut self.nightly,
            Channel::Beta => &mut self.beta,
            Channel::Stable => &mut self.stable,
        }
    }
}

/// Parse a complete metadata body relative to the running `build`.
///
/// Entries that are not newer than the running build are dropped. A later
/// line for the same channel replaces the earlier one.
pub fn parse_metadata(
    raw: &str,
    build: &BuildInfo,
    preference: ChannelPreference,
) -> VersionMetadata {
    let own_version = Version::parse(&build.version);
    let mut metadata = VersionMetadata::default();

    let mut rest = raw;
    while !rest.is_empty() {
        let (line, tail) = match rest.find('\n') {
            Some(end) => (&rest[..end], &rest[end + 1..]),
            None => (rest, ""),
        };
        rest = tail;

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            metadata.changelog = tail.trim().to_string();
            break;
        }

        if let Some((channel, descriptor)) = parse_entry(&tokens, build, own_version.as_ref()) {
            *metadata.channel_mut(channel) = descriptor;
        }
    }

    metadata.select_available(preference);
    metadata
}

fn parse_entry(
    tokens: &[&str],
    build: &BuildInfo,
    own_version: Option<&Version>,
) -> Option<(Channel, BuildDescriptor)> {
    if tokens.len() != 2 && tokens.len() != 6 {
        tracing::debug!(tokens = tokens.len(), "skipping metadata line with unexpected arity");
        return None;
    }

    let channel = match Channel::from_tag(tokens[0]) {
        Some(channel) => channel,
        None => {
            tracing::debug!(tag = tokens[0], "skipping unknown channel");
            return None;
        }
    };

    let advertised = tokens[1];
    let newer = match channel {
        Channel::Nightly => {
            match (
                NaiveDate::parse_from_str(advertised, NIGHTLY_DATE_FORMAT),
                build.build_date,
            ) {
                (Ok(date), Some(own)) => date > own,
                _ => false,
            }
        }
        Channel::Beta | Channel::Stable => match Version::parse(advertised) {
            Some(version) => own_version.map_or(true, |own| version > *own),
            None => false,
        },
    };
    if !newer {
        tracing::debug!(?channel, advertised, "ignoring build that is not newer");
        return None;
    }

    let download = if tokens.len() == 6 {
        parse_download(&tokens[2..])
    } else {
        None
    };

    Some((
        channel,
        BuildDescriptor {
            version: advertised.to_string(),
            download,
        },
    ))
}

fn parse_download(fields: &[&str]) -> Option<Download> {
    let [url, size, algorithm, digest] = fields else {
        return None;
    };

    if !algorithm.eq_ignore_ascii_case(SUPPORTED_HASH) {
        tracing::warn!(algorithm, "unsupported hash algorithm, dropping download");
        return None;
    }
    let Ok(size) = size.parse::<u64>() else {
        tracing::warn!(size, "invalid download size, dropping download");
        return None;
    };
    if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        tracing::warn!(digest, "digest is not hex, dropping download");
        return None;
    }
    if download_filename(url).is_none() {
        tracing::warn!(url, "download url has no filename, dropping download");
        return None;
    }

    Some(Download {
        url: url.to_string(),
        size,
        sha512: digest.to_ascii_lowercase(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn build(version: &str) -> BuildInfo {
        BuildInfo::new(version, NaiveDate::from_ymd_opt(2024, 3, 1))
    }

    #[test]
    fn newer_release_becomes_available() {
        let raw = format!("release 3.5.0 https://example/f-3.5.0.tar.bz2 1048576 sha512 {DIGEST}\n");
        let metadata = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Stable);

        let expected = BuildDescriptor {
            version: "3.5.0".into(),
            download: Some(Download {
                url: "https://example/f-3.5.0.tar.bz2".into(),
                size: 1_048_576,
                sha512: DIGEST.into(),
            }),
        };
        assert_eq!(metadata.stable, expected);
        assert_eq!(metadata.available, expected);
        assert!(metadata.has_update());
    }

    #[test]
    fn older_release_is_discarded() {
        let raw = format!("release 3.5.0 https://example/f-3.5.0.tar.bz2 1048576 sha512 {DIGEST}\n");
        let metadata = parse_metadata(&raw, &build("3.6.0"), ChannelPreference::Stable);

        assert!(metadata.stable.is_empty());
        assert!(!metadata.has_update());
    }

    #[test]
    fn blank_line_starts_changelog() {
        let raw = "release 3.5.0\n\n  Fixed things.\nbeta 9.9.9\n\n";
        let metadata = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Beta);

        assert_eq!(metadata.changelog, "Fixed things.\nbeta 9.9.9");
        assert!(metadata.beta.is_empty());
        assert_eq!(metadata.available.version, "3.5.0");
    }

    #[test]
    fn whitespace_only_line_counts_as_blank() {
        let raw = "release 3.5.0\n \t \nnotes";
        let metadata = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Stable);
        assert_eq!(metadata.changelog, "notes");
    }

    #[test]
    fn malformed_and_unknown_lines_are_skipped() {
        let raw = "release\nrelease 3.5.0 extra\nalpha 9.0.0\nfuture 1 2 3 4 5 6 7\nbeta 3.6.0-beta1\n";
        let metadata = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Beta);

        assert!(metadata.stable.is_empty());
        assert_eq!(metadata.beta.version, "3.6.0-beta1");
        assert_eq!(metadata.available.version, "3.6.0-beta1");
    }

    #[test]
    fn unsupported_hash_keeps_version_only() {
        let raw = format!("release 3.5.0 https://example/f.zip 10 SHA256 {DIGEST}\n");
        let metadata = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Stable);

        assert_eq!(metadata.stable.version, "3.5.0");
        assert!(!metadata.stable.is_downloadable());
    }

    #[test]
    fn hash_name_is_case_insensitive_and_digest_lowercased() {
        let raw = format!(
            "release 3.5.0 https://example/f.zip 10 SHA512 {}\n",
            DIGEST.to_ascii_uppercase()
        );
        let metadata = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Stable);

        let download = metadata.stable.download.expect("download kept");
        assert_eq!(download.sha512, DIGEST);
    }

    #[test]
    fn url_without_filename_drops_download() {
        let raw = format!("release 3.5.0 https://example/ 10 sha512 {DIGEST}\n");
        let metadata = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Stable);

        assert_eq!(metadata.stable.version, "3.5.0");
        assert!(metadata.stable.download.is_none());
    }

    #[test]
    fn invalid_size_drops_download() {
        let raw = format!("release 3.5.0 https://example/f.zip -5 sha512 {DIGEST}\n");
        let metadata = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Stable);
        assert!(metadata.stable.download.is_none());
    }

    #[test]
    fn later_line_overwrites_channel() {
        let raw = format!(
            "release 3.5.0 https://example/a.zip 10 sha512 {DIGEST}\nrelease 3.5.1\n"
        );
        let metadata = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Stable);

        assert_eq!(
            metadata.stable,
            BuildDescriptor {
                version: "3.5.1".into(),
                download: None,
            }
        );
    }

    #[test]
    fn nightly_requires_newer_date() {
        let raw = "nightly 2024-03-02\n";
        let metadata = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Nightly);
        assert_eq!(metadata.available.version, "2024-03-02");

        let same_day = parse_metadata("nightly 2024-03-01\n", &build("3.4.0"), ChannelPreference::Nightly);
        assert!(same_day.nightly.is_empty());

        let garbage = parse_metadata("nightly yesterday\n", &build("3.4.0"), ChannelPreference::Nightly);
        assert!(garbage.nightly.is_empty());

        let undated = parse_metadata(raw, &BuildInfo::new("3.4.0", None), ChannelPreference::Nightly);
        assert!(undated.nightly.is_empty());
    }

    #[test]
    fn preference_orders_channels() {
        let raw = "nightly 2024-05-01\nbeta 3.6.0-beta1\nrelease 3.5.0\n";

        let stable = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Stable);
        assert_eq!(stable.available.version, "3.5.0");

        let beta = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Beta);
        assert_eq!(beta.available.version, "3.6.0-beta1");

        let nightly = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Nightly);
        assert_eq!(nightly.available.version, "2024-05-01");
    }

    #[test]
    fn nightly_preference_falls_through_without_nightly() {
        let raw = "beta 3.6.0-beta1\nrelease 3.5.0\n";
        let metadata = parse_metadata(raw, &build("3.4.0"), ChannelPreference::Nightly);
        assert_eq!(metadata.available.version, "3.6.0-beta1");

        let stable_only = parse_metadata("release 3.5.0\n", &build("3.4.0"), ChannelPreference::Nightly);
        assert_eq!(stable_only.available.version, "3.5.0");
    }

    #[test]
    fn reparsing_is_idempotent() {
        let raw = format!(
            "nightly 2024-05-01 https://example/n.zip 5 sha512 {DIGEST}\nbeta 3.6.0-beta1\nrelease 3.5.0 https://example/f.tar.bz2 7 sha512 {DIGEST}\n\nNotes here\n"
        );
        let first = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Nightly);
        let second = parse_metadata(&raw, &build("3.4.0"), ChannelPreference::Nightly);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_body_has_no_update() {
        let metadata = parse_metadata("", &build("3.4.0"), ChannelPreference::Nightly);
        assert_eq!(metadata, VersionMetadata::default());
    }
}
