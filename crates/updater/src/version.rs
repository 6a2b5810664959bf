//! Numeric, segment-wise version ordering.

use std::cmp::Ordering;
use std::fmt;

/// A dotted version number with an optional pre-release tag, e.g.
/// `3.5.0` or `3.5.0-beta2`.
///
/// Segments compare numerically, so `2.10` is newer than `2.9`. Missing
/// trailing segments count as zero. A release outranks any pre-release with
/// the same numbers.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    segments: Vec<u64>,
    pre: Option<String>,
}

impl Version {
    /// Parse a version string. Returns `None` unless every dotted segment is
    /// a decimal number.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text
            .strip_prefix('v')
            .or_else(|| text.strip_prefix('V'))
            .unwrap_or(text);

        let (numbers, pre) = match text.split_once('-') {
            Some((numbers, pre)) if !pre.is_empty() => (numbers, Some(pre.to_string())),
            Some(_) => return None,
            None => (text, None),
        };

        let segments = numbers
            .split('.')
            .map(|segment| {
                if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
                    None
                } else {
                    segment.parse::<u64>().ok()
                }
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self { segments, pre })
    }

    /// Numeric segments, in order.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Pre-release tag, if any.
    pub fn pre_release(&self) -> Option<&str> {
        self.pre.as_deref()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => compare_tags(a, b),
        }
    }
}

/// Compare two version strings. Unparseable versions order before every
/// parseable one and equal to each other.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

/// Natural ordering for pre-release tags: digit runs compare numerically,
/// text runs case-insensitively, and a digit run sorts before a text run.
fn compare_tags(a: &str, b: &str) -> Ordering {
    let a = tag_runs(a);
    let b = tag_runs(b);
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x, y) {
            (Run::Digits(x), Run::Digits(y)) => {
                let x = x.trim_start_matches('0');
                let y = y.trim_start_matches('0');
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Run::Text(x), Run::Text(y)) => x.cmp(y),
            (Run::Digits(_), Run::Text(_)) => Ordering::Less,
            (Run::Text(_), Run::Digits(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

enum Run {
    Digits(String),
    Text(String),
}

fn tag_runs(tag: &str) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for ch in tag.chars() {
        match (runs.last_mut(), ch.is_ascii_digit()) {
            (Some(Run::Digits(run)), true) => run.push(ch),
            (Some(Run::Text(run)), false) => run.extend(ch.to_lowercase()),
            (_, true) => runs.push(Run::Digits(ch.to_string())),
            (_, false) => runs.push(Run::Text(ch.to_lowercase().collect())),
        }
    }
    runs
}
