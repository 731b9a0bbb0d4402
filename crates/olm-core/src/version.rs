//! Version parsing and ordering for update decisions.
//!
//! Versions have the form `MAJOR.MINOR.PATCH[-PRERELEASE]`, optionally with a
//! leading `v` as found in release tags. Two parsers exist:
//!
//! - [`Version::parse_lenient`] never fails. Components that do not parse
//!   degrade to zero. [`compare`] and [`is_newer`] use it.
//! - [`FromStr`] / [`validate`] are strict and return
//!   [`CoreError::InvalidVersionFormat`]. Gating decisions should validate first.
//!
//! Ordering compares the numeric triple, then ranks a release above any
//! prerelease of the same triple, then compares prerelease tags as plain strings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// A parsed version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Version {
    /// Major version number.
    pub major: u64,
    /// Minor version number.
    pub minor: u64,
    /// Patch version number.
    pub patch: u64,
    /// Prerelease tag without the leading `-`.
    pub pre_release: Option<String>,
}

/// Which component [`Version::bump`] increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bump {
    /// `x.0.0`
    Major,
    /// `_.x.0`
    Minor,
    /// `_._.x`
    Patch,
}

/// Classification of a remote version relative to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Major number increased.
    Major,
    /// Minor number increased.
    Minor,
    /// Patch number increased.
    Patch,
    /// Same triple, newer prerelease or prerelease to release.
    PreRelease,
    /// Versions compare equal.
    Same,
    /// Remote is older.
    Downgrade,
}

impl UpdateKind {
    /// Human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Major => "major update",
            Self::Minor => "minor update",
            Self::Patch => "patch update",
            Self::PreRelease => "prerelease update",
            Self::Same => "up to date",
            Self::Downgrade => "downgrade",
        }
    }

    /// True for every kind that moves forward.
    #[must_use]
    pub const fn is_upgrade(&self) -> bool {
        matches!(
            self,
            Self::Major | Self::Minor | Self::Patch | Self::PreRelease
        )
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Version {
    /// Create a release version.
    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
        }
    }

    /// Version of the running binary.
    #[must_use]
    pub fn current() -> Self {
        Self::parse_lenient(env!("CARGO_PKG_VERSION"))
    }

    /// Parse without failing. Missing or non-numeric components become 0.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        let s = strip_tag_prefix(s);
        let (core, pre_release) = split_pre_release(s);
        let mut parts = core.split('.').map(leading_number);

        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
            pre_release,
        }
    }

    /// True when a prerelease tag is present.
    #[must_use]
    pub fn is_pre_release(&self) -> bool {
        self.pre_release.is_some()
    }

    /// The same triple without the prerelease tag.
    #[must_use]
    pub fn stable(&self) -> Self {
        Self::new(self.major, self.minor, self.patch)
    }

    /// Increment one component, reset the lower ones, drop the prerelease.
    ///
    /// A component already at `u64::MAX` stays there.
    #[must_use]
    pub fn bump(&self, bump: Bump) -> Self {
        match bump {
            Bump::Major => Self::new(self.major.saturating_add(1), 0, 0),
            Bump::Minor => Self::new(self.major, self.minor.saturating_add(1), 0),
            Bump::Patch => Self::new(self.major, self.minor, self.patch.saturating_add(1)),
        }
    }

    /// True when `min <= self <= max` for each bound given.
    #[must_use]
    pub fn satisfies(&self, min: Option<&Version>, max: Option<&Version>) -> bool {
        min.is_none_or(|min| self >= min) && max.is_none_or(|max| self <= max)
    }
}

fn strip_tag_prefix(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('v')
        .or_else(|| s.strip_prefix('V'))
        .unwrap_or(s)
}

fn split_pre_release(s: &str) -> (&str, Option<String>) {
    match s.split_once('-') {
        Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
        Some((core, _)) => (core, None),
        None => (s, None),
    }
}

fn leading_number(part: &str) -> u64 {
    let digits = part
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map_or("", |(idx, c)| &part[..idx + c.len_utf8()]);
    digits.parse().unwrap_or(0)
}

fn is_valid_pre_release(pre: &str) -> bool {
    !pre.is_empty()
        && !pre.starts_with('.')
        && !pre.ends_with('.')
        && pre.chars().all(|c| c.is_ascii_alphanumeric() || c == '.')
}

impl FromStr for Version {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidVersionFormat(s.to_string());
        let trimmed = strip_tag_prefix(s);

        let (core, pre_release) = match trimmed.split_once('-') {
            Some((core, pre)) if is_valid_pre_release(pre) => (core, Some(pre.to_string())),
            Some(_) => return Err(invalid()),
            None => (trimmed, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre_release,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.pre_release {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

/// Order two version strings leniently.
#[must_use]
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::parse_lenient(a).cmp(&Version::parse_lenient(b))
}

/// True when `remote` is strictly newer than `current`.
#[must_use]
pub fn is_newer(current: &str, remote: &str) -> bool {
    compare(remote, current) == Ordering::Greater
}

/// Next version string after `version` for the given bump.
#[must_use]
pub fn next_version(version: &str, bump: Bump) -> String {
    Version::parse_lenient(version).bump(bump).to_string()
}

/// Strictly validate a version string.
pub fn validate(version: &str) -> Result<Version> {
    version.parse()
}

/// Classify `remote` relative to `current`.
#[must_use]
pub fn classify(current: &str, remote: &str) -> UpdateKind {
    let current = Version::parse_lenient(current);
    let remote = Version::parse_lenient(remote);

    match remote.cmp(&current) {
        Ordering::Equal => UpdateKind::Same,
        Ordering::Less => UpdateKind::Downgrade,
        Ordering::Greater if remote.major > current.major => UpdateKind::Major,
        Ordering::Greater if remote.minor > current.minor => UpdateKind::Minor,
        Ordering::Greater if remote.patch > current.patch => UpdateKind::Patch,
        Ordering::Greater => UpdateKind::PreRelease,
    }
}

/// True when the update should be offered: forced, or strictly newer.
#[must_use]
pub fn should_update(current: &str, remote: &str, force: bool) -> bool {
    force || is_newer(current, remote)
}
