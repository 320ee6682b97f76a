//! Version parsing and total ordering.
//!
//! A version string is split into parts at `.`, `-`, `_` and `+`, and at every
//! boundary between digits and letters, so `1.0-RC1` becomes `[1, 0, rc, 1]`.
//! Two strings with the same parts are the same version.
//!
//! Ordering, part by part:
//! - numeric parts compare numerically, and beat any textual part;
//! - textual parts rank `dev < (anything else, lexical) < rc < snapshot <
//!   final < ga < release < sp`;
//! - if one version runs out of parts, an extra numeric part makes the longer
//!   version higher (`1.1.0 > 1.1`) and an extra textual part makes it lower
//!   (`1.1.alpha < 1.1`).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::ParseError;

/// One normalized component of a [`Version`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionPart {
    /// A run of digits with leading zeros removed. Compared as an unbounded
    /// integer: shorter runs are smaller, equal lengths compare lexically.
    Numeric(String),
    /// A run of letters (lowercased).
    Text(String),
}

impl VersionPart {
    fn rank(text: &str) -> u8 {
        match text {
            "dev" => 0,
            "rc" => 2,
            "snapshot" => 3,
            "final" => 4,
            "ga" => 5,
            "release" => 6,
            "sp" => 7,
            _ => 1,
        }
    }
}

impl Ord for VersionPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Numeric(a), Self::Numeric(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Self::Numeric(_), Self::Text(_)) => Ordering::Greater,
            (Self::Text(_), Self::Numeric(_)) => Ordering::Less,
            (Self::Text(a), Self::Text(b)) => Self::rank(a)
                .cmp(&Self::rank(b))
                .then_with(|| a.cmp(b)),
        }
    }
}

impl PartialOrd for VersionPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => f.write_str(n),
            Self::Text(t) => write!(f, "{t}"),
        }
    }
}

/// A parsed, totally ordered version.
///
/// The original text is kept for display and for building file names; all
/// comparisons, equality and hashing use the normalized parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    raw: String,
    parts: Vec<VersionPart>,
}

impl Version {
    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Version`] if the string is empty, contains
    /// whitespace or control characters, or has no parts once separators are
    /// removed.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let raw = s.trim();
        if raw
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
        {
            return Err(ParseError::Version(s.to_string()));
        }

        let parts = split_parts(raw);
        if parts.is_empty() {
            return Err(ParseError::Version(s.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// The version exactly as it was written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The normalized parts.
    pub fn parts(&self) -> &[VersionPart] {
        &self.parts
    }

    /// The normalized form, parts joined with `.`.
    pub fn normalized(&self) -> String {
        self.parts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Whether this is a changing (snapshot) version whose content may differ
    /// between fetches.
    pub fn is_changing(&self) -> bool {
        matches!(self.parts.last(), Some(VersionPart::Text(t)) if t == "snapshot")
    }

    /// Whether `prefix`'s parts are a leading run of this version's parts.
    pub fn starts_with(&self, prefix: &Version) -> bool {
        self.parts.starts_with(&prefix.parts)
    }
}

fn split_parts(raw: &str) -> Vec<VersionPart> {
    fn flush(current: &mut String, parts: &mut Vec<VersionPart>) {
        if current.is_empty() {
            return;
        }
        let token = std::mem::take(current);
        let part = if token.chars().all(|c| c.is_ascii_digit()) {
            let digits = token.trim_start_matches('0');
            let digits = if digits.is_empty() { "0" } else { digits };
            VersionPart::Numeric(digits.to_string())
        } else {
            VersionPart::Text(token)
        };
        parts.push(part);
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_digits: Option<bool> = None;

    for c in raw.chars() {
        if matches!(c, '.' | '-' | '_' | '+') {
            flush(&mut current, &mut parts);
            in_digits = None;
            continue;
        }
        let is_digit = c.is_ascii_digit();
        if in_digits.is_some_and(|d| d != is_digit) {
            flush(&mut current, &mut parts);
        }
        current.push(c.to_ascii_lowercase());
        in_digits = Some(is_digit);
    }
    flush(&mut current, &mut parts);

    parts
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.parts.iter().zip(&other.parts) {
            let ord = a.cmp(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        let (ours, theirs) = (self.parts.len(), other.parts.len());
        match ours.cmp(&theirs) {
            Ordering::Equal => Ordering::Equal,
            Ordering::Greater => match self.parts[theirs] {
                VersionPart::Numeric(_) => Ordering::Greater,
                VersionPart::Text(_) => Ordering::Less,
            },
            Ordering::Less => match other.parts[ours] {
                VersionPart::Numeric(_) => Ordering::Less,
                VersionPart::Text(_) => Ordering::Greater,
            },
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.raw
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn numeric_parts_compare_numerically() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2.0") > v("1.99.99"));
        assert!(v("1.0.1") > v("1.0"));
    }

    #[test]
    fn oversized_numbers_still_compare_numerically() {
        assert!(v("1.99999999999999999999") > v("1.0"));
        assert!(v("1.99999999999999999999") > v("1.18446744073709551615"));
        assert!(v("1.100000000000000000000") > v("1.99999999999999999999"));
        assert_eq!(v("1.007"), v("1.7"));
        assert_eq!(v("1.000").normalized(), "1.0");
    }

    #[test]
    fn qualifiers_rank_below_release() {
        assert!(v("1.0-alpha") < v("1.0-beta"));
        assert!(v("1.0-beta") < v("1.0-rc1"));
        assert!(v("1.0-rc1") < v("1.0"));
        assert!(v("1.0-dev") < v("1.0-alpha"));
        assert!(v("1.0-SNAPSHOT") < v("1.0"));
        assert!(v("1.0-rc1") < v("1.0-SNAPSHOT"));
    }

    #[test]
    fn same_normalized_form_is_equal() {
        assert_eq!(v("1.0-RC1"), v("1.0.rc.1"));
        assert_eq!(v("1.0_rc1"), v("1.0-rc-1"));
        assert_eq!(v("1.0-RC1").cmp(&v("1.0.rc1")), Ordering::Equal);
        assert_eq!(v("1.0-RC1").normalized(), "1.0.rc.1");

        let mut set = std::collections::HashSet::new();
        set.insert(v("2.0-Final"));
        assert!(set.contains(&v("2.0.final")));
    }

    #[test]
    fn display_keeps_original_text() {
        assert_eq!(v("1.0-RC1").to_string(), "1.0-RC1");
    }

    #[test]
    fn detects_changing_versions() {
        assert!(v("1.0-SNAPSHOT").is_changing());
        assert!(!v("1.0").is_changing());
        assert!(!v("1.0-snapshot-2").is_changing());
    }

    #[test]
    fn sorting_is_total() {
        let mut versions = vec![
            v("1.0"),
            v("1.0.0"),
            v("1.0-rc1"),
            v("0.9"),
            v("1.0-SNAPSHOT"),
            v("1.1"),
        ];
        versions.sort();
        let sorted: Vec<&str> = versions.iter().map(Version::as_str).collect();
        assert_eq!(
            sorted,
            vec!["0.9", "1.0-rc1", "1.0-SNAPSHOT", "1.0", "1.0.0", "1.1"]
        );
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("...").is_err());
        assert!(Version::parse("1 0").is_err());
        assert!(Version::parse("1.0/evil").is_err());
    }
}
