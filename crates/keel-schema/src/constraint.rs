//! Version constraints.
//!
//! Accepted forms:
//! - `1.0`, `=1.0`, `[1.0]`: exactly that version
//! - `[1.0,2.0)`, `(1.0,]`, `(,2.0]`: Maven-style intervals
//! - `>=1.0`, `>1.0, <2.0`, `<=3`: operator ranges (comma or space separated)
//! - `1.2.+`: any version whose parts start with `1.2`
//! - `+`, `*`, `latest`, `latest.integration`: any version
//! - `latest.release`: any non-changing version

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

use crate::error::ParseError;
use crate::version::Version;

/// A half-open, closed, or unbounded interval of versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    lower: Bound<Version>,
    upper: Bound<Version>,
}

impl VersionRange {
    /// Create a range from explicit bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Constraint`] if the range cannot contain any
    /// version (lower above upper, or equal bounds that are not both inclusive).
    pub fn new(lower: Bound<Version>, upper: Bound<Version>) -> Result<Self, ParseError> {
        let empty = match (&lower, &upper) {
            (
                Bound::Included(lo) | Bound::Excluded(lo),
                Bound::Included(hi) | Bound::Excluded(hi),
            ) => {
                let both_inclusive =
                    matches!(lower, Bound::Included(_)) && matches!(upper, Bound::Included(_));
                lo > hi || (lo == hi && !both_inclusive)
            }
            _ => false,
        };
        let range = Self { lower, upper };
        if empty {
            return Err(ParseError::Constraint {
                input: range.to_string(),
                reason: "range is empty".to_string(),
            });
        }
        Ok(range)
    }

    /// The lower bound.
    pub fn lower(&self) -> &Bound<Version> {
        &self.lower
    }

    /// The upper bound.
    pub fn upper(&self) -> &Bound<Version> {
        &self.upper
    }

    /// Whether `version` lies inside the range.
    pub fn contains(&self, version: &Version) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => version >= lo,
            Bound::Excluded(lo) => version > lo,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => version <= hi,
            Bound::Excluded(hi) => version < hi,
            Bound::Unbounded => true,
        };
        above && below
    }
}

/// Half-bounded ranges print in operator form (`>=1.0`), the rest as intervals.
impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.lower, &self.upper) {
            (Bound::Included(v), Bound::Unbounded) => return write!(f, ">={v}"),
            (Bound::Excluded(v), Bound::Unbounded) => return write!(f, ">{v}"),
            (Bound::Unbounded, Bound::Included(v)) => return write!(f, "<={v}"),
            (Bound::Unbounded, Bound::Excluded(v)) => return write!(f, "<{v}"),
            _ => {}
        }
        match &self.lower {
            Bound::Included(v) => write!(f, "[{v}")?,
            Bound::Excluded(v) => write!(f, "({v}")?,
            Bound::Unbounded => write!(f, "(")?,
        }
        write!(f, ",")?;
        match &self.upper {
            Bound::Included(v) => write!(f, "{v}]"),
            Bound::Excluded(v) => write!(f, "{v})"),
            Bound::Unbounded => write!(f, ")"),
        }
    }
}

/// A constraint a requirement places on the versions of one coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    /// Exactly this version.
    Exact(Version),
    /// Any version inside the interval.
    Range(VersionRange),
    /// Any version whose parts start with the given prefix.
    Prefix(Version),
    /// Any version; with `release_only`, any non-changing version.
    Latest {
        /// Skip changing (snapshot) versions.
        release_only: bool,
    },
}

impl VersionConstraint {
    /// Parse a constraint from its textual form.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Constraint`] for malformed intervals or operator
    /// lists, and [`ParseError::Version`] for unparseable version text.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let s = input.trim();
        match s {
            "" | "+" | "*" | "latest" | "latest.integration" => {
                return Ok(Self::Latest {
                    release_only: false,
                });
            }
            "latest.release" => return Ok(Self::Latest { release_only: true }),
            _ => {}
        }

        if s.starts_with('[') || s.starts_with('(') {
            return parse_interval(s);
        }
        if let Some(prefix) = s.strip_suffix(".+") {
            return Ok(Self::Prefix(Version::parse(prefix)?));
        }
        if s.starts_with(['>', '<', '=']) {
            return parse_operators(s);
        }
        Ok(Self::Exact(Version::parse(s)?))
    }

    /// Whether `version` satisfies this constraint.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Exact(v) => v == version,
            Self::Range(r) => r.contains(version),
            Self::Prefix(p) => version.starts_with(p),
            Self::Latest { release_only } => !release_only || !version.is_changing(),
        }
    }

    /// Whether resolving this constraint needs the list of available versions.
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, Self::Exact(_))
    }

    /// The exact version this constraint names, if any.
    pub fn exact(&self) -> Option<&Version> {
        match self {
            Self::Exact(v) => Some(v),
            _ => None,
        }
    }

    /// All versions from `available` that satisfy the constraint, in the order
    /// given.
    pub fn filter(&self, available: &[Version]) -> Vec<Version> {
        available
            .iter()
            .filter(|v| self.matches(v))
            .cloned()
            .collect()
    }
}

fn constraint_error(input: &str, reason: impl Into<String>) -> ParseError {
    ParseError::Constraint {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn parse_interval(s: &str) -> Result<VersionConstraint, ParseError> {
    let open_inclusive = s.starts_with('[');
    let close_inclusive = if s.ends_with(']') {
        true
    } else if s.ends_with(')') {
        false
    } else {
        return Err(constraint_error(s, "interval must end with ']' or ')'"));
    };
    let inner = &s[1..s.len() - 1];

    let Some((lo, hi)) = inner.split_once(',') else {
        if open_inclusive && close_inclusive {
            return Ok(VersionConstraint::Exact(Version::parse(inner)?));
        }
        return Err(constraint_error(s, "single-version interval must be '[v]'"));
    };
    if hi.contains(',') {
        return Err(constraint_error(s, "interval has more than two bounds"));
    }

    let (lo, hi) = (lo.trim(), hi.trim());
    let lower = if lo.is_empty() {
        Bound::Unbounded
    } else if open_inclusive {
        Bound::Included(Version::parse(lo)?)
    } else {
        Bound::Excluded(Version::parse(lo)?)
    };
    let upper = if hi.is_empty() {
        Bound::Unbounded
    } else if close_inclusive {
        Bound::Included(Version::parse(hi)?)
    } else {
        Bound::Excluded(Version::parse(hi)?)
    };

    VersionRange::new(lower, upper)
        .map(VersionConstraint::Range)
        .map_err(|_| constraint_error(s, "range is empty"))
}

fn parse_operators(s: &str) -> Result<VersionConstraint, ParseError> {
    let terms: Vec<&str> = s
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    let mut lower = Bound::Unbounded;
    let mut upper = Bound::Unbounded;

    for term in &terms {
        if let Some(v) = term.strip_prefix(">=") {
            set_once(&mut lower, Bound::Included(Version::parse(v)?), s)?;
        } else if let Some(v) = term.strip_prefix('>') {
            set_once(&mut lower, Bound::Excluded(Version::parse(v)?), s)?;
        } else if let Some(v) = term.strip_prefix("<=") {
            set_once(&mut upper, Bound::Included(Version::parse(v)?), s)?;
        } else if let Some(v) = term.strip_prefix('<') {
            set_once(&mut upper, Bound::Excluded(Version::parse(v)?), s)?;
        } else if let Some(v) = term.strip_prefix('=') {
            if terms.len() != 1 {
                return Err(constraint_error(s, "'=' cannot be combined with other bounds"));
            }
            return Ok(VersionConstraint::Exact(Version::parse(v)?));
        } else {
            return Err(constraint_error(s, format!("unknown operator in '{term}'")));
        }
    }

    VersionRange::new(lower, upper)
        .map(VersionConstraint::Range)
        .map_err(|_| constraint_error(s, "range is empty"))
}

fn set_once(slot: &mut Bound<Version>, bound: Bound<Version>, s: &str) -> Result<(), ParseError> {
    if !matches!(slot, Bound::Unbounded) {
        return Err(constraint_error(s, "bound given twice"));
    }
    *slot = bound;
    Ok(())
}

impl FromStr for VersionConstraint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<VersionConstraint> for String {
    fn from(c: VersionConstraint) -> Self {
        c.to_string()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "{v}"),
            Self::Range(r) => write!(f, "{r}"),
            Self::Prefix(p) => write!(f, "{p}.+"),
            Self::Latest { release_only: true } => write!(f, "latest.release"),
            Self::Latest {
                release_only: false,
            } => write!(f, "+"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        VersionConstraint::parse(s).unwrap()
    }

    #[test]
    fn exact_forms() {
        assert_eq!(c("1.0"), VersionConstraint::Exact(v("1.0")));
        assert_eq!(c("=1.0"), VersionConstraint::Exact(v("1.0")));
        assert_eq!(c("[1.0]"), VersionConstraint::Exact(v("1.0")));
        assert!(!c("1.0").is_dynamic());
    }

    #[test]
    fn maven_intervals() {
        let r = c("[1.0,2.0)");
        assert!(r.matches(&v("1.0")));
        assert!(r.matches(&v("1.9.9")));
        assert!(!r.matches(&v("2.0")));

        let open = c("(1.0,]");
        assert!(!open.matches(&v("1.0")));
        assert!(open.matches(&v("99")));

        let upper = c("(,2.0]");
        assert!(upper.matches(&v("0.1")));
        assert!(upper.matches(&v("2.0")));
        assert!(!upper.matches(&v("2.0.1")));
    }

    #[test]
    fn operator_ranges() {
        let r = c(">=1.5");
        assert!(r.matches(&v("1.5")));
        assert!(r.matches(&v("2.0")));
        assert!(!r.matches(&v("1.0")));

        let both = c(">1.0, <2.0");
        assert!(both.matches(&v("1.5")));
        assert!(!both.matches(&v("1.0")));
        assert!(!both.matches(&v("2.0")));

        assert_eq!(c(">=1.0 <2.0"), c("[1.0,2.0)"));
    }

    #[test]
    fn prefix_and_latest() {
        let p = c("1.2.+");
        assert!(p.matches(&v("1.2.7")));
        assert!(!p.matches(&v("1.20")));
        assert!(!p.matches(&v("1.3.0")));

        assert!(c("+").matches(&v("1.0-SNAPSHOT")));
        assert!(!c("latest.release").matches(&v("1.0-SNAPSHOT")));
        assert!(c("latest.release").matches(&v("1.0")));
    }

    #[test]
    fn rejects_malformed() {
        assert!(VersionConstraint::parse("[2.0,1.0]").is_err());
        assert!(VersionConstraint::parse("[1.0,2.0").is_err());
        assert!(VersionConstraint::parse(">=1.0, >=2.0").is_err());
        assert!(VersionConstraint::parse("=1.0, <2.0").is_err());
        assert!(VersionConstraint::parse("(1.0,1.0)").is_err());
        assert!(VersionConstraint::parse("[1.0,2.0,3.0]").is_err());
    }

    #[test]
    fn filter_keeps_order() {
        let available = vec![v("1.0"), v("1.5"), v("2.0")];
        assert_eq!(c(">=1.5").filter(&available), vec![v("1.5"), v("2.0")]);
    }

    #[test]
    fn display_round_trips() {
        for text in ["1.0", "[1.0,2.0)", "(,2.0]", ">1.0", "1.2.+", "latest.release", "+"] {
            let parsed = c(text);
            assert_eq!(c(&parsed.to_string()), parsed);
        }
    }
}
