//! Module coordinates (`group:name`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Identity of a module family, independent of version.
///
/// Ordering is lexical by `(group, name)`, which is also the order used for
/// every deterministic listing in the engine. Both segments are restricted to
/// `[A-Za-z0-9._-]` so they can be used verbatim as cache path components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "CoordinateParts")]
pub struct Coordinate {
    group: String,
    name: String,
}

#[derive(Deserialize)]
struct CoordinateParts {
    group: String,
    name: String,
}

impl TryFrom<CoordinateParts> for Coordinate {
    type Error = ParseError;

    fn try_from(parts: CoordinateParts) -> Result<Self, Self::Error> {
        Self::new(&parts.group, &parts.name)
    }
}

impl Coordinate {
    /// Create a coordinate, validating both segments.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Coordinate`] if either segment is empty, is `.`
    /// or `..`, or contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(group: &str, name: &str) -> Result<Self, ParseError> {
        let display = format!("{group}:{name}");
        validate_segment(group, &display)?;
        validate_segment(name, &display)?;
        Ok(Self {
            group: group.to_string(),
            name: name.to_string(),
        })
    }

    /// The group segment (e.g. `org.example`).
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The module name segment (e.g. `widgets`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group as a relative path (`org.example` -> `org/example`).
    pub fn group_path(&self) -> String {
        self.group.replace('.', "/")
    }
}

/// Check that `segment` can be used verbatim as one file or directory name.
///
/// # Errors
///
/// Returns the reason if the segment is empty, is `.` or `..`, or contains
/// characters outside `[A-Za-z0-9._-]`.
pub fn check_path_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        Err("empty segment")
    } else if segment == "." || segment == ".." {
        Err("segment may not be '.' or '..'")
    } else if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        Err("segments may only contain [A-Za-z0-9._-]")
    } else {
        Ok(())
    }
}

fn validate_segment(segment: &str, input: &str) -> Result<(), ParseError> {
    check_path_segment(segment).map_err(|reason| ParseError::Coordinate {
        input: input.to_string(),
        reason,
    })
}

impl FromStr for Coordinate {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, name) = s.split_once(':').ok_or_else(|| ParseError::Coordinate {
            input: s.to_string(),
            reason: "expected 'group:name'",
        })?;
        Self::new(group.trim(), name.trim())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)
    }
}
