//! Dependency requirements and exclusion rules.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::coordinate::Coordinate;
use crate::constraint::VersionConstraint;
use crate::error::ParseError;

/// A `group[:name]` glob rule that removes matching coordinates from a subtree.
///
/// `org.slf4j` and `org.slf4j:*` exclude the whole group; `*:junit` excludes
/// every module named `junit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Exclusion {
    text: String,
    group: Pattern,
    name: Pattern,
}

impl Exclusion {
    /// Parse an exclusion rule.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Exclusion`] if the rule is empty, has more than
    /// one `:`, or contains an invalid glob.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let s = input.trim();
        let (group, name) = s.split_once(':').unwrap_or((s, "*"));
        if group.is_empty() || name.is_empty() || name.contains(':') {
            return Err(ParseError::Exclusion {
                input: input.to_string(),
                reason: "expected 'group[:name]'".to_string(),
            });
        }

        let compile = |p: &str| {
            Pattern::new(p).map_err(|e| ParseError::Exclusion {
                input: input.to_string(),
                reason: e.to_string(),
            })
        };

        Ok(Self {
            text: format!("{group}:{name}"),
            group: compile(group)?,
            name: compile(name)?,
        })
    }

    /// Whether this rule excludes `coordinate`.
    pub fn matches(&self, coordinate: &Coordinate) -> bool {
        self.group.matches(coordinate.group()) && self.name.matches(coordinate.name())
    }

    /// Normalized `group:name` text.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Exclusion {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Exclusion {}

impl Hash for Exclusion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl Ord for Exclusion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.text.cmp(&other.text)
    }
}

impl PartialOrd for Exclusion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Exclusion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Exclusion {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Exclusion> for String {
    fn from(e: Exclusion) -> Self {
        e.text
    }
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// An ordered, deduplicated set of exclusion rules.
///
/// Used as the exclusion *context* of a graph path: two paths with equal sets
/// expand a module identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionSet(BTreeSet<Exclusion>);

impl ExclusionSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any rule excludes `coordinate`.
    pub fn excludes(&self, coordinate: &Coordinate) -> bool {
        self.0.iter().any(|e| e.matches(coordinate))
    }

    /// This set plus every rule in `other`.
    pub fn union(&self, other: &ExclusionSet) -> ExclusionSet {
        if other.0.is_subset(&self.0) {
            return self.clone();
        }
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Add one rule.
    pub fn insert(&mut self, exclusion: Exclusion) -> bool {
        self.0.insert(exclusion)
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate rules in order.
    pub fn iter(&self) -> impl Iterator<Item = &Exclusion> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a ExclusionSet {
    type Item = &'a Exclusion;
    type IntoIter = std::collections::btree_set::Iter<'a, Exclusion>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Exclusion> for ExclusionSet {
    fn from_iter<T: IntoIterator<Item = Exclusion>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ExclusionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.0.iter().map(Exclusion::as_str).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

/// A consumer's request for one module: coordinate, version constraint and
/// modifiers.
///
/// Wire form (inside descriptors):
///
/// ```json
/// { "group": "org.example", "name": "lib", "version": "[1.0,2.0)",
///   "classifier": "linux", "exclude": ["org.slf4j:*"], "strict": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyRequirement {
    /// Module being requested.
    #[serde(flatten)]
    pub coordinate: Coordinate,
    /// Acceptable versions.
    #[serde(rename = "version")]
    pub constraint: VersionConstraint,
    /// Artifact classifier, if a non-default artifact is wanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    /// Coordinates removed from this requirement's subtree.
    #[serde(default, rename = "exclude", skip_serializing_if = "ExclusionSet::is_empty")]
    pub exclusions: ExclusionSet,
    /// The selected version must satisfy this constraint.
    #[serde(default, skip_serializing_if = "is_false")]
    pub strict: bool,
    /// Override ordinary resolution for this coordinate (root level only).
    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,
}

impl DependencyRequirement {
    /// An ordinary requirement.
    pub fn new(coordinate: Coordinate, constraint: VersionConstraint) -> Self {
        Self {
            coordinate,
            constraint,
            classifier: None,
            exclusions: ExclusionSet::new(),
            strict: false,
            force: false,
        }
    }

    /// Mark as strict.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Mark as forced.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Set the classifier.
    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// Add an exclusion rule.
    pub fn excluding(mut self, exclusion: Exclusion) -> Self {
        self.exclusions.insert(exclusion);
        self
    }
}

/// Parses `group:name[:constraint]`; a missing constraint means any version.
impl FromStr for DependencyRequirement {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let group = parts.next().unwrap_or_default();
        let name = parts.next().ok_or_else(|| ParseError::Coordinate {
            input: s.to_string(),
            reason: "expected 'group:name[:version]'",
        })?;
        let coordinate = Coordinate::new(group, name)?;
        let constraint = VersionConstraint::parse(parts.next().unwrap_or_default())?;
        Ok(Self::new(coordinate, constraint))
    }
}

impl fmt::Display for DependencyRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.coordinate, self.constraint)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{classifier}")?;
        }
        if self.strict {
            write!(f, " (strict)")?;
        }
        if self.force {
            write!(f, " (force)")?;
        }
        Ok(())
    }
}
