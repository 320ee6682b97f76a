//! Module descriptors, artifact references and version listings: the JSON
//! documents a repository serves.

use serde::{Deserialize, Serialize};

use crate::coordinate::{Coordinate, check_path_segment};
use crate::digest::Digest;
use crate::error::ParseError;
use crate::requirement::DependencyRequirement;
use crate::version::Version;

fn default_extension() -> String {
    "jar".to_string()
}

/// One downloadable file published for a module version.
///
/// `classifier` and `extension` end up in cache paths and URLs, so both are
/// held to the same `[A-Za-z0-9._-]` rule as coordinate segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ArtifactRefParts")]
pub struct ArtifactRef {
    /// Distinguishes secondary artifacts (`sources`, `linux-x86_64`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    /// File extension without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Expected content digest.
    pub digest: Digest,
    /// Size in bytes, when the repository publishes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Deserialize)]
struct ArtifactRefParts {
    #[serde(default)]
    classifier: Option<String>,
    #[serde(default = "default_extension")]
    extension: String,
    digest: Digest,
    #[serde(default)]
    size: Option<u64>,
}

impl TryFrom<ArtifactRefParts> for ArtifactRef {
    type Error = ParseError;

    fn try_from(parts: ArtifactRefParts) -> Result<Self, Self::Error> {
        let artifact = Self {
            classifier: parts.classifier,
            extension: parts.extension,
            digest: parts.digest,
            size: parts.size,
        };
        artifact.validate()?;
        Ok(artifact)
    }
}

impl ArtifactRef {
    /// Check that the classifier and extension are safe file name parts.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Artifact`] naming the offending field.
    pub fn validate(&self) -> Result<(), ParseError> {
        let fields = [
            ("classifier", self.classifier.as_deref()),
            ("extension", Some(self.extension.as_str())),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                check_path_segment(value).map_err(|reason| ParseError::Artifact {
                    field,
                    input: value.to_string(),
                    reason,
                })?;
            }
        }
        Ok(())
    }

    /// Repository file name: `{name}-{version}[-{classifier}].{extension}`.
    pub fn file_name(&self, coordinate: &Coordinate, version: &Version) -> String {
        match &self.classifier {
            Some(c) => format!("{}-{version}-{c}.{}", coordinate.name(), self.extension),
            None => format!("{}-{version}.{}", coordinate.name(), self.extension),
        }
    }
}

/// Published metadata for one module version.
///
/// ```json
/// {
///   "group": "org.example", "name": "app", "version": "1.0",
///   "dependencies": [{ "group": "org.example", "name": "lib", "version": ">=1.0" }],
///   "artifacts": [{ "extension": "jar", "digest": "sha256:…", "size": 1024 }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Module identity.
    #[serde(flatten)]
    pub coordinate: Coordinate,
    /// The version described.
    pub version: Version,
    /// Transitive requirements.
    #[serde(default)]
    pub dependencies: Vec<DependencyRequirement>,
    /// Files published for this version.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl ModuleDescriptor {
    /// Parse a descriptor from JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed or invalid documents.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// The artifact matching `classifier`, if published.
    pub fn artifact(&self, classifier: Option<&str>) -> Option<&ArtifactRef> {
        self.artifacts
            .iter()
            .find(|a| a.classifier.as_deref() == classifier)
    }
}

/// The `versions.json` document listing every published version of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionListing {
    /// Published versions, in any order.
    pub versions: Vec<Version>,
}

impl VersionListing {
    /// Versions in ascending order with duplicates removed.
    pub fn sorted(&self) -> Vec<Version> {
        let mut versions = self.versions.clone();
        versions.sort();
        versions.dedup();
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn parses_descriptor() {
        let json = format!(
            r#"{{
                "group": "org.example",
                "name": "app",
                "version": "1.0",
                "dependencies": [
                    {{ "group": "org.example", "name": "lib", "version": ">=1.0" }}
                ],
                "artifacts": [
                    {{ "digest": "{DIGEST}", "size": 11 }},
                    {{ "classifier": "sources", "extension": "zip", "digest": "{DIGEST}" }}
                ]
            }}"#
        );
        let d = ModuleDescriptor::from_json(json.as_bytes()).unwrap();
        assert_eq!(d.coordinate.to_string(), "org.example:app");
        assert_eq!(d.dependencies.len(), 1);
        assert_eq!(d.artifacts[0].extension, "jar");

        let main = d.artifact(None).unwrap();
        assert_eq!(main.file_name(&d.coordinate, &d.version), "app-1.0.jar");
        let sources = d.artifact(Some("sources")).unwrap();
        assert_eq!(
            sources.file_name(&d.coordinate, &d.version),
            "app-1.0-sources.zip"
        );
        assert!(d.artifact(Some("javadoc")).is_none());

        let again = ModuleDescriptor::from_json(&d.to_json().unwrap()).unwrap();
        assert_eq!(again, d);
    }

    #[test]
    fn rejects_bad_digest() {
        let json = r#"{"group":"g","name":"n","version":"1","artifacts":[{"digest":"nope"}]}"#;
        assert!(ModuleDescriptor::from_json(json.as_bytes()).is_err());
    }

    #[test]
    fn rejects_unsafe_artifact_names() {
        for artifact in [
            format!(r#"{{"extension":"jar/../../escaped","digest":"{DIGEST}"}}"#),
            format!(r#"{{"classifier":"..","digest":"{DIGEST}"}}"#),
            format!(r#"{{"classifier":"a\\b","digest":"{DIGEST}"}}"#),
            format!(r#"{{"extension":"","digest":"{DIGEST}"}}"#),
        ] {
            let json =
                format!(r#"{{"group":"g","name":"n","version":"1","artifacts":[{artifact}]}}"#);
            let err = ModuleDescriptor::from_json(json.as_bytes()).unwrap_err();
            assert!(err.to_string().contains("Invalid artifact"), "{artifact}: {err}");
        }

        let ok: ArtifactRef = serde_json::from_str(&format!(
            r#"{{"classifier":"linux-x86_64","extension":"tar.gz","digest":"{DIGEST}"}}"#
        ))
        .unwrap();
        assert!(ok.validate().is_ok());

        let mut built = ok.clone();
        built.extension = "../jar".to_string();
        assert!(matches!(
            built.validate(),
            Err(ParseError::Artifact { field: "extension", .. })
        ));
    }

    #[test]
    fn listing_sorts_and_dedups() {
        let listing: VersionListing =
            serde_json::from_str(r#"{"versions":["2.0","1.0","1.0.0","1.0","1.5"]}"#).unwrap();
        let sorted: Vec<String> = listing.sorted().iter().map(ToString::to_string).collect();
        assert_eq!(sorted, vec!["1.0", "1.0.0", "1.5", "2.0"]);
    }
}
