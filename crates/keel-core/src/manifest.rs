//! Manifest and lockfile parsing for keel projects.
//!
//! A keel manifest (`keel.toml`) declares a project's dependencies, the
//! repositories to resolve them from and the resolution policy. The companion
//! lockfile (`keel.lock`) records the exact resolved versions and artifact
//! digests so that resolutions are reproducible.
//!
//! ```toml
//! [project]
//! name = "demo"
//!
//! [dependencies]
//! "org.example:lib" = "[1.0,2.0)"
//! "org.example:native" = { version = "1.2.+", classifier = "linux", exclude = ["org.slf4j:*"] }
//!
//! [[repositories]]
//! name = "central"
//! url = "https://repo.example.com/modules"
//! username-env = "CENTRAL_USER"
//! password-env = "CENTRAL_TOKEN"
//!
//! [policy]
//! strategy = "highest"
//! changing-ttl-secs = 3600
//!
//! [policy.force]
//! "org.example:lib" = "1.4"
//! ```

use anyhow::{Context, Result, bail};
use keel_schema::{
    Coordinate, DependencyRequirement, Digest, Exclusion, ExclusionSet, Version, VersionConstraint,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use crate::credentials::Credentials;
use crate::policy::{ConflictStrategy, PolicyConfig, TransitiveForce};
use crate::repository::Repository;
use crate::result::ResolutionResult;
use crate::transport::{RetryPolicy, Transport};

/// Default manifest file name.
pub const MANIFEST_FILE: &str = "keel.toml";

/// Default lockfile file name.
pub const LOCK_FILE: &str = "keel.lock";

/// Top-level project manifest parsed from a `keel.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Project identity metadata.
    #[serde(default)]
    pub project: ProjectObj,
    /// Map of `group:name` to a version constraint or a detailed table.
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencySpec>,
    /// Repositories in precedence order.
    #[serde(default)]
    pub repositories: Vec<RepositorySpec>,
    /// Resolution policy.
    #[serde(default)]
    pub policy: PolicySpec,
}

/// The `[project]` section of a keel manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectObj {
    /// Human-readable name of the project.
    #[serde(default)]
    pub name: String,
}

/// One `[dependencies]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// Just a version constraint.
    Simple(String),
    /// Constraint plus modifiers.
    Detailed(DetailedDependency),
}

/// The table form of a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DetailedDependency {
    /// Version constraint.
    pub version: String,
    /// Artifact classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    /// Exclusion patterns for this dependency's subtree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// The selected version must satisfy `version`.
    #[serde(default)]
    pub strict: bool,
    /// Force this version over ordinary resolution.
    #[serde(default)]
    pub force: bool,
}

/// One `[[repositories]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepositorySpec {
    /// Name used in logs and lockfiles.
    pub name: String,
    /// Base URL.
    pub url: String,
    /// Environment variable holding the username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// Environment variable holding the password or token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

/// The `[policy]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PolicySpec {
    /// Conflict strategy.
    #[serde(default)]
    pub strategy: ConflictStrategy,
    /// Forced versions by `group:name`.
    #[serde(default)]
    pub force: BTreeMap<String, String>,
    /// Strict pins by `group:name`.
    #[serde(default)]
    pub pin: BTreeMap<String, String>,
    /// Global exclusion patterns.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Changing-version TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changing_ttl_secs: Option<u64>,
    /// Concurrent downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_downloads: Option<usize>,
    /// Whether a force beats a strict requirement it violates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_overrides_strict: Option<bool>,
    /// Handling of `force` on transitive requirements.
    #[serde(default)]
    pub transitive_force: TransitiveForce,
    /// Total attempts per request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
}

impl DependencySpec {
    /// Turn the entry for `key` into a requirement.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinate, constraint or an exclusion pattern
    /// does not parse.
    pub fn to_requirement(&self, key: &str) -> Result<DependencyRequirement> {
        let coordinate: Coordinate = key
            .parse()
            .with_context(|| format!("Invalid dependency coordinate '{key}'"))?;
        let version = match self {
            Self::Simple(version) => version,
            Self::Detailed(detailed) => &detailed.version,
        };
        let constraint = VersionConstraint::parse(version)
            .with_context(|| format!("Invalid version constraint for {key}"))?;
        let mut requirement = DependencyRequirement::new(coordinate, constraint);

        if let Self::Detailed(detailed) = self {
            requirement.classifier.clone_from(&detailed.classifier);
            requirement.exclusions = parse_exclusions(&detailed.exclude)
                .with_context(|| format!("Invalid exclusion for {key}"))?;
            requirement.strict = detailed.strict;
            requirement.force = detailed.force;
        }
        Ok(requirement)
    }
}

fn parse_exclusions(patterns: &[String]) -> Result<ExclusionSet> {
    patterns
        .iter()
        .map(|p| Exclusion::parse(p).with_context(|| format!("Invalid exclusion '{p}'")))
        .collect()
}

fn parse_version_map(map: &BTreeMap<String, String>, what: &str) -> Result<BTreeMap<Coordinate, Version>> {
    map.iter()
        .map(|(key, version)| {
            let coordinate: Coordinate = key
                .parse()
                .with_context(|| format!("Invalid {what} coordinate '{key}'"))?;
            let version = Version::parse(version)
                .with_context(|| format!("Invalid {what} version for {key}"))?;
            Ok((coordinate, version))
        })
        .collect()
}

impl Manifest {
    /// Asynchronously load and parse a `Manifest` from the given file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or if its contents are not
    /// valid TOML conforming to the manifest schema.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse manifest text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid manifest.
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(content)?;
        Ok(manifest)
    }

    /// Root requirements in coordinate order.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first dependency that does not parse.
    pub fn requirements(&self) -> Result<Vec<DependencyRequirement>> {
        self.dependencies
            .iter()
            .map(|(key, spec)| spec.to_requirement(key))
            .collect()
    }

    /// Build the policy, with repositories talking through `transport` and
    /// credentials read from the process environment.
    ///
    /// # Errors
    ///
    /// See [`Manifest::policy_with`].
    pub fn policy(&self, transport: &Arc<dyn Transport>) -> Result<PolicyConfig> {
        self.policy_with(transport, |name| std::env::var(name).ok())
    }

    /// Build the policy, resolving credential variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error on unparsable policy entries, a repository without a
    /// name or with a duplicate one, or unresolvable credentials.
    pub fn policy_with(
        &self,
        transport: &Arc<dyn Transport>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<PolicyConfig> {
        let spec = &self.policy;
        let mut policy = PolicyConfig::default().with_strategy(spec.strategy);
        policy.forced = parse_version_map(&spec.force, "force")?;
        policy.strict_pins = parse_version_map(&spec.pin, "pin")?;
        policy.exclusions = parse_exclusions(&spec.exclude).context("Invalid policy exclusion")?;
        policy.transitive_force = spec.transitive_force;
        if let Some(ttl) = spec.changing_ttl_secs {
            policy.changing_ttl = Duration::from_secs(ttl);
        }
        if let Some(parallel) = spec.max_parallel_downloads {
            policy.max_parallel_downloads = parallel.max(1);
        }
        if let Some(force_overrides_strict) = spec.force_overrides_strict {
            policy.force_overrides_strict = force_overrides_strict;
        }
        if let Some(attempts) = spec.retry_attempts {
            policy.retry = RetryPolicy {
                max_attempts: attempts,
                ..RetryPolicy::default()
            };
        }

        for repo in &self.repositories {
            if repo.name.is_empty() {
                bail!("Repository with url '{}' has no name", repo.url);
            }
            if policy.repositories.iter().any(|r| r.name() == repo.name) {
                bail!("Duplicate repository '{}'", repo.name);
            }
            let credentials = Credentials::resolve_with(
                &repo.name,
                repo.username_env.as_deref(),
                repo.password_env.as_deref(),
                &lookup,
            )
            .with_context(|| format!("Failed to resolve credentials for '{}'", repo.name))?;
            let repository =
                Repository::new(&repo.name, &repo.url, transport.clone()).with_credentials(credentials);
            policy = policy.with_repository(Arc::new(repository));
        }

        Ok(policy)
    }
}

/// A resolved lockfile containing exact module versions and artifact digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    /// Locked modules in coordinate order.
    #[serde(default, rename = "module")]
    pub modules: Vec<LockedModule>,
}

/// A single entry in the lockfile representing one resolved module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedModule {
    /// Module group.
    pub group: String,
    /// Module name.
    pub name: String,
    /// The exact resolved version.
    pub version: Version,
    /// Repository that served it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Verified artifacts.
    #[serde(default, rename = "artifact", skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<LockedArtifact>,
}

/// One locked artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedArtifact {
    /// Classifier, absent for the default artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    /// File extension.
    pub extension: String,
    /// Verified digest.
    pub digest: Digest,
}

impl LockedModule {
    /// The module's coordinate.
    ///
    /// # Errors
    ///
    /// Returns an error if the group or name is invalid.
    pub fn coordinate(&self) -> Result<Coordinate> {
        Coordinate::new(&self.group, &self.name)
            .with_context(|| format!("Invalid locked module {}:{}", self.group, self.name))
    }
}

impl Lockfile {
    /// Asynchronously load and parse a `Lockfile` from the given file path.
    ///
    /// If the file does not exist, an empty `Lockfile` is returned so that
    /// callers can treat the first resolution the same as subsequent ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Lockfile::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let lock: Lockfile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(lock)
    }

    /// Atomically persist this `Lockfile` to disk at the given path.
    ///
    /// The file is first written to a temporary location and then renamed so
    /// that readers never observe a partially written lockfile.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, file writing, or the atomic rename
    /// fails.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize lockfile")?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("lock.tmp");
        fs::write(&temp_path, &content)
            .await
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        Ok(())
    }

    /// Lock everything in `result`.
    pub fn from_result(result: &ResolutionResult) -> Self {
        let modules = result
            .iter()
            .map(|component| LockedModule {
                group: component.coordinate.group().to_string(),
                name: component.coordinate.name().to_string(),
                version: component.version.clone(),
                repository: component.repository.clone(),
                artifacts: component
                    .artifacts
                    .iter()
                    .map(|a| LockedArtifact {
                        classifier: a.classifier.clone(),
                        extension: a.extension.clone(),
                        digest: a.digest.clone(),
                    })
                    .collect(),
            })
            .collect();
        Self { modules }
    }

    /// Whether nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Locked versions as strict pins.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid entry or a module locked twice.
    pub fn pins(&self) -> Result<BTreeMap<Coordinate, Version>> {
        let mut pins = BTreeMap::new();
        for module in &self.modules {
            let coordinate = module.coordinate()?;
            if pins.insert(coordinate.clone(), module.version.clone()).is_some() {
                bail!("{coordinate} is locked more than once");
            }
        }
        Ok(pins)
    }

    /// Differences between the lock and `result`: modules whose version or
    /// artifact digests changed, appeared or disappeared.
    pub fn drift(&self, result: &ResolutionResult) -> Vec<String> {
        let current = Self::from_result(result);
        let index = |lock: &Lockfile| -> BTreeMap<(String, String), LockedModule> {
            lock.modules
                .iter()
                .map(|m| ((m.group.clone(), m.name.clone()), m.clone()))
                .collect()
        };
        let locked = index(self);
        let resolved = index(&current);

        let mut drift = Vec::new();
        for ((group, name), module) in &locked {
            match resolved.get(&(group.clone(), name.clone())) {
                None => drift.push(format!("{group}:{name} is locked but no longer resolved")),
                Some(now) if now.version != module.version => drift.push(format!(
                    "{group}:{name} resolved to {} but is locked at {}",
                    now.version, module.version
                )),
                Some(now) => {
                    for artifact in &now.artifacts {
                        let recorded = module.artifacts.iter().find(|a| {
                            a.classifier == artifact.classifier && a.extension == artifact.extension
                        });
                        if let Some(recorded) = recorded.filter(|r| r.digest != artifact.digest) {
                            drift.push(format!(
                                "{group}:{name}:{} artifact digest changed from {} to {}",
                                module.version, recorded.digest, artifact.digest
                            ));
                        }
                    }
                }
            }
        }
        for (group, name) in resolved.keys() {
            if !locked.contains_key(&(group.clone(), name.clone())) {
                drift.push(format!("{group}:{name} is resolved but not locked"));
            }
        }
        drift
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    const MANIFEST: &str = r#"
[project]
name = "demo"

[dependencies]
"org.example:lib" = "[1.0,2.0)"
"org.example:native" = { version = "1.2.+", classifier = "linux", exclude = ["org.slf4j:*"], strict = true }

[[repositories]]
name = "central"
url = "https://repo.example.com/modules"

[[repositories]]
name = "private"
url = "https://private.example.com"
username-env = "PRIVATE_USER"
password-env = "PRIVATE_TOKEN"

[policy]
strategy = "fail"
exclude = ["commons-logging:*"]
changing-ttl-secs = 60
max-parallel-downloads = 4
force-overrides-strict = false
transitive-force = "as-strict"
retry-attempts = 5

[policy.force]
"org.example:lib" = "1.4"

[policy.pin]
"org.example:util" = "2.0"
"#;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(MemoryTransport::new())
    }

    fn env(name: &str) -> Option<String> {
        match name {
            "PRIVATE_USER" => Some("ci".into()),
            "PRIVATE_TOKEN" => Some("secret".into()),
            _ => None,
        }
    }

    #[test]
    fn parses_dependencies() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.project.name, "demo");

        let requirements = manifest.requirements().unwrap();
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].coordinate.to_string(), "org.example:lib");
        assert!(requirements[0].constraint.is_dynamic());

        let native = &requirements[1];
        assert_eq!(native.classifier.as_deref(), Some("linux"));
        assert!(native.strict);
        assert!(!native.force);
        assert_eq!(native.exclusions.len(), 1);
    }

    #[test]
    fn builds_policy() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let policy = manifest.policy_with(&transport(), env).unwrap();

        assert_eq!(policy.strategy, ConflictStrategy::Fail);
        assert_eq!(policy.changing_ttl, Duration::from_secs(60));
        assert_eq!(policy.max_parallel_downloads, 4);
        assert!(!policy.force_overrides_strict);
        assert_eq!(policy.transitive_force, TransitiveForce::AsStrict);
        assert_eq!(policy.retry.max_attempts, 5);
        assert_eq!(policy.forced.len(), 1);
        assert_eq!(policy.strict_pins.len(), 1);
        assert_eq!(policy.exclusions.len(), 1);

        let names: Vec<_> = policy.repositories.iter().map(|r| r.name()).collect();
        assert_eq!(names, ["central", "private"]);
    }

    #[test]
    fn missing_credentials_fail() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let err = manifest.policy_with(&transport(), |_| None).unwrap_err();
        assert!(format!("{err:#}").contains("PRIVATE_USER"), "{err:#}");
    }

    #[test]
    fn rejects_bad_entries() {
        let bad_constraint = Manifest::parse("[dependencies]\n\"g:a\" = \"[2.0,1.0]\"\n").unwrap();
        assert!(bad_constraint.requirements().is_err());

        let bad_coordinate = Manifest::parse("[dependencies]\n\"no-colon\" = \"1.0\"\n").unwrap();
        assert!(bad_coordinate.requirements().is_err());

        assert!(Manifest::parse("[policy]\nunknown-knob = 1\n").is_err());

        let duplicate = Manifest::parse(
            "[[repositories]]\nname = \"a\"\nurl = \"mem://x\"\n[[repositories]]\nname = \"a\"\nurl = \"mem://y\"\n",
        )
        .unwrap();
        assert!(duplicate.policy_with(&transport(), env).is_err());
    }

    #[test]
    fn empty_manifest_is_valid() {
        let manifest = Manifest::parse("").unwrap();
        assert!(manifest.requirements().unwrap().is_empty());
        let policy = manifest.policy_with(&transport(), env).unwrap();
        assert!(policy.repositories.is_empty());
        assert!(policy.force_overrides_strict);
    }

    fn lockfile() -> Lockfile {
        Lockfile {
            modules: vec![LockedModule {
                group: "org.example".into(),
                name: "lib".into(),
                version: "1.4".parse().unwrap(),
                repository: Some("central".into()),
                artifacts: vec![LockedArtifact {
                    classifier: None,
                    extension: "jar".into(),
                    digest: Digest::sha256(b"lib"),
                }],
            }],
        }
    }

    #[tokio::test]
    async fn lockfile_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);

        assert!(Lockfile::load(&path).await.unwrap().is_empty());

        let lock = lockfile();
        lock.save(&path).await.unwrap();
        assert!(!path.with_extension("lock.tmp").exists());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[[module]]"), "{text}");
        assert!(text.contains("sha256:"), "{text}");

        assert_eq!(Lockfile::load(&path).await.unwrap(), lock);
    }

    #[test]
    fn lock_entries_become_pins() {
        let pins = lockfile().pins().unwrap();
        let coordinate: Coordinate = "org.example:lib".parse().unwrap();
        assert_eq!(pins.get(&coordinate).map(Version::as_str), Some("1.4"));

        let mut twice = lockfile();
        twice.modules.push(twice.modules[0].clone());
        assert!(twice.pins().is_err());
    }

    #[test]
    fn drift_against_empty_result() {
        let drift = lockfile().drift(&ResolutionResult::default());
        assert_eq!(drift, ["org.example:lib is locked but no longer resolved"]);
        assert!(Lockfile::default().drift(&ResolutionResult::default()).is_empty());
    }
}
