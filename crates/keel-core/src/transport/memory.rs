use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use keel_schema::{
    ArtifactRef, Coordinate, DependencyRequirement, Digest, ModuleDescriptor, ParseError,
    Version, VersionListing,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{ByteStream, Transport, TransportError};
use crate::credentials::Credentials;
use crate::repository::Repository;

#[derive(Debug, Default)]
struct State {
    files: HashMap<String, Bytes>,
    requests: HashMap<String, usize>,
    faults: HashMap<String, VecDeque<TransportError>>,
    chunk_delay: Option<Duration>,
}

/// In-process transport serving registered byte blobs.
///
/// Counts every request per URL, can fail the next N requests for a URL with
/// a chosen error, and can delay each body chunk to simulate a slow link.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Mutex<State>,
    chunk_size: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Empty transport; bodies are streamed in 8 KiB chunks.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            chunk_size: 8 * 1024,
        }
    }

    /// Use a different body chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve `body` at `url`.
    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.state().files.insert(url.into(), body.into());
    }

    /// Stop serving `url`.
    pub fn remove(&self, url: &str) {
        self.state().files.remove(url);
    }

    /// Fail the next request for `url` with `error`. Queued faults are
    /// consumed in order.
    pub fn fail_next(&self, url: impl Into<String>, error: TransportError) {
        self.state()
            .faults
            .entry(url.into())
            .or_default()
            .push_back(error);
    }

    /// Sleep this long before yielding each body chunk.
    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        self.state().chunk_delay = delay;
    }

    /// Number of requests made for `url`, including failed ones.
    pub fn request_count(&self, url: &str) -> usize {
        self.state().requests.get(url).copied().unwrap_or(0)
    }

    /// Number of requests made for any URL.
    pub fn total_requests(&self) -> usize {
        self.state().requests.values().sum()
    }

    /// Forget all request counts.
    pub fn reset_counts(&self) {
        self.state().requests.clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get(
        &self,
        url: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<ByteStream, TransportError> {
        let (body, delay) = {
            let mut state = self.state();
            *state.requests.entry(url.to_string()).or_default() += 1;

            if let Some(fault) = state.faults.get_mut(url).and_then(VecDeque::pop_front) {
                return Err(fault);
            }

            let body = state
                .files
                .get(url)
                .cloned()
                .ok_or_else(|| TransportError::NotFound {
                    url: url.to_string(),
                })?;
            (body, state.chunk_delay)
        };

        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(self.chunk_size)
            .map(|start| body.slice(start..(start + self.chunk_size).min(body.len())))
            .collect();

        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk)
            })
            .boxed())
    }
}

/// Publishes modules into a [`MemoryTransport`] using the repository URL
/// layout, keeping `versions.json` listings up to date.
#[derive(Debug)]
pub struct MemoryRepository {
    transport: Arc<MemoryTransport>,
    layout: Repository,
    versions: Mutex<BTreeMap<Coordinate, BTreeSet<Version>>>,
}

impl MemoryRepository {
    /// Repository served at `base_url` from `transport`.
    pub fn new(transport: Arc<MemoryTransport>, base_url: &str) -> Self {
        let layout = Repository::new("memory", base_url, transport.clone());
        Self {
            transport,
            layout,
            versions: Mutex::new(BTreeMap::new()),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    /// A [`Repository`] handle named `name` for this content.
    pub fn repository(&self, name: &str) -> Arc<Repository> {
        Arc::new(Repository::new(
            name,
            self.layout.base_url(),
            self.transport.clone(),
        ))
    }

    /// Publish a module with one default artifact whose content is
    /// `"{coordinate}:{version}"`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for an invalid coordinate or version.
    pub fn publish(
        &self,
        coordinate: &str,
        version: &str,
        dependencies: Vec<DependencyRequirement>,
    ) -> Result<ModuleDescriptor, ParseError> {
        let coordinate: Coordinate = coordinate.parse()?;
        let version = Version::parse(version)?;
        let content = Bytes::from(format!("{coordinate}:{version}"));
        let artifact = ArtifactRef {
            classifier: None,
            extension: "jar".to_string(),
            digest: Digest::sha256(&content),
            size: Some(content.len() as u64),
        };
        let descriptor = ModuleDescriptor {
            coordinate,
            version,
            dependencies,
            artifacts: vec![artifact.clone()],
        };
        self.publish_descriptor(&descriptor, &[(artifact, content)]);
        Ok(descriptor)
    }

    /// Publish `descriptor` and the given artifact bodies as-is.
    ///
    /// Artifact digests are not checked, so corrupt content can be served on
    /// purpose.
    pub fn publish_descriptor(
        &self,
        descriptor: &ModuleDescriptor,
        artifacts: &[(ArtifactRef, Bytes)],
    ) {
        let coordinate = &descriptor.coordinate;
        let version = &descriptor.version;
        let body = descriptor.to_json().unwrap_or_default();
        self.transport
            .insert(self.layout.descriptor_url(coordinate, version), body);
        for (artifact, content) in artifacts {
            self.transport.insert(
                self.layout.artifact_url(coordinate, version, artifact),
                content.clone(),
            );
        }

        let mut versions = self
            .versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let known = versions.entry(coordinate.clone()).or_default();
        known.insert(version.clone());
        let listing = VersionListing {
            versions: known.iter().cloned().collect(),
        };
        self.transport.insert(
            self.layout.versions_url(coordinate),
            serde_json::to_vec(&listing).unwrap_or_default(),
        );
    }

    /// Publish a `descriptor.json.sha256` sidecar with the given content.
    pub fn publish_descriptor_checksum(
        &self,
        coordinate: &Coordinate,
        version: &Version,
        text: &str,
    ) {
        self.transport.insert(
            self.layout.descriptor_checksum_url(coordinate, version),
            text.to_string(),
        );
    }

    /// URL of the default artifact of `descriptor`.
    pub fn artifact_url(&self, descriptor: &ModuleDescriptor) -> Option<String> {
        descriptor
            .artifact(None)
            .map(|a| self.layout.artifact_url(&descriptor.coordinate, &descriptor.version, a))
    }

    /// URL of the version listing of `coordinate`.
    pub fn versions_url(&self, coordinate: &Coordinate) -> String {
        self.layout.versions_url(coordinate)
    }

    /// URL of a descriptor.
    pub fn descriptor_url(&self, coordinate: &Coordinate, version: &Version) -> String {
        self.layout.descriptor_url(coordinate, version)
    }
}
