//! A remote (or in-memory) module repository and its URL layout.
//!
//! ```text
//! {base}/{group as path}/{name}/versions.json
//! {base}/{group as path}/{name}/{version}/descriptor.json
//! {base}/{group as path}/{name}/{version}/descriptor.json.sha256
//! {base}/{group as path}/{name}/{version}/{name}-{version}[-{classifier}].{ext}
//! ```

use bytes::Bytes;
use keel_schema::{ArtifactRef, Coordinate, Version};
use std::sync::Arc;

use crate::credentials::Credentials;
use crate::transport::{ByteStream, Transport, TransportError, collect_body};

/// One configured repository.
#[derive(Debug, Clone)]
pub struct Repository {
    name: String,
    base_url: String,
    credentials: Option<Credentials>,
    transport: Arc<dyn Transport>,
}

impl Repository {
    /// A repository at `base_url` reached through `transport`.
    pub fn new(name: impl Into<String>, base_url: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
            transport,
        }
    }

    /// Attach basic-auth credentials.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Configured name, used in logs and metadata envelopes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn module_url(&self, coordinate: &Coordinate) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            coordinate.group_path(),
            coordinate.name()
        )
    }

    /// URL of the version listing.
    pub fn versions_url(&self, coordinate: &Coordinate) -> String {
        format!("{}/versions.json", self.module_url(coordinate))
    }

    /// URL of a version's descriptor.
    pub fn descriptor_url(&self, coordinate: &Coordinate, version: &Version) -> String {
        format!("{}/{version}/descriptor.json", self.module_url(coordinate))
    }

    /// URL of the optional SHA-256 sidecar of a descriptor.
    pub fn descriptor_checksum_url(&self, coordinate: &Coordinate, version: &Version) -> String {
        format!("{}.sha256", self.descriptor_url(coordinate, version))
    }

    /// URL of an artifact file.
    pub fn artifact_url(
        &self,
        coordinate: &Coordinate,
        version: &Version,
        artifact: &ArtifactRef,
    ) -> String {
        format!(
            "{}/{version}/{}",
            self.module_url(coordinate),
            artifact.file_name(coordinate, version)
        )
    }

    /// Stream `url` with this repository's credentials.
    ///
    /// # Errors
    ///
    /// Propagates the transport error.
    pub async fn fetch(&self, url: &str) -> Result<ByteStream, TransportError> {
        self.transport.get(url, self.credentials.as_ref()).await
    }

    /// Fetch `url` fully into memory.
    ///
    /// # Errors
    ///
    /// Propagates the transport error.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Bytes, TransportError> {
        collect_body(self.fetch(url).await?).await
    }
}
