//! Shared fixtures for unit tests.

use keel_schema::{DependencyRequirement, ModuleDescriptor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::metadata::{MemoryMetadataStore, MetadataResolver};
use crate::policy::PolicyConfig;
use crate::transport::{MemoryRepository, MemoryTransport, RetryPolicy};

pub(crate) fn req(s: &str) -> DependencyRequirement {
    s.parse().unwrap()
}

pub(crate) struct Fixture {
    pub(crate) transport: Arc<MemoryTransport>,
    pub(crate) repo: MemoryRepository,
    pub(crate) store: Arc<MemoryMetadataStore>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let repo = MemoryRepository::new(transport.clone(), "mem://central");
        Self {
            transport,
            repo,
            store: Arc::new(MemoryMetadataStore::new()),
        }
    }

    pub(crate) fn publish(&self, coordinate: &str, version: &str, deps: &[&str]) -> ModuleDescriptor {
        self.publish_with(coordinate, version, deps.iter().map(|d| req(d)).collect())
    }

    pub(crate) fn publish_with(
        &self,
        coordinate: &str,
        version: &str,
        deps: Vec<DependencyRequirement>,
    ) -> ModuleDescriptor {
        self.repo.publish(coordinate, version, deps).unwrap()
    }

    pub(crate) fn policy(&self) -> PolicyConfig {
        PolicyConfig::default()
            .with_repository(self.repo.repository("central"))
            .with_retry(RetryPolicy::immediate(3))
    }

    pub(crate) fn metadata(&self, policy: &PolicyConfig) -> MetadataResolver {
        MetadataResolver::new(self.store.clone(), policy, CancellationToken::new())
    }
}
