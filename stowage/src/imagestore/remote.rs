use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::transfer::{ImageSource, push_image};
use super::{ClientPool, Parameters, Store, StoreError, StoreKind};
use crate::manifest::{Descriptor, split_digest};
use crate::reference::ImageReference;
use crate::registry::{FetchedManifest, RegistryClient};

/// Store backed by the registries the images already live in. Nothing is
/// written locally; `add` only resolves and verifies.
pub struct RegistryStore {
    clients: ClientPool,
}

impl RegistryStore {
    pub fn create(params: Parameters) -> Result<Self, StoreError> {
        let clients = params.client_pool().ok_or_else(|| {
            StoreError::Configuration("a registry store needs a transport".to_string())
        })?;
        Ok(Self { clients })
    }
}

pub(crate) fn parse_reference(image: &str) -> Result<ImageReference, StoreError> {
    ImageReference::parse(image).map_err(|e| StoreError::InvalidReference(format!("{image}: {e}")))
}

#[async_trait]
impl Store for RegistryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Registry
    }

    async fn add(&self, image: &str) -> Result<String, StoreError> {
        let reference = parse_reference(image)?;
        let client = self.clients.client(&reference.registry);
        let fetched = client
            .fetch_manifest(&reference.repository, reference.manifest_reference())
            .await?;

        tracing::info!(image, digest = %fetched.digest, "resolved image");
        Ok(fetched.digest)
    }

    async fn push(&self, digest: &str, src: &str, dst: &str) -> Result<String, StoreError> {
        let src = parse_reference(src)?;
        let dst = parse_reference(dst)?;

        let source = RemoteSource {
            client: self.clients.client(&src.registry),
            repository: src.repository,
        };
        let target = self.clients.client(&dst.registry);
        push_image(&source, &target, &dst, digest).await
    }
}

struct RemoteSource {
    client: RegistryClient,
    repository: String,
}

#[async_trait]
impl ImageSource for RemoteSource {
    async fn manifest(&self, digest: &str) -> Result<FetchedManifest, StoreError> {
        Ok(self.client.fetch_manifest(&self.repository, digest).await?)
    }

    async fn blob(&self, descriptor: &Descriptor, scratch: &Path) -> Result<PathBuf, StoreError> {
        let (_, hex) = split_digest(&descriptor.digest).map_err(StoreError::Integrity)?;
        let path = scratch.join(hex);
        self.client
            .fetch_blob(&self.repository, descriptor, &path)
            .await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_a_transport() {
        let err = RegistryStore::create(Parameters::default()).err().unwrap();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_references_before_any_request() {
        let params = Parameters::builder()
            .transport(crate::registry::Transport::new(&[], false).unwrap())
            .build();
        let store = RegistryStore::create(params).unwrap();
        assert_eq!(store.kind(), StoreKind::Registry);
        assert!(matches!(
            store.add("Not A Reference").await,
            Err(StoreError::InvalidReference(_))
        ));
    }
}
