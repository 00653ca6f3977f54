//! Image stores: where the images of a bundle live while an archive is built
//! or rehydrated.
//!
//! A [`Store`] is either backed by remote registries ([`remote::RegistryStore`])
//! or by an OCI image layout on disk ([`ocilayout::OciLayoutStore`]). Which
//! one is used is decided once, by a [`construction::Constructor`].

pub mod construction;
pub mod ocilayout;
pub mod remote;
mod transfer;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::progress::{NoopProgress, ProgressTracker};
use crate::registry::{RegistryClient, RegistryError, Transport, TransportError};

pub use construction::{
    ConstructionMode, Constructor, CreatingConstructor, LocatingConstructor, TransportBinding,
    is_thin, new_constructor,
};
pub use ocilayout::OciLayoutStore;
pub use remote::RegistryStore;

/// Blob transfers running at once inside one image.
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(#[source] RegistryError),

    #[error("authentication failed: {0}")]
    Auth(#[source] RegistryError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("corrupt image layout: {0}")]
    CorruptLayout(String),

    #[error("content verification failed: {0}")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RegistryError> for StoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ManifestNotFound(what) => StoreError::NotFound(what),
            RegistryError::BlobNotFound(digest) => StoreError::NotFound(format!("blob {digest}")),
            RegistryError::Unauthorized { .. }
            | RegistryError::TokenFetchFailed { .. }
            | RegistryError::TokenNotFound => StoreError::Auth(err),
            RegistryError::DigestMismatch { .. } | RegistryError::InvalidDigest(_) => {
                StoreError::Integrity(err.to_string())
            }
            RegistryError::IoError(io) => StoreError::Io(io),
            other => StoreError::Network(other),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Io(std::io::Error::other(err))
    }
}

/// Runs filesystem work off the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

impl From<TransportError> for StoreError {
    fn from(err: TransportError) -> Self {
        StoreError::Configuration(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Registry,
    OciLayout,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Registry => f.write_str("registry"),
            StoreKind::OciLayout => f.write_str("oci-layout"),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Makes `image` available through this store and returns the digest of
    /// its manifest. Adding an image twice is a no-op.
    async fn add(&self, image: &str) -> Result<String, StoreError>;

    /// Pushes the image with manifest `digest`, known as `src`, to `dst`.
    /// Returns `dst` pinned to the digest.
    async fn push(&self, digest: &str, src: &str, dst: &str) -> Result<String, StoreError>;
}

/// Settings handed to a constructor. Build with [`Parameters::builder`];
/// setting a field twice keeps the last value.
#[derive(Clone, Default)]
pub struct Parameters {
    pub archive_dir: Option<PathBuf>,
    pub transport: Option<Transport>,
    pub progress: Option<Arc<dyn ProgressTracker>>,
    pub concurrency: Option<usize>,
}

impl Parameters {
    pub fn builder() -> ParametersBuilder {
        ParametersBuilder::default()
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1)
    }

    fn progress(&self) -> Arc<dyn ProgressTracker> {
        self.progress
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgress))
    }

    pub(crate) fn client_pool(&self) -> Option<ClientPool> {
        self.transport
            .as_ref()
            .map(|t| ClientPool::new(t.clone(), self.progress()))
    }
}

impl fmt::Debug for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameters")
            .field("archive_dir", &self.archive_dir)
            .field("transport", &self.transport)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ParametersBuilder {
    params: Parameters,
}

impl ParametersBuilder {
    pub fn archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.params.archive_dir = Some(dir.into());
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.params.transport = Some(transport);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.params.progress = Some(progress);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.params.concurrency = Some(concurrency);
        self
    }

    pub fn build(self) -> Parameters {
        self.params
    }
}

/// One registry client per host, so bearer tokens are negotiated once per
/// operation.
#[derive(Clone)]
pub(crate) struct ClientPool {
    transport: Transport,
    progress: Arc<dyn ProgressTracker>,
    clients: Arc<Mutex<HashMap<String, RegistryClient>>>,
}

impl ClientPool {
    fn new(transport: Transport, progress: Arc<dyn ProgressTracker>) -> Self {
        Self {
            transport,
            progress,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn client(&self, registry: &str) -> RegistryClient {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(registry.to_string())
            .or_insert_with(|| {
                RegistryClient::new(&self.transport, registry).with_progress(self.progress.clone())
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_settings_win() {
        let first = Transport::new(&[], false).unwrap();
        let second = Transport::new(&[], false).unwrap();

        let params = Parameters::builder()
            .archive_dir("/tmp/one")
            .transport(first)
            .archive_dir("/tmp/two")
            .transport(second.clone())
            .concurrency(8)
            .build();

        assert_eq!(params.archive_dir, Some(PathBuf::from("/tmp/two")));
        assert!(params.transport.as_ref().unwrap().same(&second));
        assert_eq!(params.concurrency(), 8);
    }

    #[test]
    fn transport_overlay_replaces_existing() {
        let original = Transport::new(&[], false).unwrap();
        let overlay = Transport::new(&[], true).unwrap();

        let params = Parameters::builder()
            .transport(original)
            .build()
            .with_transport(overlay.clone());

        assert!(params.transport.unwrap().same(&overlay));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let params = Parameters::builder().concurrency(0).build();
        assert_eq!(params.concurrency(), 1);
        assert_eq!(Parameters::default().concurrency(), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn registry_errors_are_classified() {
        assert!(matches!(
            StoreError::from(RegistryError::ManifestNotFound("x".into())),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            StoreError::from(RegistryError::Unauthorized {
                url: "u".into(),
                status: 401
            }),
            StoreError::Auth(_)
        ));
        assert!(matches!(
            StoreError::from(RegistryError::UnexpectedStatus {
                method: "GET",
                url: "u".into(),
                status: 500
            }),
            StoreError::Network(_)
        ));
    }
}
