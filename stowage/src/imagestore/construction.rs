//! Choosing and building the image store for one operation.
//!
//! Exporting uses a [`CreatingConstructor`], told up front whether the
//! archive is thin. Importing uses a [`LocatingConstructor`], which reads
//! the mode off the unpacked archive with [`is_thin`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ocilayout::{ARTIFACTS_DIR, OciLayoutStore};
use super::remote::RegistryStore;
use super::{Parameters, Store, StoreError};
use crate::registry::TransportProvider;

/// Builds a store from parameters supplied at call time.
pub trait Constructor: Send + Sync {
    fn construct(&self, params: Parameters) -> Result<Box<dyn Store>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionMode {
    /// Building a new archive; `thin` archives carry no images.
    Creating { thin: bool },
    /// Reading an existing archive; the mode comes from its contents.
    Locating,
}

pub fn new_constructor(mode: ConstructionMode) -> Box<dyn Constructor> {
    match mode {
        ConstructionMode::Creating { thin } => Box::new(CreatingConstructor { thin }),
        ConstructionMode::Locating => Box::new(LocatingConstructor),
    }
}

/// A bundle unpacked in `archive_dir` is thin when there is no directory at
/// all or it has no `artifacts` subdirectory.
pub fn is_thin(archive_dir: Option<&Path>) -> bool {
    match archive_dir {
        None => true,
        Some(dir) if dir.as_os_str().is_empty() => true,
        Some(dir) => !dir.join(ARTIFACTS_DIR).exists(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CreatingConstructor {
    pub thin: bool,
}

impl Constructor for CreatingConstructor {
    fn construct(&self, params: Parameters) -> Result<Box<dyn Store>, StoreError> {
        if self.thin {
            Ok(Box::new(RegistryStore::create(params)?))
        } else {
            Ok(Box::new(OciLayoutStore::create(params)?))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LocatingConstructor;

impl Constructor for LocatingConstructor {
    fn construct(&self, params: Parameters) -> Result<Box<dyn Store>, StoreError> {
        if is_thin(params.archive_dir.as_deref()) {
            Ok(Box::new(RegistryStore::create(params)?))
        } else {
            Ok(Box::new(OciLayoutStore::locate(params)?))
        }
    }
}

/// Binds a constructor to TLS settings: each `construct` asks the provider
/// for a transport with exactly these settings, sets it on the parameters,
/// then delegates.
pub struct TransportBinding {
    provider: Arc<dyn TransportProvider>,
    ca_cert_paths: Vec<PathBuf>,
    skip_tls_verify: bool,
    inner: Box<dyn Constructor>,
}

impl TransportBinding {
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        ca_cert_paths: Vec<PathBuf>,
        skip_tls_verify: bool,
        inner: Box<dyn Constructor>,
    ) -> Self {
        Self {
            provider,
            ca_cert_paths,
            skip_tls_verify,
            inner,
        }
    }
}

impl Constructor for TransportBinding {
    fn construct(&self, params: Parameters) -> Result<Box<dyn Store>, StoreError> {
        let transport = self
            .provider
            .new_transport(&self.ca_cert_paths, self.skip_tls_verify)?;
        self.inner.construct(params.with_transport(transport))
    }
}
