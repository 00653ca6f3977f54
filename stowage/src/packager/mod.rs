//! Export and import of bundle archives.
//!
//! An archive is a gzip-compressed tarball with the bundle manifest at
//! `bundle.json` and, for thick archives, every image under
//! `artifacts/layout` as an OCI image layout. Both directions stage their
//! work in a temporary directory next to the destination and only move the
//! result into place once everything succeeded.

pub mod archive;
pub mod exporter;
pub mod importer;
pub mod oplog;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bundle::BundleLoadError;
use crate::imagestore::{Constructor, Parameters, Store, StoreError};

pub use archive::{BUNDLE_FILE, unpack_archive, write_archive};
pub use exporter::Exporter;
pub use importer::{ImportSummary, Importer, RELOCATION_MAPPING_FILE};
pub use oplog::OperationLog;

#[derive(Error, Debug)]
pub enum PackagerError {
    #[error(transparent)]
    BundleLoad(#[from] BundleLoadError),

    #[error("cannot set up image store: {0}")]
    Store(#[from] StoreError),

    #[error("image {image}: {source}")]
    Image {
        image: String,
        #[source]
        source: StoreError,
    },

    #[error("image {image} resolved to {actual}, bundle declares {expected}")]
    DigestMismatch {
        image: String,
        expected: String,
        actual: String,
    },

    #[error("destination {} already exists", .0.display())]
    DestinationExists(PathBuf),

    #[error("invalid archive: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation already ran")]
    AlreadyRun,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PackagerError>;

/// Lifecycle of one export or import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Initialized,
    Staging,
    Finalized,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Initialized => "initialized",
            OperationState::Staging => "staging",
            OperationState::Finalized => "finalized",
            OperationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs `work` until it finishes or `cancel` fires, whichever is first.
/// Dropping `work` aborts its outstanding requests.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PackagerError::Cancelled),
        result = work => result,
    }
}

/// Runs the constructor on the blocking pool. Locating a layout reads every
/// manifest in it.
pub(crate) async fn construct_store(
    constructor: &Arc<dyn Constructor>,
    params: Parameters,
) -> Result<Box<dyn Store>> {
    let constructor = constructor.clone();
    Ok(tokio::task::spawn_blocking(move || constructor.construct(params)).await??)
}

/// Directory a destination path lives in; bare file names live in the
/// current directory.
pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
