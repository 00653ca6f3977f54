use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;

use super::archive::{BUNDLE_FILE, write_archive};
use super::oplog::OperationLog;
use super::{OperationState, PackagerError, Result, cancellable, construct_store, parent_dir};
use crate::bundle::{Bundle, BundleImage, BundleLoader};
use crate::imagestore::{Constructor, DEFAULT_CONCURRENCY, Parameters, Store};
use crate::registry::progress::ProgressTracker;

/// Writes a bundle and, unless the constructor builds a registry store,
/// every image it references into a single archive.
pub struct Exporter {
    source: PathBuf,
    destination: Option<PathBuf>,
    loader: Box<dyn BundleLoader>,
    constructor: Arc<dyn Constructor>,
    concurrency: usize,
    progress: Option<Arc<dyn ProgressTracker>>,
    log: OperationLog,
    state: OperationState,
}

impl Exporter {
    /// Prepares an export of the bundle manifest at `source`. Without a
    /// `destination` the archive is written to `<name>-<version>.tgz` in the
    /// current directory.
    pub fn new(
        source: impl Into<PathBuf>,
        destination: Option<PathBuf>,
        logs_dir: &Path,
        loader: Box<dyn BundleLoader>,
        constructor: Box<dyn Constructor>,
    ) -> Result<Self> {
        let log = OperationLog::create(logs_dir, "export")?;
        Ok(Self {
            source: source.into(),
            destination,
            loader,
            constructor: Arc::from(constructor),
            concurrency: DEFAULT_CONCURRENCY,
            progress: None,
            log,
            state: OperationState::Initialized,
        })
    }

    /// Images processed at once. Also bounds blob downloads per image.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn logs(&self) -> &Path {
        self.log.path()
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Runs the export and returns the archive path. On failure nothing is
    /// left at the destination. An exporter runs at most once.
    pub async fn export(&mut self, cancel: &CancellationToken) -> Result<PathBuf> {
        if self.state != OperationState::Initialized {
            return Err(PackagerError::AlreadyRun);
        }
        self.state = OperationState::Staging;

        match self.run(cancel).await {
            Ok(archive) => {
                self.state = OperationState::Finalized;
                self.log.info(format!("wrote {}", archive.display()));
                Ok(archive)
            }
            Err(e) => {
                self.state = OperationState::Failed;
                self.log.error(format!("export failed: {e}"));
                Err(e)
            }
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        self.log.info(format!("loading bundle {}", self.source.display()));
        let bundle = self.loader.load(&self.source)?;
        let manifest = tokio::fs::read(&self.source).await?;

        let destination = self
            .destination
            .clone()
            .unwrap_or_else(|| PathBuf::from(bundle.archive_name()));
        let staging = tempfile::Builder::new()
            .prefix(".stowage-export-")
            .tempdir_in(parent_dir(&destination))?;

        let mut params = Parameters::builder()
            .archive_dir(staging.path())
            .concurrency(self.concurrency);
        if let Some(progress) = &self.progress {
            params = params.progress(progress.clone());
        }
        let store = construct_store(&self.constructor, params.build()).await?;
        self.log.info(format!(
            "exporting {} {} with a {} store",
            bundle.name,
            bundle.version,
            store.kind()
        ));

        cancellable(cancel, self.add_images(store.as_ref(), &bundle)).await?;
        drop(store);

        tokio::fs::write(staging.path().join(BUNDLE_FILE), &manifest).await?;
        write_archive(staging.path().to_path_buf(), destination.clone(), cancel.clone()).await?;
        Ok(destination)
    }

    async fn add_images(&self, store: &dyn Store, bundle: &Bundle) -> Result<()> {
        stream::iter(bundle.images())
            .map(|image| self.add_image(store, image))
            .buffered(self.concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn add_image(&self, store: &dyn Store, image: &BundleImage) -> Result<()> {
        let digest = store
            .add(&image.image)
            .await
            .map_err(|source| PackagerError::Image {
                image: image.image.clone(),
                source,
            })?;

        if let Some(expected) = &image.content_digest {
            if *expected != digest {
                return Err(PackagerError::DigestMismatch {
                    image: image.image.clone(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }
        self.log.info(format!("added {} ({digest})", image.image));
        Ok(())
    }
}
