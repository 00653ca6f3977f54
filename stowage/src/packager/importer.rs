use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, stream};
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use super::archive::{BUNDLE_FILE, unpack_archive};
use super::oplog::OperationLog;
use super::{OperationState, PackagerError, Result, cancellable, construct_store, parent_dir};
use crate::bundle::{Bundle, BundleImage, BundleLoader};
use crate::imagestore::{
    Constructor, DEFAULT_CONCURRENCY, LocatingConstructor, Parameters, Store, StoreError,
    TransportBinding, is_thin,
};
use crate::reference::ImageReference;
use crate::registry::HttpTransportProvider;
use crate::registry::progress::ProgressTracker;

/// Written next to `bundle.json` when images were relocated.
pub const RELOCATION_MAPPING_FILE: &str = "relocation-mapping.json";

#[derive(Debug)]
pub struct ImportSummary {
    pub bundle: Bundle,
    pub destination: PathBuf,
    pub thin: bool,
    /// Original image reference to the pushed `registry/repository@digest`,
    /// in bundle order.
    pub relocations: IndexMap<String, String>,
}

/// Unpacks an archive into a directory and optionally relocates its images
/// to another registry.
pub struct Importer {
    source: PathBuf,
    destination: PathBuf,
    target: Option<String>,
    loader: Box<dyn BundleLoader>,
    constructor: Arc<dyn Constructor>,
    concurrency: usize,
    progress: Option<Arc<dyn ProgressTracker>>,
    log: OperationLog,
    state: OperationState,
}

impl Importer {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        logs_dir: &Path,
        loader: Box<dyn BundleLoader>,
    ) -> Result<Self> {
        let log = OperationLog::create(logs_dir, "import")?;
        Ok(Self {
            source: source.into(),
            destination: destination.into(),
            target: None,
            loader,
            constructor: Arc::new(TransportBinding::new(
                Arc::new(HttpTransportProvider),
                Vec::new(),
                false,
                Box::new(LocatingConstructor),
            )),
            concurrency: DEFAULT_CONCURRENCY,
            progress: None,
            log,
            state: OperationState::Initialized,
        })
    }

    /// Pushes every image under `target` (`registry[/prefix]`).
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Replaces the default, a locating constructor over a plain HTTPS
    /// transport.
    pub fn with_constructor(mut self, constructor: Box<dyn Constructor>) -> Self {
        self.constructor = Arc::from(constructor);
        self
    }

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

    pub async fn import(&mut self, cancel: &CancellationToken) -> Result<ImportSummary> {
        if self.state != OperationState::Initialized {
            return Err(PackagerError::AlreadyRun);
        }
        self.state = OperationState::Staging;

        match self.run(cancel).await {
            Ok(summary) => {
                self.state = OperationState::Finalized;
                self.log.info(format!(
                    "imported {} {} into {}",
                    summary.bundle.name,
                    summary.bundle.version,
                    summary.destination.display()
                ));
                Ok(summary)
            }
            Err(e) => {
                self.state = OperationState::Failed;
                self.log.error(format!("import failed: {e}"));
                Err(e)
            }
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<ImportSummary> {
        if tokio::fs::try_exists(&self.destination).await? {
            return Err(PackagerError::DestinationExists(self.destination.clone()));
        }
        let parent = parent_dir(&self.destination);
        tokio::fs::create_dir_all(&parent).await?;
        let staging = tempfile::Builder::new()
            .prefix(".stowage-import-")
            .tempdir_in(&parent)?;

        self.log.info(format!("unpacking {}", self.source.display()));
        unpack_archive(self.source.clone(), staging.path().to_path_buf(), cancel.clone()).await?;

        let manifest = staging.path().join(BUNDLE_FILE);
        if !manifest.is_file() {
            return Err(PackagerError::Archive(format!(
                "{} has no {BUNDLE_FILE}",
                self.source.display()
            )));
        }
        let bundle = self.loader.load(&manifest)?;
        let thin = is_thin(Some(staging.path()));

        let mut params = Parameters::builder()
            .archive_dir(staging.path())
            .concurrency(self.concurrency);
        if let Some(progress) = &self.progress {
            params = params.progress(progress.clone());
        }
        let store = construct_store(&self.constructor, params.build()).await?;
        self.log.info(format!(
            "bundle {} {} is {} ({} store)",
            bundle.name,
            bundle.version,
            if thin { "thin" } else { "thick" },
            store.kind()
        ));

        let mut relocations = IndexMap::new();
        if let Some(target) = &self.target {
            relocations =
                cancellable(cancel, self.relocate(store.as_ref(), &bundle, target)).await?;
            let mapping = serde_json::to_vec_pretty(&relocations).map_err(|e| {
                PackagerError::Archive(format!("cannot encode relocation mapping: {e}"))
            })?;
            tokio::fs::write(staging.path().join(RELOCATION_MAPPING_FILE), mapping).await?;
        }
        drop(store);

        if cancel.is_cancelled() {
            return Err(PackagerError::Cancelled);
        }
        tokio::fs::rename(staging.path(), &self.destination).await?;

        Ok(ImportSummary {
            bundle,
            destination: self.destination.clone(),
            thin,
            relocations,
        })
    }

    async fn relocate(
        &self,
        store: &dyn Store,
        bundle: &Bundle,
        target: &str,
    ) -> Result<IndexMap<String, String>> {
        let pushed: Vec<(String, String)> = stream::iter(bundle.images())
            .map(|image| self.relocate_image(store, image, target))
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(pushed.into_iter().collect())
    }

    async fn relocate_image(
        &self,
        store: &dyn Store,
        image: &BundleImage,
        target: &str,
    ) -> Result<(String, String)> {
        let failed = |source: StoreError| PackagerError::Image {
            image: image.image.clone(),
            source,
        };

        let digest = store.add(&image.image).await.map_err(failed)?;
        let relocated = ImageReference::parse(&image.image)
            .and_then(|reference| reference.relocate(target))
            .map_err(|e| failed(StoreError::InvalidReference(e)))?
            .to_string();
        let pushed = store
            .push(&digest, &image.image, &relocated)
            .await
            .map_err(failed)?;

        self.log.info(format!("relocated {} to {pushed}", image.image));
        Ok((image.image.clone(), pushed))
    }
}
