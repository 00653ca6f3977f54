use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt, stream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::remote::parse_reference;
use super::transfer::{ImageSource, parse_child, parse_manifest, push_image};
use super::{ClientPool, Parameters, Store, StoreError, StoreKind, blocking};
use crate::manifest::{
    self, Descriptor, IMAGE_LAYOUT_VERSION, ImageIndex, Manifest, OciLayout, media_types,
};
use crate::registry::{FetchedManifest, RegistryClient};

pub const ARTIFACTS_DIR: &str = "artifacts";
pub const LAYOUT_DIR: &str = "layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_MARKER: &str = "oci-layout";

/// Store backed by an OCI image layout under `<archive>/artifacts/layout`.
///
/// Blobs are content-addressed and never rewritten once present. Each
/// manifest digest appears once in `index.json`; further names for it are
/// kept as aliases on that entry. Index updates go through one mutex and
/// `index.json` is rewritten atomically, sorted by reference name and digest.
pub struct OciLayoutStore {
    root: PathBuf,
    clients: Option<ClientPool>,
    concurrency: usize,
    index: Mutex<ImageIndex>,
}

impl OciLayoutStore {
    pub fn layout_dir(archive_dir: &Path) -> PathBuf {
        archive_dir.join(ARTIFACTS_DIR).join(LAYOUT_DIR)
    }

    /// Opens the layout under the archive directory, initialising it when it
    /// does not exist yet. Needs a transport, since adding pulls from
    /// registries.
    pub fn create(params: Parameters) -> Result<Self, StoreError> {
        let archive_dir = archive_dir(&params)?;
        let clients = params.client_pool().ok_or_else(|| {
            StoreError::Configuration(
                "an OCI layout store needs a transport to pull images".to_string(),
            )
        })?;

        let root = Self::layout_dir(&archive_dir);
        let index = if root.join(INDEX_FILE).exists() {
            validate_layout(&root)?
        } else {
            std::fs::create_dir_all(root.join("blobs").join("sha256"))?;
            write_atomic(&root.join(LAYOUT_MARKER), &to_json(&OciLayout::default())?)?;
            let index = ImageIndex::default();
            write_atomic(&root.join(INDEX_FILE), &to_json(&index)?)?;
            index
        };

        tracing::debug!(root = %root.display(), "opened OCI layout store");
        Ok(Self {
            root,
            clients: Some(clients),
            concurrency: params.concurrency(),
            index: Mutex::new(index),
        })
    }

    /// Opens an existing layout, checking that every blob reachable from
    /// `index.json` is present. The transport is only needed for `push`.
    pub fn locate(params: Parameters) -> Result<Self, StoreError> {
        let archive_dir = archive_dir(&params)?;
        let root = Self::layout_dir(&archive_dir);
        let index = validate_layout(&root)?;

        tracing::debug!(
            root = %root.display(),
            manifests = index.manifests.len(),
            "located OCI layout store"
        );
        Ok(Self {
            root,
            clients: params.client_pool(),
            concurrency: params.concurrency(),
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the current index.
    pub async fn index(&self) -> ImageIndex {
        self.index.lock().await.clone()
    }

    fn clients(&self) -> Result<&ClientPool, StoreError> {
        self.clients.as_ref().ok_or_else(|| {
            StoreError::Configuration("no transport configured for registry access".to_string())
        })
    }

    fn blob_file(&self, digest: &str) -> Result<PathBuf, StoreError> {
        manifest::blob_path(digest)
            .map(|p| self.root.join(p))
            .map_err(StoreError::Integrity)
    }

    /// Index entry for `image`, by name or by the digest it is pinned to.
    async fn lookup(&self, image: &str, pinned: Option<&str>) -> Option<Descriptor> {
        self.index
            .lock()
            .await
            .manifests
            .iter()
            .find(|d| d.is_named(image) || pinned == Some(d.digest.as_str()))
            .cloned()
    }

    async fn contains(&self, digest: &str) -> bool {
        self.index
            .lock()
            .await
            .manifests
            .iter()
            .any(|d| d.digest == digest)
    }

    fn write_manifest_tree<'a>(
        &'a self,
        client: &'a RegistryClient,
        repository: &'a str,
        fetched: &'a FetchedManifest,
        nested: bool,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            let parsed = if nested {
                parse_child(fetched)?
            } else {
                parse_manifest(fetched)?
            };

            for child in parsed.children() {
                let child_manifest = client.fetch_manifest(repository, &child.digest).await?;
                self.write_manifest_tree(client, repository, &child_manifest, true)
                    .await?;
            }
            self.pull_blobs(client, repository, &parsed).await?;
            self.write_blob(&fetched.digest, fetched.bytes.clone()).await
        }
        .boxed()
    }

    async fn pull_blobs(
        &self,
        client: &RegistryClient,
        repository: &str,
        manifest: &Manifest,
    ) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for blob in manifest.blobs() {
            if seen.insert(blob.digest.as_str())
                && !tokio::fs::try_exists(self.blob_file(&blob.digest)?).await?
            {
                missing.push(blob);
            }
        }

        let pulls: Vec<_> = missing
            .into_iter()
            .map(|blob| self.pull_blob(client, repository, blob))
            .collect();
        stream::iter(pulls)
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn pull_blob(
        &self,
        client: &RegistryClient,
        repository: &str,
        descriptor: &Descriptor,
    ) -> Result<(), StoreError> {
        let dest = self.blob_file(&descriptor.digest)?;
        let dir = parent_dir(&dest)?.to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let partial = blocking(move || {
            Ok(tempfile::Builder::new()
                .prefix(".partial-")
                .tempfile_in(dir)?
                .into_temp_path())
        })
        .await?;
        client.fetch_blob(repository, descriptor, &partial).await?;
        blocking(move || Ok(partial.persist(&dest).map_err(|e| e.error)?)).await
    }

    async fn write_blob(&self, digest: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let dest = self.blob_file(digest)?;
        if tokio::fs::try_exists(&dest).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(parent_dir(&dest)?).await?;
        blocking(move || write_atomic(&dest, &bytes)).await
    }

    /// Records `image` as a name of `entry`'s digest. The name moves off any
    /// other digest, and entries left without a name are dropped.
    async fn record(&self, image: &str, entry: Descriptor) -> Result<(), StoreError> {
        let mut index = self.index.lock().await;
        if index
            .manifests
            .iter()
            .any(|d| d.digest == entry.digest && d.is_named(image))
        {
            return Ok(());
        }

        let mut orphaned = Vec::new();
        for descriptor in index.manifests.iter_mut() {
            if descriptor.digest != entry.digest && descriptor.is_named(image) {
                let names = owned_names(descriptor, |n| n != image);
                if names.is_empty() {
                    orphaned.push(descriptor.digest.clone());
                }
                descriptor.set_ref_names(names);
            }
        }
        index.manifests.retain(|d| !orphaned.contains(&d.digest));

        match index.manifests.iter_mut().find(|d| d.digest == entry.digest) {
            Some(descriptor) => {
                let mut names = owned_names(descriptor, |_| true);
                names.insert(image.to_string());
                descriptor.set_ref_names(names);
            }
            None => {
                let mut descriptor = entry;
                descriptor.set_ref_names(BTreeSet::from([image.to_string()]));
                index.manifests.push(descriptor);
            }
        }
        index
            .manifests
            .sort_by(|a, b| (a.ref_name(), &a.digest).cmp(&(b.ref_name(), &b.digest)));

        let bytes = to_json(&*index)?;
        let path = self.root.join(INDEX_FILE);
        blocking(move || write_atomic(&path, &bytes)).await
    }
}

#[async_trait]
impl Store for OciLayoutStore {
    fn kind(&self) -> StoreKind {
        StoreKind::OciLayout
    }

    async fn add(&self, image: &str) -> Result<String, StoreError> {
        let reference = parse_reference(image)?;
        if let Some(entry) = self.lookup(image, reference.digest.as_deref()).await {
            let digest = entry.digest.clone();
            tracing::debug!(image, %digest, "image already in layout");
            self.record(image, entry).await?;
            return Ok(digest);
        }

        let client = self.clients()?.client(&reference.registry);
        let fetched = client
            .fetch_manifest(&reference.repository, reference.manifest_reference())
            .await?;
        if self.contains(&fetched.digest).await {
            tracing::debug!(image, digest = %fetched.digest, "manifest already in layout");
        } else {
            self.write_manifest_tree(&client, &reference.repository, &fetched, false)
                .await?;
        }
        let entry = Descriptor {
            media_type: fetched.media_type.clone(),
            digest: fetched.digest.clone(),
            size: fetched.bytes.len() as u64,
            annotations: None,
            platform: None,
        };
        self.record(image, entry).await?;

        tracing::info!(image, digest = %fetched.digest, "added image to layout");
        Ok(fetched.digest)
    }

    async fn push(&self, digest: &str, src: &str, dst: &str) -> Result<String, StoreError> {
        let dst = parse_reference(dst)?;
        let target = self.clients()?.client(&dst.registry);
        tracing::debug!(src, %dst, digest, "pushing image from layout");
        push_image(&LayoutSource { store: self }, &target, &dst, digest).await
    }
}

struct LayoutSource<'a> {
    store: &'a OciLayoutStore,
}

#[async_trait]
impl<'a> ImageSource for LayoutSource<'a> {
    async fn manifest(&self, digest: &str) -> Result<FetchedManifest, StoreError> {
        let path = self.store.blob_file(digest)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| StoreError::CorruptLayout(format!("missing manifest blob {digest}")))?;
        if manifest::sha256_digest(&bytes) != digest {
            return Err(StoreError::CorruptLayout(format!(
                "manifest blob {digest} does not match its digest"
            )));
        }

        let indexed = self
            .store
            .index
            .lock()
            .await
            .manifests
            .iter()
            .find(|d| d.digest == digest)
            .map(|d| d.media_type.clone());
        let media_type = indexed
            .or_else(|| manifest::embedded_media_type(&bytes))
            .unwrap_or_else(|| media_types::OCI_MANIFEST.to_string());

        Ok(FetchedManifest {
            digest: digest.to_string(),
            media_type,
            bytes,
        })
    }

    async fn blob(&self, descriptor: &Descriptor, _scratch: &Path) -> Result<PathBuf, StoreError> {
        let path = self.store.blob_file(&descriptor.digest)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::CorruptLayout(format!(
                "missing blob {}",
                descriptor.digest
            )));
        }
        Ok(path)
    }
}

fn archive_dir(params: &Parameters) -> Result<PathBuf, StoreError> {
    params.archive_dir.clone().ok_or_else(|| {
        StoreError::Configuration("an OCI layout store needs an archive directory".to_string())
    })
}

fn parent_dir(path: &Path) -> Result<&Path, StoreError> {
    path.parent().ok_or_else(|| {
        StoreError::CorruptLayout(format!("blob path {} has no parent", path.display()))
    })
}

fn owned_names(descriptor: &Descriptor, keep: impl Fn(&str) -> bool) -> BTreeSet<String> {
    descriptor
        .ref_names()
        .into_iter()
        .filter(|n| keep(n))
        .map(str::to_string)
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = std::fs::read(path)
        .map_err(|e| StoreError::CorruptLayout(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::CorruptLayout(format!("cannot parse {}: {e}", path.display())))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value)
        .map_err(|e| StoreError::CorruptLayout(format!("cannot serialize layout file: {e}")))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = parent_dir(path)?;
    let mut file = tempfile::Builder::new().prefix(".partial-").tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Checks the marker, parses `index.json`, and walks every manifest it
/// reaches to make sure their blobs exist.
fn validate_layout(root: &Path) -> Result<ImageIndex, StoreError> {
    let marker: OciLayout = read_json(&root.join(LAYOUT_MARKER))?;
    if marker.image_layout_version != IMAGE_LAYOUT_VERSION {
        return Err(StoreError::CorruptLayout(format!(
            "unsupported image layout version {}",
            marker.image_layout_version
        )));
    }

    let index: ImageIndex = read_json(&root.join(INDEX_FILE))?;
    let mut pending: Vec<Descriptor> = index.manifests.clone();
    let mut visited = HashSet::new();

    while let Some(descriptor) = pending.pop() {
        if !visited.insert(descriptor.digest.clone()) {
            continue;
        }
        let path = root.join(
            manifest::blob_path(&descriptor.digest).map_err(StoreError::CorruptLayout)?,
        );
        let bytes = std::fs::read(&path).map_err(|_| {
            StoreError::CorruptLayout(format!("missing manifest blob {}", descriptor.digest))
        })?;
        if manifest::sha256_digest(&bytes) != descriptor.digest {
            return Err(StoreError::CorruptLayout(format!(
                "manifest blob {} does not match its digest",
                descriptor.digest
            )));
        }

        let parsed = Manifest::parse(&bytes, &descriptor.media_type).map_err(|e| {
            StoreError::CorruptLayout(format!("malformed manifest {}: {e}", descriptor.digest))
        })?;
        for blob in parsed.blobs() {
            let blob_path =
                root.join(manifest::blob_path(&blob.digest).map_err(StoreError::CorruptLayout)?);
            if !blob_path.exists() {
                return Err(StoreError::CorruptLayout(format!("missing blob {}", blob.digest)));
            }
        }
        pending.extend(parsed.children().iter().cloned());
    }

    Ok(index)
}
