use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{StoreError, blocking};
use crate::manifest::{Descriptor, Manifest};
use crate::reference::ImageReference;
use crate::registry::{FetchedManifest, RegistryClient};

/// Read side of a push: where manifests and blobs come from.
#[async_trait]
pub(crate) trait ImageSource: Send + Sync {
    async fn manifest(&self, digest: &str) -> Result<FetchedManifest, StoreError>;

    /// Path of a file holding the blob. Sources without local copies
    /// download into `scratch`.
    async fn blob(&self, descriptor: &Descriptor, scratch: &Path) -> Result<PathBuf, StoreError>;
}

pub(crate) fn parse_manifest(fetched: &FetchedManifest) -> Result<Manifest, StoreError> {
    Manifest::parse(&fetched.bytes, &fetched.media_type).map_err(|e| {
        StoreError::Integrity(format!("malformed manifest {}: {e}", fetched.digest))
    })
}

/// Parses a manifest listed by an index. Indexes nested in indexes are
/// rejected.
pub(crate) fn parse_child(fetched: &FetchedManifest) -> Result<Manifest, StoreError> {
    match parse_manifest(fetched)? {
        Manifest::Index(_) => Err(StoreError::Integrity(format!(
            "nested image index {} is not supported",
            fetched.digest
        ))),
        image => Ok(image),
    }
}

/// Copies the image rooted at manifest `digest` from `source` to `dst`:
/// blobs the target lacks, child manifests by digest, then the root
/// manifest under the destination tag (or its digest when untagged).
pub(crate) async fn push_image(
    source: &dyn ImageSource,
    target: &RegistryClient,
    dst: &ImageReference,
    digest: &str,
) -> Result<String, StoreError> {
    let scratch = blocking(|| Ok(tempfile::tempdir()?)).await?;
    let root = source.manifest(digest).await?;
    let parsed = parse_manifest(&root)?;

    for child in parsed.children() {
        let fetched = source.manifest(&child.digest).await?;
        let child_manifest = parse_child(&fetched)?;
        push_blobs(source, target, &dst.repository, &child_manifest, scratch.path()).await?;
        target
            .put_manifest(&dst.repository, &child.digest, &fetched.media_type, &fetched.bytes)
            .await?;
    }
    push_blobs(source, target, &dst.repository, &parsed, scratch.path()).await?;

    let reference = dst.tag.as_deref().unwrap_or(digest);
    target
        .put_manifest(&dst.repository, reference, &root.media_type, &root.bytes)
        .await?;

    blocking(move || Ok(scratch.close()?)).await?;
    let pushed = dst.with_digest(digest).to_string();
    tracing::info!(%pushed, "pushed image");
    Ok(pushed)
}

async fn push_blobs(
    source: &dyn ImageSource,
    target: &RegistryClient,
    repository: &str,
    manifest: &Manifest,
    scratch: &Path,
) -> Result<(), StoreError> {
    for blob in manifest.blobs() {
        if target.blob_exists(repository, &blob.digest).await? {
            tracing::debug!(digest = %blob.digest, repository, "blob already present");
            continue;
        }
        let path = source.blob(blob, scratch).await?;
        target.upload_blob(repository, &blob.digest, &path).await?;
    }
    Ok(())
}
