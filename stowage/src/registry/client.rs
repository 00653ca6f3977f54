use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::progress::{NoopProgress, ProgressTracker};
use super::transport::Transport;
use crate::manifest::{self, Descriptor, media_types};
use crate::reference;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Header not found: {0}")]
    HeaderNotFound(String),

    #[error("Token fetch from {realm} failed with status code {status}")]
    TokenFetchFailed { realm: String, status: u16 },

    #[error("Token not found in auth response")]
    TokenNotFound,

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Access denied to {url} (status code {status})")]
    Unauthorized { url: String, status: u16 },

    #[error("{method} {url} failed with status code {status}")]
    UnexpectedStatus {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid upload location: {0}")]
    InvalidLocation(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// A manifest as served by a registry, with the digest of its exact bytes.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub digest: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Client for one registry host. Bearer tokens obtained through the
/// `WWW-Authenticate` challenge are cached per scope and shared by clones.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    registry: String,
    registry_url: String,
    tokens: Arc<Mutex<HashMap<String, String>>>,
    progress: Arc<dyn ProgressTracker>,
}

impl RegistryClient {
    pub fn new(transport: &Transport, registry: &str) -> Self {
        Self {
            http: transport.http().clone(),
            registry: registry.to_string(),
            registry_url: reference::registry_url(registry),
            tokens: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    fn cached_token(&self, scope: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(scope)
            .cloned()
    }

    fn authorize(&self, request: reqwest::RequestBuilder, scope: &str) -> reqwest::RequestBuilder {
        match self.cached_token(scope) {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Sends a request, answering at most one bearer challenge. `build` is
    /// called again for the re-sent request.
    async fn send<F>(&self, repository: &str, actions: &str, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let scope = format!("repository:{repository}:{actions}");
        let response = self.authorize(build(&self.http), &scope).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let token = self.fetch_token(&challenge, &scope).await?;
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(scope.clone(), token);

        Ok(self.authorize(build(&self.http), &scope).send().await?)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge, scope: &str) -> Result<String> {
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        query.push(("scope", scope));

        tracing::debug!(realm = %challenge.realm, scope, "requesting registry token");
        let response = self.http.get(&challenge.realm).query(&query).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::TokenFetchFailed {
                realm: challenge.realm.clone(),
                status: response.status().as_u16(),
            });
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or(RegistryError::TokenNotFound)
    }

    /// Fetches a manifest by tag or digest and verifies its content digest
    /// against the registry's `Docker-Content-Digest` and a pinned reference.
    pub async fn fetch_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<FetchedManifest> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.registry_url);
        tracing::debug!(%url, "fetching manifest");

        let accept = media_types::accept_header();
        let response = self
            .send(repository, "pull", |http| {
                http.get(&url).header(reqwest::header::ACCEPT, &accept)
            })
            .await?;
        let response = check(response, "GET", || {
            RegistryError::ManifestNotFound(format!("{}/{repository}:{reference}", self.registry))
        })?;

        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let advertised_digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?.to_vec();
        let digest = manifest::sha256_digest(&bytes);

        let media_type = header_type
            .filter(|t| media_types::is_manifest(t) || media_types::is_index(t))
            .or_else(|| manifest::embedded_media_type(&bytes))
            .ok_or_else(|| RegistryError::UnsupportedContentType(format!("manifest {reference}")))?;
        if !media_types::is_manifest(&media_type) && !media_types::is_index(&media_type) {
            return Err(RegistryError::UnsupportedContentType(media_type));
        }

        for expected in [advertised_digest.as_deref(), Some(reference)]
            .into_iter()
            .flatten()
            .filter(|d| d.starts_with("sha256:"))
        {
            if expected != digest {
                return Err(RegistryError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }

        Ok(FetchedManifest {
            digest,
            media_type,
            bytes,
        })
    }

    pub async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{repository}/blobs/{digest}", self.registry_url);
        let response = self.send(repository, "pull", |http| http.head(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response, "HEAD", || RegistryError::BlobNotFound(digest.to_string()))?;
        Ok(true)
    }

    /// Streams a blob to `dest`, hashing as it goes. `dest` is left in place
    /// on failure; callers write to a scratch path.
    pub async fn fetch_blob(
        &self,
        repository: &str,
        descriptor: &Descriptor,
        dest: &Path,
    ) -> Result<()> {
        let url = format!("{}/v2/{repository}/blobs/{}", self.registry_url, descriptor.digest);
        tracing::debug!(%url, size = descriptor.size, "fetching blob");

        let mut hasher = BlobHasher::for_digest(&descriptor.digest)?;
        let response = self.send(repository, "pull", |http| http.get(&url)).await?;
        let response = check(response, "GET", || {
            RegistryError::BlobNotFound(descriptor.digest.clone())
        })?;

        let total = response.content_length().unwrap_or(descriptor.size);
        self.progress.start_transfer(&descriptor.digest, total);

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            self.progress.update(&descriptor.digest, chunk.len() as u64);
        }
        file.flush().await?;
        self.progress.finish(&descriptor.digest);

        let actual = hasher.finish();
        if actual != descriptor.digest {
            return Err(RegistryError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Monolithic upload: `POST` to open a session, then a single `PUT`
    /// carrying the whole blob.
    pub async fn upload_blob(&self, repository: &str, digest: &str, source: &Path) -> Result<()> {
        let url = format!("{}/v2/{repository}/blobs/uploads/", self.registry_url);
        tracing::debug!(%url, digest, "starting blob upload");

        let response = self.send(repository, "pull,push", |http| http.post(&url)).await?;
        let response = check(response, "POST", || {
            RegistryError::UnexpectedStatus {
                method: "POST",
                url: url.clone(),
                status: StatusCode::NOT_FOUND.as_u16(),
            }
        })?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::HeaderNotFound(LOCATION.to_string()))?;
        let mut upload_url = response
            .url()
            .join(location)
            .map_err(|_| RegistryError::InvalidLocation(location.to_string()))?;
        upload_url.query_pairs_mut().append_pair("digest", digest);

        let file = File::open(source).await?;
        let length = file.metadata().await?.len();
        let scope = format!("repository:{repository}:pull,push");
        let response = self
            .authorize(self.http.put(upload_url), &scope)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        check(response, "PUT", || RegistryError::BlobNotFound(digest.to_string()))?;
        Ok(())
    }

    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let url = format!("{}/v2/{repository}/manifests/{reference}", self.registry_url);
        tracing::debug!(%url, media_type, "uploading manifest");

        let response = self
            .send(repository, "pull,push", |http| {
                http.put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(bytes.to_vec())
            })
            .await?;
        check(response, "PUT", || {
            RegistryError::ManifestNotFound(format!("{}/{repository}:{reference}", self.registry))
        })?;
        Ok(())
    }
}

fn check(
    response: Response,
    method: &'static str,
    not_found: impl FnOnce() -> RegistryError,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    match status {
        StatusCode::NOT_FOUND => Err(not_found()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Unauthorized {
            url,
            status: status.as_u16(),
        }),
        _ => Err(RegistryError::UnexpectedStatus {
            method,
            url,
            status: status.as_u16(),
        }),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

impl BearerChallenge {
    /// Parses `Bearer realm="...",service="...",scope="..."`. Other schemes
    /// yield `None`.
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        for part in params.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
        })
    }
}

enum BlobHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl BlobHasher {
    fn for_digest(digest: &str) -> Result<Self> {
        match manifest::split_digest(digest).map_err(RegistryError::InvalidDigest)? {
            ("sha256", _) => Ok(BlobHasher::Sha256(Sha256::new())),
            _ => Ok(BlobHasher::Sha512(Sha512::new())),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            BlobHasher::Sha256(h) => h.update(bytes),
            BlobHasher::Sha512(h) => h.update(bytes),
        }
    }

    fn finish(self) -> String {
        match self {
            BlobHasher::Sha256(h) => format!("sha256:{:x}", h.finalize()),
            BlobHasher::Sha512(h) => format!("sha512:{:x}", h.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let challenge = BearerChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
    }

    #[test]
    fn ignores_basic_challenge() {
        assert_eq!(BearerChallenge::parse(r#"Basic realm="registry""#), None);
        assert_eq!(BearerChallenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn hasher_matches_manifest_digest() {
        let mut hasher = BlobHasher::for_digest(&manifest::sha256_digest(b"")).unwrap();
        hasher.update(b"layer");
        assert_eq!(hasher.finish(), manifest::sha256_digest(b"layer"));
    }
}
