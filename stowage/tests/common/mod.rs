// Shared test utilities: a fake registry built on wiremock.
#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::json;
use stowage::imagestore::{ConstructionMode, Constructor, TransportBinding, new_constructor};
use stowage::manifest::{media_types, sha256_digest};
use stowage::registry::HttpTransportProvider;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A single-layer image as a registry would serve it.
pub struct FakeImage {
    pub repository: String,
    pub tag: String,
    pub manifest: Vec<u8>,
    pub digest: String,
    pub config: Vec<u8>,
    pub layer: Vec<u8>,
}

impl FakeImage {
    pub fn new(repository: &str, tag: &str, layer: &[u8]) -> Self {
        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": [sha256_digest(layer)]}
        }))
        .unwrap();
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": sha256_digest(&config),
                "size": config.len()
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": sha256_digest(layer),
                "size": layer.len()
            }]
        }))
        .unwrap();

        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: sha256_digest(&manifest),
            manifest,
            config,
            layer: layer.to_vec(),
        }
    }

    /// `host:port/repository:tag` on `server`.
    pub fn reference(&self, server: &MockServer) -> String {
        format!("{}/{}:{}", server.address(), self.repository, self.tag)
    }

    pub fn config_digest(&self) -> String {
        sha256_digest(&self.config)
    }

    pub fn layer_digest(&self) -> String {
        sha256_digest(&self.layer)
    }

    pub fn manifest_mock(&self, reference: &str) -> Mock {
        manifest_mock(&self.repository, reference, media_types::OCI_MANIFEST, &self.manifest)
    }

    pub fn config_mock(&self) -> Mock {
        blob_mock(&self.repository, &self.config)
    }

    pub fn layer_mock(&self) -> Mock {
        blob_mock(&self.repository, &self.layer)
    }

    /// Serves the manifest by tag and by digest, plus both blobs.
    pub async fn mount(&self, server: &MockServer) {
        self.manifest_mock(&self.tag).mount(server).await;
        self.manifest_mock(&self.digest).mount(server).await;
        self.config_mock().mount(server).await;
        self.layer_mock().mount(server).await;
    }
}

pub fn manifest_mock(repository: &str, reference: &str, media_type: &str, body: &[u8]) -> Mock {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repository}/manifests/{reference}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Docker-Content-Digest", sha256_digest(body).as_str())
                .set_body_raw(body.to_vec(), media_type),
        )
}

pub fn blob_mock(repository: &str, body: &[u8]) -> Mock {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repository}/blobs/{}", sha256_digest(body))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
}

/// Makes `server` accept pushes into `repository`: every blob is missing,
/// uploads and manifests are accepted.
pub async fn accept_pushes(server: &MockServer, repository: &str) {
    let session = format!("/v2/{repository}/blobs/uploads/session-1");

    Mock::given(method("HEAD"))
        .and(wiremock::matchers::path_regex(format!(
            "^/v2/{repository}/blobs/sha256:[0-9a-f]{{64}}$"
        )))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{repository}/blobs/uploads/")))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", session.as_str()))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(session.as_str()))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(wiremock::matchers::path_regex(format!("^/v2/{repository}/manifests/.+$")))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

/// Writes a bundle manifest named `demo` referencing `images`, the first as
/// the invocation image.
pub fn write_bundle(dir: &Path, images: &[String]) -> PathBuf {
    let mut bundle = json!({"name": "demo", "version": "1.0.0", "schemaVersion": "v1"});
    if let Some((invocation, rest)) = images.split_first() {
        bundle["invocationImages"] = json!([{"imageType": "docker", "image": invocation}]);
        let components: serde_json::Map<_, _> = rest
            .iter()
            .enumerate()
            .map(|(i, image)| (format!("component-{i}"), json!({"image": image})))
            .collect();
        bundle["images"] = serde_json::Value::Object(components);
    }

    let path = dir.join("demo.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&bundle).unwrap()).unwrap();
    path
}

/// A creating constructor over a plain transport.
pub fn creating(thin: bool) -> Box<dyn Constructor> {
    Box::new(TransportBinding::new(
        Arc::new(HttpTransportProvider),
        Vec::new(),
        false,
        new_constructor(ConstructionMode::Creating { thin }),
    ))
}

/// Entry paths of a gzip tarball, in archive order.
pub fn archive_entries(archive: &Path) -> Vec<String> {
    let mut tarball = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
    tarball
        .entries()
        .unwrap()
        .map(|e| {
            e.unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect()
}
