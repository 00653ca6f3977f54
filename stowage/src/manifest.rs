use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Value of the `Accept` header sent on manifest requests.
    pub fn accept_header() -> String {
        [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST_V2, DOCKER_MANIFEST_LIST].join(", ")
    }

    pub fn is_index(media_type: &str) -> bool {
        media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
    }

    pub fn is_manifest(media_type: &str) -> bool {
        media_type == OCI_MANIFEST || media_type == DOCKER_MANIFEST_V2
    }
}

/// Annotation carrying the image name a manifest was added under.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Further names of a manifest in an image layout, comma separated. Each
/// digest is listed once in `index.json`, so one name goes in
/// [`REF_NAME_ANNOTATION`] and the rest here.
pub const REF_ALIASES_ANNOTATION: &str = "dev.stowage.image.ref.aliases";

pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION))
            .map(String::as_str)
    }

    /// Every name recorded for this manifest, in order.
    pub fn ref_names(&self) -> BTreeSet<&str> {
        let aliases = self
            .annotations
            .as_ref()
            .and_then(|a| a.get(REF_ALIASES_ANNOTATION))
            .map(|v| v.split(',').filter(|n| !n.is_empty()))
            .into_iter()
            .flatten();
        self.ref_name().into_iter().chain(aliases).collect()
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.ref_names().contains(name)
    }

    /// Replaces the recorded names. The first name is the standard
    /// reference annotation, the others become aliases.
    pub fn set_ref_names(&mut self, names: BTreeSet<String>) {
        let annotations = self.annotations.get_or_insert_with(BTreeMap::new);
        annotations.remove(REF_NAME_ANNOTATION);
        annotations.remove(REF_ALIASES_ANNOTATION);

        let mut names = names.into_iter();
        if let Some(first) = names.next() {
            annotations.insert(REF_NAME_ANNOTATION.to_string(), first);
        }
        let aliases: Vec<String> = names.collect();
        if !aliases.is_empty() {
            annotations.insert(REF_ALIASES_ANNOTATION.to_string(), aliases.join(","));
        }
        if annotations.is_empty() {
            self.annotations = None;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// An OCI image index or a Docker manifest list. Also the shape of a
/// layout's `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: Vec::new(),
            annotations: None,
        }
    }
}

/// Contents of the `oci-layout` marker file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        Self {
            image_layout_version: IMAGE_LAYOUT_VERSION.to_string(),
        }
    }
}

/// A manifest document whose kind was decided from its media type.
#[derive(Debug)]
pub enum Manifest {
    Image(ImageManifest),
    Index(ImageIndex),
}

impl Manifest {
    /// Parses raw manifest bytes. When the media type is unknown the
    /// document shape decides: anything with a `manifests` array is an index.
    pub fn parse(bytes: &[u8], media_type: &str) -> Result<Self, serde_json::Error> {
        if media_types::is_index(media_type) {
            return Ok(Manifest::Index(serde_json::from_slice(bytes)?));
        }
        if media_types::is_manifest(media_type) {
            return Ok(Manifest::Image(serde_json::from_slice(bytes)?));
        }

        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if value.get("manifests").is_some() {
            Ok(Manifest::Index(serde_json::from_value(value)?))
        } else {
            Ok(Manifest::Image(serde_json::from_value(value)?))
        }
    }

    /// Blobs directly referenced by an image manifest: config first, then
    /// layers. Empty for an index.
    pub fn blobs(&self) -> Vec<&Descriptor> {
        match self {
            Manifest::Image(m) => std::iter::once(&m.config).chain(m.layers.iter()).collect(),
            Manifest::Index(_) => Vec::new(),
        }
    }

    /// Child manifests of an index. Empty for an image manifest.
    pub fn children(&self) -> &[Descriptor] {
        match self {
            Manifest::Image(_) => &[],
            Manifest::Index(i) => &i.manifests,
        }
    }
}

/// Media type declared inside a manifest body, if any.
pub fn embedded_media_type(bytes: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    }
    serde_json::from_slice::<Probe>(bytes)
        .ok()
        .and_then(|p| p.media_type)
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Splits `algorithm:hex`, checking the hex length for the algorithm and
/// that only lowercase hex characters are used.
pub fn split_digest(digest: &str) -> Result<(&str, &str), String> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| format!("digest {digest} is missing the algorithm"))?;

    let expected = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        other => return Err(format!("unsupported digest algorithm {other}")),
    };
    if hex.len() != expected {
        return Err(format!(
            "{algorithm} digest must have {expected} hex characters, got {}",
            hex.len()
        ));
    }
    if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(format!("digest {digest} must be lowercase hex"));
    }

    Ok((algorithm, hex))
}

/// Relative path of a blob inside an image layout.
pub fn blob_path(digest: &str) -> Result<PathBuf, String> {
    let (algorithm, hex) = split_digest(digest)?;
    Ok(PathBuf::from("blobs").join(algorithm).join(hex))
}
