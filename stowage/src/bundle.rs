use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleLoadError {
    #[error("cannot read bundle {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse bundle {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid bundle {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// A parsed bundle manifest. Fields this crate does not use are ignored;
/// the original bytes are what goes into an archive.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub invocation_images: Vec<BundleImage>,
    #[serde(default)]
    pub images: IndexMap<String, BundleImage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleImage {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Bundle {
    /// Every image the bundle references: invocation images first, then
    /// component images in declaration order.
    pub fn images(&self) -> Vec<&BundleImage> {
        self.invocation_images
            .iter()
            .chain(self.images.values())
            .collect()
    }

    /// Default archive file name, `<name>-<version>.tgz`.
    pub fn archive_name(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            return Err("version must not be empty".to_string());
        }
        if let Some(image) = self.images().into_iter().find(|i| i.image.trim().is_empty()) {
            return Err(format!(
                "image entry with empty reference (digest {:?})",
                image.content_digest
            ));
        }
        Ok(())
    }
}

pub trait BundleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Bundle, BundleLoadError>;
}

/// Loads bundles stored as JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLoader;

impl BundleLoader for JsonLoader {
    fn load(&self, path: &Path) -> Result<Bundle, BundleLoadError> {
        let bytes = std::fs::read(path).map_err(|source| BundleLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let bundle: Bundle =
            serde_json::from_slice(&bytes).map_err(|source| BundleLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        bundle
            .validate()
            .map_err(|reason| BundleLoadError::Invalid {
                path: path.to_path_buf(),
                reason,
            })?;
        Ok(bundle)
    }
}
