//! Local bundle storage under the stowage home directory.
//!
//! ```text
//! <home>/
//!   repositories.json   {"foo": {"1.0.0": "foo-1.0.0.json"}}
//!   bundles/foo-1.0.0.json
//!   logs/
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Result, StowageCliError};

/// Bundle name to version to file name under `bundles/`.
type Repositories = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bundles(&self) -> PathBuf {
        self.root.join("bundles")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn repositories(&self) -> PathBuf {
        self.root.join("repositories.json")
    }

    fn load_repositories(&self) -> Result<Repositories> {
        let path = self.repositories();
        if !path.exists() {
            return Ok(Repositories::new());
        }
        let bytes = std::fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StowageCliError::Input(format!("cannot parse {}: {e}", path.display())))
    }

    /// Resolves `name:version`, or a bare `name` to its highest version.
    pub fn bundle_path(&self, bundle: &str) -> Result<PathBuf> {
        let (name, version) = match bundle.rsplit_once(':') {
            Some((name, version)) => (name, Some(version)),
            None => (bundle, None),
        };
        if name.is_empty() || version.is_some_and(str::is_empty) {
            return Err(StowageCliError::Input(format!("invalid bundle reference {bundle:?}")));
        }

        let repositories = self.load_repositories()?;
        let not_found = || StowageCliError::NotFound(format!("bundle {bundle}"));
        let versions = repositories.get(name).ok_or_else(not_found)?;
        let file = match version {
            Some(version) => versions.get(version),
            None => versions.values().next_back(),
        }
        .ok_or_else(not_found)?;

        let path = self.bundles().join(file);
        if !path.is_file() {
            return Err(not_found());
        }
        Ok(path)
    }
}

/// Path of the manifest to export: `bundle` itself when it names a file,
/// otherwise the bundle stored in `home`.
pub fn resolve_bundle_file_path(
    bundle: &str,
    home: &Home,
    bundle_is_file: bool,
) -> Result<PathBuf> {
    if bundle_is_file {
        return Ok(PathBuf::from(bundle));
    }
    home.bundle_path(bundle)
}
