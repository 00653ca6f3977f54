use std::env;
use std::path::PathBuf;

use stowage::imagestore::DEFAULT_CONCURRENCY;

const DEFAULT_STOWAGE_HOME: &str = "~/.stowage";

pub fn get_stowage_home() -> PathBuf {
    let stowage_home = env::var("STOWAGE_HOME").unwrap_or(DEFAULT_STOWAGE_HOME.to_string());
    expand_home(&stowage_home)
}

/// Images and blobs transferred at once.
pub fn get_concurrency() -> usize {
    env::var("STOWAGE_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_CONCURRENCY)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    }

    path.into()
}
