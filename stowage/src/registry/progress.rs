#[cfg(feature = "progress")]
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Observer for blob transfers, keyed by digest.
pub trait ProgressTracker: Send + Sync {
    fn start_transfer(&self, digest: &str, total_bytes: u64);
    fn update(&self, digest: &str, bytes: u64);
    fn finish(&self, digest: &str);
}

pub struct NoopProgress;

impl ProgressTracker for NoopProgress {
    fn start_transfer(&self, _digest: &str, _total_bytes: u64) {}
    fn update(&self, _digest: &str, _bytes: u64) {}
    fn finish(&self, _digest: &str) {}
}

#[cfg(feature = "progress")]
pub struct IndicatifProgress {
    multi: MultiProgress,
    bars: std::sync::Mutex<std::collections::HashMap<String, ProgressBar>>,
}

#[cfg(feature = "progress")]
impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// The bar container, for callers that draw their own bars alongside
    /// the transfer bars.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(feature = "progress")]
impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "progress")]
impl ProgressTracker for IndicatifProgress {
    fn start_transfer(&self, digest: &str, total_bytes: u64) {
        let pb = self.multi.add(ProgressBar::new(total_bytes));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        let short = digest.split_once(':').map_or(digest, |(_, hex)| hex);
        pb.set_message(format!("{}..", &short[..12.min(short.len())]));
        self.bars().insert(digest.to_string(), pb);
    }

    fn update(&self, digest: &str, bytes: u64) {
        if let Some(pb) = self.bars().get(digest) {
            pb.inc(bytes);
        }
    }

    fn finish(&self, digest: &str) {
        if let Some(pb) = self.bars().remove(digest) {
            pb.finish_and_clear();
        }
    }
}
