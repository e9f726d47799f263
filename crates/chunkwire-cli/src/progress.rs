//! Terminal progress reporting for downloads

use chunkwire_core::client::DownloadObserver;
use chunkwire_core::error::DownloadError;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:20!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}";

/// One progress bar per file being downloaded
pub struct DownloadProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl DownloadProgress {
    /// Create an empty progress display
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        Self {
            multi: MultiProgress::new(),
            style,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, file: &str) -> Option<ProgressBar> {
        self.bars.lock().get(file).cloned()
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadObserver for DownloadProgress {
    fn on_file_start(&self, file: &str, size: u64, chunks: usize, attempt: u32) {
        let mut bars = self.bars.lock();
        let bar = bars.entry(file.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(size));
            bar.set_style(self.style.clone());
            bar.set_prefix(file.to_string());
            bar
        });
        bar.set_length(size);
        bar.set_position(0);
        if attempt > 1 {
            bar.set_message(format!("retry {attempt}, {chunks} chunks"));
        } else {
            bar.set_message(format!("{chunks} chunks"));
        }
    }

    fn on_chunk_complete(&self, file: &str, _sequence: u32, bytes: u64, attempts: u32) {
        if let Some(bar) = self.bar(file) {
            bar.inc(bytes);
            if attempts > 1 {
                bar.set_message(format!("recovered after {attempts} attempts"));
            }
        }
    }

    fn on_file_complete(&self, file: &str, path: &Path) {
        if let Some(bar) = self.bars.lock().remove(file) {
            bar.finish_with_message(format!("saved to {}", path.display()));
        }
    }

    fn on_file_failed(&self, file: &str, error: &DownloadError) {
        if let Some(bar) = self.bars.lock().remove(file) {
            bar.abandon_with_message(format!("failed: {error}"));
        }
    }
}
